//! skala core types – the wire model shared by every pipeline stage.
//!
//! Everything here crosses a process boundary: these structs are marshalled
//! to JSON and piped to the operator-supplied metric/evaluate programs and
//! their hooks, so field names are part of the external contract.

#![forbid(unsafe_code)]

pub mod config;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{Config, ConfigError, Method, Shell, TargetRef};

/// Run mode: collect one metric per pod behind the workload.
pub const RUN_MODE_PER_POD: &str = "per-pod";
/// Run mode: collect a single metric for the whole workload.
pub const RUN_MODE_PER_RESOURCE: &str = "per-resource";

/// What triggered a pipeline invocation. External programs receive the
/// wire string verbatim in their JSON payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunType {
    /// Periodic ticker invocation.
    #[serde(rename = "scaler")]
    Scaler,
    /// Live REST request.
    #[serde(rename = "api")]
    Api,
    /// Dry-run REST request; no scale call is made.
    #[serde(rename = "api_dry_run")]
    ApiDryRun,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scaler => "scaler",
            RunType::Api => "api",
            RunType::ApiDryRun => "api_dry_run",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single collected metric, keyed by the pod or workload it was
/// collected for. `value` is whatever the metric program printed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceMetric {
    pub resource: String,
    pub value: String,
}

/// Input to the metric stage; also the stdin payload of the metric
/// program and the pre/post metric hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricInfo {
    /// The managed resource (or, per pod in per-pod mode, the pod) as raw JSON.
    pub resource: serde_json::Value,
    pub run_type: RunType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<ResourceMetric>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_metrics: Option<Vec<serde_json::Value>>,
}

/// The replica-count decision produced by the evaluate program.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub target_replicas: i32,
}

/// Input to the evaluation stage; the stdin payload of the evaluate
/// program and its hooks. `evaluation` is filled for the post hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateInfo {
    pub metrics: Vec<ResourceMetric>,
    pub resource: serde_json::Value,
    pub run_type: RunType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
}

/// Input to the scale stage; the stdin payload of the pre/post scale
/// hooks. `target_replicas` carries the clamped and stabilized target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInfo {
    pub evaluation: Evaluation,
    pub resource: serde_json::Value,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_replicas: i32,
    pub namespace: String,
    pub scale_target_ref: TargetRef,
    pub run_type: RunType,
}

/// A past scale decision retained for downscale stabilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedEvaluation {
    pub time: chrono::DateTime<chrono::Utc>,
    pub evaluation: Evaluation,
}
