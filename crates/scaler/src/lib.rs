//! skala scaler: applies a replica-count decision to the workload.
//!
//! Clamps the evaluation to the configured bounds, dampens downscales
//! over a rolling history window, runs the pre/post scale hooks, and
//! patches the scale subresource only when the target actually changes.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use skala_core::{Config, Evaluation, Method, ScaleInfo, TimestampedEvaluation};
use skala_exec::Executer;
use skala_kubehub::ClusterClient;

pub struct Scaler {
    cluster: Arc<dyn ClusterClient>,
    executer: Arc<dyn Executer>,
    config: Arc<Config>,
    /// Stabilization history; the only mutable shared state in the
    /// process. Mutated exclusively here, under the lock.
    history: Mutex<Vec<TimestampedEvaluation>>,
}

impl Scaler {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterClient>,
        executer: Arc<dyn Executer>,
    ) -> Self {
        Self { cluster, executer, config, history: Mutex::new(Vec::new()) }
    }

    /// Apply `info.evaluation` to the workload currently running
    /// `current_replicas`. Returns the evaluation that was enforced.
    pub async fn scale(&self, mut info: ScaleInfo, current_replicas: i32) -> Result<Evaluation> {
        let mut target = info.evaluation.target_replicas;
        if target < self.config.min_replicas {
            debug!(target, min = self.config.min_replicas, "clamping to minReplicas");
            target = self.config.min_replicas;
        }
        if target > self.config.max_replicas {
            debug!(target, max = self.config.max_replicas, "clamping to maxReplicas");
            target = self.config.max_replicas;
        }

        // A workload scaled to zero by hand stays at zero unless the
        // operator also allows zero via minReplicas.
        if current_replicas == 0 && self.config.min_replicas != 0 {
            info!(
                name = %info.scale_target_ref.name,
                "workload has zero replicas, autoscaling disabled"
            );
            return Ok(Evaluation { target_replicas: 0 });
        }

        target = self.stabilize(Utc::now(), target);

        info.evaluation.target_replicas = target;
        info.target_replicas = target;
        let payload = serde_json::to_string(&info).context("marshalling scale info")?;

        self.run_hook(self.config.pre_scale.as_ref(), "pre-scale", &payload).await?;

        if target != current_replicas {
            self.cluster
                .patch_replicas(&info.scale_target_ref, &info.namespace, target)
                .await
                .with_context(|| {
                    format!(
                        "failed to patch scale subresource for {} '{}'",
                        info.scale_target_ref.kind, info.scale_target_ref.name
                    )
                })?;
            info!(from = current_replicas, to = target, "scaled workload");
        } else {
            debug!(replicas = current_replicas, "target matches current replicas, no patch");
        }

        self.run_hook(self.config.post_scale.as_ref(), "post-scale", &payload).await?;
        Ok(info.evaluation)
    }

    /// Prune history to the stabilization window, record the new target,
    /// and return the maximum target within the window. With a zero
    /// window only the current decision survives, so the value passes
    /// through unchanged.
    fn stabilize(&self, now: DateTime<Utc>, target: i32) -> i32 {
        let window = Duration::seconds(self.config.downscale_stabilization as i64);
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.retain(|entry| now - entry.time <= window);
        history.push(TimestampedEvaluation {
            time: now,
            evaluation: Evaluation { target_replicas: target },
        });
        let stabilized = history
            .iter()
            .map(|entry| entry.evaluation.target_replicas)
            .max()
            .unwrap_or(target);
        if stabilized != target {
            debug!(target, stabilized, "downscale stabilization raised the target");
        }
        stabilized
    }

    async fn run_hook(&self, hook: Option<&Method>, stage: &str, payload: &str) -> Result<()> {
        if let Some(method) = hook {
            let output = self
                .executer
                .execute_with_value(method, payload)
                .await
                .with_context(|| format!("failed to run {stage} hook"))?;
            debug!(stage, output = %output, "hook finished");
        }
        Ok(())
    }
}
