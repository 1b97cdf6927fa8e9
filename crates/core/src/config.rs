//! Configuration: YAML file, lowercased env-var overrides, startup validation.
//!
//! The config is parsed once at startup and treated as read-only for the
//! process lifetime. Validation failures are fatal.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default timeout applied to a [`Method`] that does not declare one.
pub const DEFAULT_METHOD_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reference to the Kubernetes object whose replica count is managed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Shell launch description: `entrypoint` is argv[0] (e.g. `/bin/sh`),
/// `command` is passed as a single argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shell {
    pub entrypoint: String,
    pub command: String,
}

/// Declarative description of how to run an external program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Method {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Shell>,
}

impl Method {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_METHOD_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Milliseconds between pipeline runs.
    pub interval: u64,
    /// Wall-clock alignment modulus for the first tick, in milliseconds.
    pub start_time: u64,
    pub namespace: String,
    pub scale_target_ref: Option<TargetRef>,
    pub min_replicas: i32,
    pub max_replicas: i32,
    /// `per-pod` or `per-resource`; kept as a string and checked at the
    /// point of use so the gatherer can report an unknown mode.
    pub run_mode: String,
    pub metric: Option<Method>,
    pub evaluate: Option<Method>,
    /// Fleet-wide default timeout for the metric method, ms.
    pub metric_timeout: Option<u64>,
    /// Fleet-wide default timeout for the evaluate method, ms.
    pub evaluate_timeout: Option<u64>,
    pub pre_metric: Option<Method>,
    pub post_metric: Option<Method>,
    pub pre_evaluate: Option<Method>,
    pub post_evaluate: Option<Method>,
    pub pre_scale: Option<Method>,
    pub post_scale: Option<Method>,
    /// Downscale stabilization window, seconds.
    pub downscale_stabilization: u64,
    /// Opaque metric specs forwarded to the Kubernetes metrics gatherer.
    pub kubernetes_metric_specs: Vec<serde_json::Value>,
    pub require_kubernetes_metrics: bool,
    pub log_verbosity: u8,
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: 15_000,
            start_time: 1,
            namespace: "default".to_string(),
            scale_target_ref: None,
            min_replicas: 1,
            max_replicas: 10,
            run_mode: super::RUN_MODE_PER_POD.to_string(),
            metric: None,
            evaluate: None,
            metric_timeout: None,
            evaluate_timeout: None,
            pre_metric: None,
            post_metric: None,
            pre_evaluate: None,
            post_evaluate: None,
            pre_scale: None,
            post_scale: None,
            downscale_stabilization: 0,
            kubernetes_metric_specs: Vec::new(),
            require_kubernetes_metrics: false,
            log_verbosity: 0,
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Config {
    /// Load, apply env overrides and timeout defaults, and validate.
    /// A missing file is tolerated; the defaults plus env take over.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.apply_timeout_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Scalar options may be overridden by env vars named by the
    /// lowercased option name, e.g. `minreplicas=2`.
    fn apply_env_overrides(&mut self) {
        env_override("interval", &mut self.interval);
        env_override("starttime", &mut self.start_time);
        env_override("namespace", &mut self.namespace);
        env_override("minreplicas", &mut self.min_replicas);
        env_override("maxreplicas", &mut self.max_replicas);
        env_override("runmode", &mut self.run_mode);
        env_override("host", &mut self.host);
        env_override("port", &mut self.port);
        env_override("logverbosity", &mut self.log_verbosity);
        env_override("downscalestabilization", &mut self.downscale_stabilization);
        env_override("requirekubernetesmetrics", &mut self.require_kubernetes_metrics);
        env_override_opt("metrictimeout", &mut self.metric_timeout);
        env_override_opt("evaluatetimeout", &mut self.evaluate_timeout);
    }

    /// `metricTimeout`/`evaluateTimeout` act as defaults for the
    /// corresponding method; an explicit method timeout always wins.
    fn apply_timeout_defaults(&mut self) {
        if let (Some(method), Some(default)) = (self.metric.as_mut(), self.metric_timeout) {
            method.timeout.get_or_insert(default);
        }
        if let (Some(method), Some(default)) = (self.evaluate.as_mut(), self.evaluate_timeout) {
            method.timeout.get_or_insert(default);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::Invalid("interval must be > 0".into()));
        }
        if self.start_time == 0 {
            return Err(ConfigError::Invalid("startTime must be > 0".into()));
        }
        if self.min_replicas < 0 {
            return Err(ConfigError::Invalid("minReplicas must be >= 0".into()));
        }
        if self.max_replicas < self.min_replicas {
            return Err(ConfigError::Invalid(format!(
                "maxReplicas ({}) must be >= minReplicas ({})",
                self.max_replicas, self.min_replicas
            )));
        }
        if self.scale_target_ref.is_none() {
            return Err(ConfigError::Invalid("scaleTargetRef must be set".into()));
        }
        if self.metric.is_none() {
            return Err(ConfigError::Invalid("no metric method configured".into()));
        }
        if self.evaluate.is_none() {
            return Err(ConfigError::Invalid("no evaluate method configured".into()));
        }
        for (name, method) in self.methods() {
            if method.timeout_ms() == 0 {
                return Err(ConfigError::Invalid(format!("{name} timeout must be > 0")));
            }
        }
        Ok(())
    }

    /// Every configured method with its config key, for validation and logs.
    pub fn methods(&self) -> Vec<(&'static str, &Method)> {
        let slots = [
            ("metric", &self.metric),
            ("evaluate", &self.evaluate),
            ("preMetric", &self.pre_metric),
            ("postMetric", &self.post_metric),
            ("preEvaluate", &self.pre_evaluate),
            ("postEvaluate", &self.post_evaluate),
            ("preScale", &self.pre_scale),
            ("postScale", &self.post_scale),
        ];
        slots
            .into_iter()
            .filter_map(|(name, slot)| slot.as_ref().map(|m| (name, m)))
            .collect()
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

fn env_override_opt<T: FromStr>(key: &str, slot: &mut Option<T>) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = Some(v),
            Err(_) => warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_YAML: &str = r#"
interval: 10000
startTime: 60000
namespace: workloads
scaleTargetRef:
  apiVersion: apps/v1
  kind: Deployment
  name: my-app
minReplicas: 2
maxReplicas: 8
runMode: per-resource
downscaleStabilization: 120
metricTimeout: 2500
metric:
  type: shell
  shell:
    entrypoint: /bin/sh
    command: /metric.sh
evaluate:
  type: shell
  timeout: 7000
  shell:
    entrypoint: /bin/sh
    command: /evaluate.sh
preScale:
  type: shell
  shell:
    entrypoint: /bin/sh
    command: /notify.sh
logVerbosity: 1
host: 127.0.0.1
port: 8080
"#;

    #[test]
    fn parses_full_yaml() {
        let mut cfg: Config = serde_yaml::from_str(FULL_YAML).unwrap();
        cfg.apply_timeout_defaults();
        cfg.validate().unwrap();
        assert_eq!(cfg.interval, 10_000);
        assert_eq!(cfg.start_time, 60_000);
        assert_eq!(cfg.namespace, "workloads");
        let target = cfg.scale_target_ref.as_ref().unwrap();
        assert_eq!(target.api_version, "apps/v1");
        assert_eq!(target.kind, "Deployment");
        assert_eq!(target.name, "my-app");
        assert_eq!(cfg.run_mode, crate::RUN_MODE_PER_RESOURCE);
        assert_eq!(cfg.downscale_stabilization, 120);
        // metricTimeout fills the metric method's missing timeout...
        assert_eq!(cfg.metric.as_ref().unwrap().timeout_ms(), 2_500);
        // ...but an explicit method timeout wins.
        assert_eq!(cfg.evaluate.as_ref().unwrap().timeout_ms(), 7_000);
        let shell = cfg.pre_scale.as_ref().unwrap().shell.as_ref().unwrap();
        assert_eq!(shell.entrypoint, "/bin/sh");
        assert_eq!(shell.command, "/notify.sh");
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.interval, 15_000);
        assert_eq!(cfg.start_time, 1);
        assert_eq!(cfg.namespace, "default");
        assert_eq!(cfg.min_replicas, 1);
        assert_eq!(cfg.max_replicas, 10);
        assert_eq!(cfg.run_mode, crate::RUN_MODE_PER_POD);
        assert_eq!(cfg.downscale_stabilization, 0);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 5000);
        assert!(!cfg.require_kubernetes_metrics);
    }

    fn minimal_valid() -> Config {
        let method = Method {
            typ: "shell".into(),
            timeout: None,
            shell: Some(Shell { entrypoint: "/bin/sh".into(), command: "true".into() }),
        };
        Config {
            scale_target_ref: Some(TargetRef {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "app".into(),
            }),
            metric: Some(method.clone()),
            evaluate: Some(method),
            ..Config::default()
        }
    }

    #[test]
    fn validation_accepts_minimal_config() {
        minimal_valid().validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_replica_bounds() {
        let mut cfg = minimal_valid();
        cfg.min_replicas = 5;
        cfg.max_replicas = 2;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("maxReplicas"));

        cfg.min_replicas = -1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("minReplicas"));
    }

    #[test]
    fn validation_rejects_zero_interval_and_timeout() {
        let mut cfg = minimal_valid();
        cfg.interval = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal_valid();
        cfg.metric.as_mut().unwrap().timeout = Some(0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("metric timeout"));
    }

    #[test]
    fn validation_requires_target_and_methods() {
        let mut cfg = minimal_valid();
        cfg.scale_target_ref = None;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal_valid();
        cfg.evaluate = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("evaluate"));
    }

    #[test]
    fn env_overrides_apply_to_lowercased_names() {
        let mut cfg = minimal_valid();
        std::env::set_var("minreplicas", "3");
        std::env::set_var("runmode", "per-resource");
        std::env::set_var("downscalestabilization", "not-a-number");
        cfg.apply_env_overrides();
        std::env::remove_var("minreplicas");
        std::env::remove_var("runmode");
        std::env::remove_var("downscalestabilization");
        assert_eq!(cfg.min_replicas, 3);
        assert_eq!(cfg.run_mode, "per-resource");
        // unparseable values are ignored, not fatal
        assert_eq!(cfg.downscale_stabilization, 0);
    }
}
