//! skala engine: the ordered autoscale pipeline and the ticker that
//! drives it.
//!
//! One pipeline instance is shared by the ticker loop and the REST API;
//! the stages hold no per-invocation state, so concurrent invocations
//! only race on the scaler's stabilization history (which serializes
//! itself).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info};

use skala_core::{Config, EvaluateInfo, Evaluation, MetricInfo, ResourceMetric, RunType, ScaleInfo, TargetRef};
use skala_evaluate::Evaluator;
use skala_exec::Executer;
use skala_gather::MetricGatherer;
use skala_kubehub::{ClusterClient, KubernetesMetricsGatherer, ScaleState};
use skala_scaler::Scaler;

/// Ordered composition of the autoscale stages: get resource → get scale
/// subresource → gather metrics → evaluate → scale.
pub struct AutoscalePipeline {
    config: Arc<Config>,
    cluster: Arc<dyn ClusterClient>,
    gatherer: MetricGatherer,
    evaluator: Evaluator,
    scaler: Scaler,
}

impl AutoscalePipeline {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterClient>,
        executer: Arc<dyn Executer>,
        k8s_metrics: Option<Arc<dyn KubernetesMetricsGatherer>>,
    ) -> Self {
        let gatherer =
            MetricGatherer::new(config.clone(), cluster.clone(), executer.clone(), k8s_metrics);
        let evaluator = Evaluator::new(config.clone(), executer.clone());
        let scaler = Scaler::new(config.clone(), cluster.clone(), executer);
        Self { config, cluster, gatherer, evaluator, scaler }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Collect metrics only; backs `GET /metrics` and the first half of
    /// every evaluation.
    pub async fn metrics(&self, run_type: RunType) -> Result<Vec<ResourceMetric>> {
        let (resource, scale) = self.observe().await?;
        self.gather(resource, &scale, run_type).await
    }

    /// Run the full pipeline. A dry run stops after the evaluation and
    /// never touches the cluster or the stabilization history.
    pub async fn evaluate(&self, run_type: RunType, dry_run: bool) -> Result<Evaluation> {
        let (resource, scale) = self.observe().await?;
        let metrics = self.gather(resource.clone(), &scale, run_type).await?;

        let info = EvaluateInfo { metrics, resource: resource.clone(), run_type, evaluation: None };
        let evaluation = self.evaluator.get_evaluation(info).await?;
        if dry_run {
            debug!(target_replicas = evaluation.target_replicas, "dry run, skipping scale");
            return Ok(evaluation);
        }

        let scale_info = ScaleInfo {
            evaluation,
            resource,
            min_replicas: self.config.min_replicas,
            max_replicas: self.config.max_replicas,
            target_replicas: evaluation.target_replicas,
            namespace: self.config.namespace.clone(),
            scale_target_ref: self.target()?.clone(),
            run_type,
        };
        self.scaler.scale(scale_info, scale.replicas).await
    }

    /// One ticker-triggered run.
    pub async fn run_once(&self) -> Result<Evaluation> {
        self.evaluate(RunType::Scaler, false).await
    }

    async fn observe(&self) -> Result<(serde_json::Value, ScaleState)> {
        let target = self.target()?;
        let resource = self
            .cluster
            .get_resource(target, &self.config.namespace)
            .await
            .context("failed to get managed resource")?;
        let scale = self
            .cluster
            .get_scale(target, &self.config.namespace)
            .await
            .context("failed to get scale subresource")?;
        Ok((resource, scale))
    }

    async fn gather(
        &self,
        resource: serde_json::Value,
        scale: &ScaleState,
        run_type: RunType,
    ) -> Result<Vec<ResourceMetric>> {
        // The stage crates prefix their own failures ("failed to gather
        // metrics", "failed to run pre-scale hook", ...), so no second
        // wrap here.
        let info = MetricInfo { resource, run_type, metrics: None, kubernetes_metrics: None };
        self.gatherer.get_metrics(info, scale.selector.as_deref().unwrap_or("")).await
    }

    fn target(&self) -> Result<&TargetRef> {
        self.config.scale_target_ref.as_ref().ok_or_else(|| anyhow!("no scale target configured"))
    }
}

/// Delay aligning the first tick to a wall-clock multiple of `start_time`.
pub fn initial_delay_ms(start_time: u64, now_ms: u64) -> u64 {
    start_time - (now_ms % start_time)
}

/// Drive the pipeline until `shutdown` flips. The first tick is aligned
/// to a wall-clock multiple of the configured start time; subsequent
/// ticks ride the monotonic interval timer, so they do not drift.
pub async fn run_ticker(pipeline: Arc<AutoscalePipeline>, mut shutdown: watch::Receiver<bool>) {
    let config = pipeline.config();
    let start_time = config.start_time.max(1);
    let delay = initial_delay_ms(start_time, Utc::now().timestamp_millis() as u64);
    debug!(delay_ms = delay, "aligning first tick");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        _ = shutdown.changed() => {
            info!("ticker stopped before first tick");
            return;
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval));
    info!(interval_ms = config.interval, "autoscaler ticking");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match pipeline.run_once().await {
                    Ok(evaluation) => {
                        counter!("skala_ticks_total", 1);
                        debug!(target_replicas = evaluation.target_replicas, "tick complete");
                    }
                    // A failed tick is logged and retried on the next
                    // interval; only startup errors are fatal.
                    Err(err) => {
                        counter!("skala_tick_failures_total", 1);
                        error!(error = ?err, "autoscale run failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("ticker stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skala_core::{Method, Shell};
    use skala_exec::mock::MockExecuter;
    use skala_kubehub::mock::MockCluster;

    fn method(command: &str) -> Method {
        Method {
            typ: "shell".into(),
            timeout: None,
            shell: Some(Shell { entrypoint: "/bin/sh".into(), command: command.into() }),
        }
    }

    fn config() -> Config {
        Config {
            run_mode: skala_core::RUN_MODE_PER_RESOURCE.into(),
            scale_target_ref: Some(TargetRef {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "app".into(),
            }),
            metric: Some(method("/metric.sh")),
            evaluate: Some(method("/evaluate.sh")),
            ..Config::default()
        }
    }

    /// Metric program prints "5", evaluate program asks for `target`.
    fn staged_executer(target: i32) -> Arc<MockExecuter> {
        Arc::new(MockExecuter::new(Box::new(move |m, _| {
            Ok(match m.shell.as_ref().map(|s| s.command.as_str()) {
                Some("/metric.sh") => "5".to_string(),
                Some("/evaluate.sh") => format!("{{\"targetReplicas\":{target}}}"),
                other => panic!("unexpected invocation: {other:?}"),
            })
        })))
    }

    fn pipeline(
        config: Config,
        cluster: Arc<MockCluster>,
        executer: Arc<MockExecuter>,
    ) -> AutoscalePipeline {
        AutoscalePipeline::new(Arc::new(config), cluster, executer, None)
    }

    #[tokio::test]
    async fn stages_run_in_order_and_scale_patches() {
        let cluster = Arc::new(MockCluster::with_replicas(1));
        let executer = staged_executer(4);
        let p = pipeline(config(), cluster.clone(), executer.clone());
        let evaluation = p.run_once().await.unwrap();
        assert_eq!(evaluation, Evaluation { target_replicas: 4 });
        assert_eq!(
            executer.commands(),
            vec!["/metric.sh".to_string(), "/evaluate.sh".to_string()]
        );
        assert_eq!(cluster.patched(), vec![4]);
        // the evaluate payload carried the gathered metric
        let payload: serde_json::Value =
            serde_json::from_str(&executer.payloads()[1]).unwrap();
        assert_eq!(payload["metrics"][0], json!({"resource": "app", "value": "5"}));
    }

    #[tokio::test]
    async fn dry_run_skips_the_scale_stage() {
        let cluster = Arc::new(MockCluster::with_replicas(1));
        let executer = staged_executer(4);
        let p = pipeline(config(), cluster.clone(), executer.clone());
        let evaluation = p.evaluate(RunType::ApiDryRun, true).await.unwrap();
        // the raw evaluation comes back unclamped and nothing is patched
        assert_eq!(evaluation, Evaluation { target_replicas: 4 });
        assert!(cluster.patched().is_empty());
        let payload: serde_json::Value =
            serde_json::from_str(&executer.payloads()[0]).unwrap();
        assert_eq!(payload["runType"], json!("api_dry_run"));
    }

    #[tokio::test]
    async fn disabled_workload_reports_zero_without_patching() {
        let cluster = Arc::new(MockCluster::with_replicas(0));
        let p = pipeline(config(), cluster.clone(), staged_executer(4));
        let evaluation = p.run_once().await.unwrap();
        assert_eq!(evaluation, Evaluation { target_replicas: 0 });
        assert!(cluster.patched().is_empty());
    }

    #[tokio::test]
    async fn metrics_endpoint_path_gathers_without_evaluating() {
        let cluster = Arc::new(MockCluster::with_replicas(2));
        let executer = staged_executer(4);
        let p = pipeline(config(), cluster, executer.clone());
        let metrics = p.metrics(RunType::Api).await.unwrap();
        assert_eq!(metrics, vec![ResourceMetric { resource: "app".into(), value: "5".into() }]);
        assert_eq!(executer.commands(), vec!["/metric.sh".to_string()]);
    }

    #[tokio::test]
    async fn evaluate_failures_carry_the_stage_name() {
        let cluster = Arc::new(MockCluster::with_replicas(1));
        let executer = Arc::new(MockExecuter::new(Box::new(|m, _| {
            match m.shell.as_ref().map(|s| s.command.as_str()) {
                Some("/metric.sh") => Ok("5".to_string()),
                _ => Err(anyhow!("exit status: 1")),
            }
        })));
        let p = pipeline(config(), cluster, executer);
        let err = p.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to evaluate"));
    }

    #[test]
    fn initial_delay_aligns_to_the_modulus() {
        // 1ms modulus: effectively immediate
        assert_eq!(initial_delay_ms(1, 1_722_000_000_123), 1);
        // one-minute modulus part-way through a minute
        let now = 1_722_000_000_000u64; // some wall-clock ms
        let delay = initial_delay_ms(60_000, now);
        assert_eq!((now + delay) % 60_000, 0);
        assert!(delay >= 1 && delay <= 60_000);
    }

    #[tokio::test]
    async fn ticker_stops_on_shutdown() {
        let cluster = Arc::new(MockCluster::with_replicas(1));
        let p = Arc::new(pipeline(config(), cluster, staged_executer(1)));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_ticker(p, rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("ticker hung").unwrap();
    }
}
