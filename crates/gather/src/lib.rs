//! skala gather: runs the metric stage.
//!
//! Fans external metric collection out per pod or per resource, wrapped
//! by optional pre/post metric hooks and an optional Kubernetes metrics
//! phase. Every external program receives the stage's `MetricInfo` as
//! JSON on stdin.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use skala_core::{Config, Method, MetricInfo, ResourceMetric, RUN_MODE_PER_POD, RUN_MODE_PER_RESOURCE};
use skala_exec::Executer;
use skala_kubehub::{ClusterClient, KubernetesMetricsGatherer};

pub struct MetricGatherer {
    executer: Arc<dyn Executer>,
    cluster: Arc<dyn ClusterClient>,
    k8s_metrics: Option<Arc<dyn KubernetesMetricsGatherer>>,
    config: Arc<Config>,
}

impl MetricGatherer {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterClient>,
        executer: Arc<dyn Executer>,
        k8s_metrics: Option<Arc<dyn KubernetesMetricsGatherer>>,
    ) -> Self {
        Self { executer, cluster, k8s_metrics, config }
    }

    /// Collect metrics for the managed resource described by `info`.
    /// `selector` is the label selector from the scale subresource status
    /// (empty when the workload exposes none).
    pub async fn get_metrics(
        &self,
        mut info: MetricInfo,
        selector: &str,
    ) -> Result<Vec<ResourceMetric>> {
        if !self.config.kubernetes_metric_specs.is_empty() {
            info.kubernetes_metrics = self.kubernetes_metrics_phase(selector).await?;
        }
        match self.config.run_mode.as_str() {
            RUN_MODE_PER_RESOURCE => self.per_resource(info).await,
            RUN_MODE_PER_POD => self.per_pod(info, selector).await,
            mode => Err(anyhow!("unknown run mode: {}", mode)),
        }
    }

    async fn kubernetes_metrics_phase(
        &self,
        selector: &str,
    ) -> Result<Option<Vec<serde_json::Value>>> {
        let gatherer = match &self.k8s_metrics {
            Some(gatherer) => gatherer,
            None if self.config.require_kubernetes_metrics => {
                return Err(anyhow!("Kubernetes metrics required but no gatherer is available"))
            }
            None => return Ok(None),
        };
        match gatherer
            .gather(&self.config.kubernetes_metric_specs, &self.config.namespace, selector)
            .await
        {
            Ok(metrics) => Ok(Some(metrics)),
            Err(err) if self.config.require_kubernetes_metrics => {
                Err(err.context("failed to gather Kubernetes metrics"))
            }
            Err(err) => {
                warn!(error = %err, "continuing without Kubernetes metrics");
                Ok(None)
            }
        }
    }

    async fn per_resource(&self, mut info: MetricInfo) -> Result<Vec<ResourceMetric>> {
        let payload = serde_json::to_string(&info).context("marshalling metric info")?;
        self.run_hook(self.config.pre_metric.as_ref(), "pre-metric", &payload).await?;

        let value = self
            .executer
            .execute_with_value(self.metric_method()?, &payload)
            .await
            .context("failed to gather metrics")?;
        let metrics = vec![ResourceMetric { resource: resource_name(&info.resource)?, value }];

        info.metrics = Some(metrics.clone());
        let payload = serde_json::to_string(&info).context("marshalling metric info")?;
        self.run_hook(self.config.post_metric.as_ref(), "post-metric", &payload).await?;
        Ok(metrics)
    }

    async fn per_pod(&self, mut info: MetricInfo, selector: &str) -> Result<Vec<ResourceMetric>> {
        let pods = self
            .cluster
            .list_pods(&self.config.namespace, selector)
            .await
            .context("failed to list pods")?;
        debug!(pods = pods.len(), selector, "gathering per-pod metrics");

        let payload = serde_json::to_string(&info).context("marshalling metric info")?;
        self.run_hook(self.config.pre_metric.as_ref(), "pre-metric", &payload).await?;

        let method = self.metric_method()?;
        let mut metrics = Vec::with_capacity(pods.len());
        for pod in &pods {
            let name = resource_name(pod)?;
            let pod_info = MetricInfo {
                resource: pod.clone(),
                run_type: info.run_type,
                metrics: None,
                kubernetes_metrics: info.kubernetes_metrics.clone(),
            };
            let payload = serde_json::to_string(&pod_info).context("marshalling metric info")?;
            let value = self
                .executer
                .execute_with_value(method, &payload)
                .await
                .with_context(|| format!("failed to gather metrics for pod '{}'", name))?;
            metrics.push(ResourceMetric { resource: name, value });
        }

        info.metrics = Some(metrics.clone());
        let payload = serde_json::to_string(&info).context("marshalling metric info")?;
        self.run_hook(self.config.post_metric.as_ref(), "post-metric", &payload).await?;
        Ok(metrics)
    }

    fn metric_method(&self) -> Result<&Method> {
        self.config.metric.as_ref().ok_or_else(|| anyhow!("no metric method configured"))
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

fn resource_name(resource: &serde_json::Value) -> Result<String> {
    resource
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
        .map(|n| n.to_string())
        .ok_or_else(|| anyhow!("resource has no metadata.name"))
}
