//! skala kubehub – discovery-backed access to the managed resource, its
//! scale subresource, and the pods behind it.
//!
//! The rest of the pipeline treats the cluster as opaque: resources are
//! raw JSON values, and the only typed surface is the scale subresource
//! (replicas + pod selector).

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use skala_core::TargetRef;

/// Replica count and pod selector read from a scale subresource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleState {
    pub replicas: i32,
    pub selector: Option<String>,
}

/// Cluster operations the pipeline depends on. Implemented by [`KubeHub`]
/// against a live cluster and by [`mock::MockCluster`] in tests.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the managed resource as raw JSON.
    async fn get_resource(&self, target: &TargetRef, namespace: &str) -> Result<serde_json::Value>;

    /// Read the scale subresource for the managed resource.
    async fn get_scale(&self, target: &TargetRef, namespace: &str) -> Result<ScaleState>;

    /// JSON-patch `spec.replicas` on the scale subresource.
    async fn patch_replicas(&self, target: &TargetRef, namespace: &str, replicas: i32)
        -> Result<()>;

    /// List pods in `namespace` matching a label selector string, as raw JSON.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<serde_json::Value>>;
}

/// Optional side gatherer producing built-in Kubernetes metrics for a
/// label selector. The metric specs are forwarded opaquely.
#[async_trait]
pub trait KubernetesMetricsGatherer: Send + Sync {
    async fn gather(
        &self,
        specs: &[serde_json::Value],
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<serde_json::Value>>;
}

/// Live-cluster [`ClusterClient`] using kube Discovery to resolve the
/// scale target once and cache the resolved `ApiResource`.
pub struct KubeHub {
    client: Client,
    resolved: OnceCell<(ApiResource, bool)>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: OnceCell::new() }
    }

    /// Connect using the default kubeconfig / in-cluster environment.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// A metrics.k8s.io gatherer sharing this hub's client.
    pub fn metrics_gatherer(&self) -> MetricsApiGatherer {
        MetricsApiGatherer::new(self.client.clone())
    }

    async fn dynamic_api(&self, target: &TargetRef, namespace: &str) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self
            .resolved
            .get_or_try_init(|| async {
                let gvk = parse_api_version(&target.api_version, &target.kind)?;
                let resolved = find_api_resource(self.client.clone(), &gvk).await?;
                info!(
                    group = %resolved.0.group,
                    version = %resolved.0.version,
                    kind = %resolved.0.kind,
                    namespaced = resolved.1,
                    "resolved scale target"
                );
                Ok::<_, anyhow::Error>(resolved)
            })
            .await?
            .clone();
        Ok(if namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait]
impl ClusterClient for KubeHub {
    async fn get_resource(&self, target: &TargetRef, namespace: &str) -> Result<serde_json::Value> {
        let api = self.dynamic_api(target, namespace).await?;
        let obj = api
            .get(&target.name)
            .await
            .with_context(|| format!("getting {} '{}'", target.kind, target.name))?;
        let mut raw = serde_json::to_value(&obj).context("serializing managed resource")?;
        strip_managed_fields(&mut raw);
        Ok(raw)
    }

    async fn get_scale(&self, target: &TargetRef, namespace: &str) -> Result<ScaleState> {
        let api = self.dynamic_api(target, namespace).await?;
        let scale = api
            .get_scale(&target.name)
            .await
            .with_context(|| format!("getting scale subresource of {} '{}'", target.kind, target.name))?;
        Ok(scale_state(&scale))
    }

    async fn patch_replicas(
        &self,
        target: &TargetRef,
        namespace: &str,
        replicas: i32,
    ) -> Result<()> {
        let api = self.dynamic_api(target, namespace).await?;
        let patch = replicas_patch(replicas)?;
        debug!(name = %target.name, replicas, "patching scale subresource");
        api.patch_scale(&target.name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .with_context(|| format!("patching scale subresource of {} '{}'", target.kind, target.name))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<serde_json::Value>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        let pods = api.list(&lp).await.context("listing pods")?;
        pods.items
            .iter()
            .map(|p| {
                let mut raw = serde_json::to_value(p).context("serializing pod")?;
                strip_managed_fields(&mut raw);
                Ok(raw)
            })
            .collect()
    }
}

/// Lists `metrics.k8s.io/v1beta1` PodMetrics through the same dynamic
/// discovery machinery as the rest of the hub.
pub struct MetricsApiGatherer {
    client: Client,
}

impl MetricsApiGatherer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubernetesMetricsGatherer for MetricsApiGatherer {
    async fn gather(
        &self,
        specs: &[serde_json::Value],
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let gvk = GroupVersionKind {
            group: "metrics.k8s.io".to_string(),
            version: "v1beta1".to_string(),
            kind: "PodMetrics".to_string(),
        };
        let (ar, _) = find_api_resource(self.client.clone(), &gvk)
            .await
            .context("metrics.k8s.io is not served by this cluster")?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        let list = api.list(&lp).await.context("listing pod metrics")?;
        debug!(specs = specs.len(), items = list.items.len(), "gathered pod metrics");
        list.items
            .iter()
            .map(|m| serde_json::to_value(m).context("serializing pod metrics"))
            .collect()
    }
}

/// Split an `apiVersion` (`v1` or `group/version`) into a GVK.
fn parse_api_version(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    if version.is_empty() || kind.is_empty() {
        return Err(anyhow!(
            "invalid scale target: apiVersion '{}' kind '{}'",
            api_version,
            kind
        ));
    }
    Ok(GroupVersionKind { group, version, kind: kind.to_string() })
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// The JSON-patch replacing `spec.replicas`. Custom-resource scale
/// subresources do not reliably accept merge patches, so the patch kind
/// is never negotiated.
fn replicas_patch(replicas: i32) -> Result<json_patch::Patch> {
    serde_json::from_value(serde_json::json!([
        {"op": "replace", "path": "/spec/replicas", "value": replicas}
    ]))
    .context("building replicas patch")
}

fn scale_state(scale: &Scale) -> ScaleState {
    ScaleState {
        replicas: scale.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
        selector: scale.status.as_ref().and_then(|s| s.selector.clone()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub mod mock {
    //! In-memory [`ClusterClient`] fake for tests across the workspace.

    use super::*;
    use std::sync::Mutex;

    pub struct MockCluster {
        pub resource: serde_json::Value,
        pub scale: ScaleState,
        pub pods: Vec<serde_json::Value>,
        /// Replica values patched, in order.
        pub patches: Mutex<Vec<i32>>,
        pub fail_patch: bool,
    }

    impl Default for MockCluster {
        fn default() -> Self {
            Self {
                resource: serde_json::json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": "app", "namespace": "default"},
                }),
                scale: ScaleState { replicas: 1, selector: Some("app=app".to_string()) },
                pods: Vec::new(),
                patches: Mutex::new(Vec::new()),
                fail_patch: false,
            }
        }
    }

    impl MockCluster {
        pub fn with_replicas(replicas: i32) -> Self {
            Self { scale: ScaleState { replicas, selector: Some("app=app".to_string()) }, ..Self::default() }
        }

        pub fn patched(&self) -> Vec<i32> {
            self.patches.lock().unwrap().clone()
        }

        /// A pod JSON value with just enough shape for the pipeline.
        pub fn pod(name: &str) -> serde_json::Value {
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name, "namespace": "default"},
            })
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn get_resource(
            &self,
            _target: &TargetRef,
            _namespace: &str,
        ) -> Result<serde_json::Value> {
            Ok(self.resource.clone())
        }

        async fn get_scale(&self, _target: &TargetRef, _namespace: &str) -> Result<ScaleState> {
            Ok(self.scale.clone())
        }

        async fn patch_replicas(
            &self,
            _target: &TargetRef,
            _namespace: &str,
            replicas: i32,
        ) -> Result<()> {
            if self.fail_patch {
                return Err(anyhow!("patch refused"));
            }
            self.patches.lock().unwrap().push(replicas);
            Ok(())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _selector: &str,
        ) -> Result<Vec<serde_json::Value>> {
            Ok(self.pods.clone())
        }
    }
}
