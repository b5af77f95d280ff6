//! stagehand ops: the Kubernetes side of the autoscaler. Reads replica counts,
//! writes them through the scale subresource and samples pod utilization.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use stagehand_autoscale::{MetricsSource, Scaler};
use stagehand_core::{AutoscaleTarget, MetricKind, MetricUnavailable};
use stagehand_kubehub::{dynamic_api, usage, ServedKinds};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Group/version of the scalable workload kinds the autoscaler targets.
fn workload_api_version(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => Some("apps/v1"),
        _ => None,
    }
}

/// Replica reads and writes against the API server.
pub struct KubeScaler {
    client: Client,
    kinds: OnceCell<ServedKinds>,
    use_subresource: bool,
}

impl KubeScaler {
    pub fn new(client: Client) -> Self {
        Self { client, kinds: OnceCell::new(), use_subresource: true }
    }

    /// Skip the scale subresource and patch `spec.replicas` directly.
    pub fn without_subresource(mut self) -> Self {
        self.use_subresource = false;
        self
    }

    async fn api(&self, target: &AutoscaleTarget) -> Result<Api<DynamicObject>> {
        let kind = target.workload.kind.as_str();
        let api_version = workload_api_version(kind).ok_or_else(|| anyhow!("{} is not a scalable kind", kind))?;
        let kinds = self
            .kinds
            .get_or_try_init(|| ServedKinds::discover(self.client.clone()))
            .await?;
        let served = kinds.resolve(api_version, kind)?;
        dynamic_api(self.client.clone(), served, target.namespace.as_deref())
    }
}

#[async_trait::async_trait]
impl Scaler for KubeScaler {
    async fn current_replicas(&self, target: &AutoscaleTarget) -> Result<u32> {
        let api = self.api(target).await?;
        let name = target.workload.name.as_str();
        if self.use_subresource {
            match api.get_scale(name).await {
                Ok(scale) => {
                    let replicas = scale.spec.and_then(|s| s.replicas).unwrap_or(0);
                    return u32::try_from(replicas).context("negative replica count");
                }
                Err(e) => debug!(workload = %target.workload, error = %e, "get_scale failed; reading spec.replicas"),
            }
        }
        let obj = api.get(name).await.with_context(|| format!("reading {}", target.workload))?;
        let replicas = obj.data.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_u64()).unwrap_or(1);
        u32::try_from(replicas).context("replica count out of range")
    }

    async fn scale(&self, target: &AutoscaleTarget, replicas: u32) -> Result<()> {
        let api = self.api(target).await?;
        let name = target.workload.name.as_str();
        let payload = serde_json::json!({ "spec": { "replicas": replicas } });
        if self.use_subresource {
            match api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&payload)).await {
                Ok(_) => {
                    counter!("ops_scale_ok", 1u64);
                    return Ok(());
                }
                Err(e) => warn!(workload = %target.workload, error = %e, "patch_scale failed; falling back to spec.replicas"),
            }
        }
        api.patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .with_context(|| format!("patching {} spec.replicas", target.workload))?;
        counter!("ops_scale_ok", 1u64);
        Ok(())
    }
}

/// Utilization from metrics.k8s.io, relative to pod requests.
pub struct KubeMetrics {
    client: Client,
}

impl KubeMetrics {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl MetricsSource for KubeMetrics {
    async fn utilization(&self, target: &AutoscaleTarget, kind: MetricKind) -> Result<f64, MetricUnavailable> {
        let ns = target.namespace.as_deref().ok_or_else(|| MetricUnavailable {
            workload: target.workload.clone(),
            kind,
            reason: "workload has no namespace".into(),
        })?;
        let res = usage::workload_utilization(self.client.clone(), ns, &target.workload, kind).await;
        if res.is_err() {
            counter!("ops_metric_unavailable", 1u64);
        }
        res
    }
}
