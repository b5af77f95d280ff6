//! Kubernetes platform: server-side apply plus live reads through the dynamic API.

use std::time::Instant;

use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use stagehand_core::{ApplyError, ProbeReport, ResourceSpec};
use stagehand_kubehub::{dynamic_api, readiness, ServedKinds};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{diff_summary, in_sync, node_budget_exceeded, strip_noisy, ApplyReceipt, Observation, Platform, FIELD_MANAGER};

pub struct KubePlatform {
    client: Client,
    kinds: RwLock<ServedKinds>,
    dry_run: bool,
}

impl KubePlatform {
    pub async fn connect(dry_run: bool) -> anyhow::Result<Self> {
        let client = stagehand_kubehub::client().await?;
        let kinds = ServedKinds::discover(client.clone()).await?;
        Ok(Self { client, kinds: RwLock::new(kinds), dry_run })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Resolve the dynamic API for `spec`, refreshing discovery once on a miss so
    /// kinds registered by an earlier stage (CRDs) become reachable.
    async fn api_for(&self, spec: &ResourceSpec) -> Result<Api<DynamicObject>, ApplyError> {
        {
            let kinds = self.kinds.read().await;
            if let Ok(kind) = kinds.resolve(&spec.api_version, &spec.id.kind) {
                return dynamic_api(self.client.clone(), kind, spec.namespace.as_deref())
                    .map_err(|e| ApplyError::Rejected(e.to_string()));
            }
        }
        debug!(resource = %spec.id, "kind not in discovery cache; refreshing");
        let fresh = ServedKinds::discover(self.client.clone())
            .await
            .map_err(|e| ApplyError::Unavailable(format!("{:#}", e)))?;
        let mut kinds = self.kinds.write().await;
        *kinds = fresh;
        let kind = kinds
            .resolve(&spec.api_version, &spec.id.kind)
            .map_err(|e| ApplyError::Rejected(e.to_string()))?;
        dynamic_api(self.client.clone(), kind, spec.namespace.as_deref()).map_err(|e| ApplyError::Rejected(e.to_string()))
    }

    async fn live(&self, api: &Api<DynamicObject>, name: &str) -> Result<Option<Json>, ApplyError> {
        let obj = api.get_opt(name).await.map_err(classify)?;
        obj.map(|o| serde_json::to_value(&o).map_err(|e| ApplyError::Unavailable(format!("decoding live object: {}", e))))
            .transpose()
    }
}

#[async_trait::async_trait]
impl Platform for KubePlatform {
    async fn observe(&self, spec: &ResourceSpec) -> Result<Observation, ApplyError> {
        if self.dry_run {
            // Nothing was persisted, so readiness is taken as satisfied.
            return Ok(Observation { present: false, in_sync: false, report: ProbeReport::ready("dry run") });
        }
        let api = self.api_for(spec).await?;
        let live = self.live(&api, &spec.id.name).await?;
        let report = readiness::evaluate(spec.readiness, live.as_ref());
        Ok(match live {
            Some(live) => Observation { present: true, in_sync: in_sync(&spec.payload, &live), report },
            None => Observation { present: false, in_sync: false, report },
        })
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<ApplyReceipt, ApplyError> {
        counter!("apply_attempts", 1u64);
        let t0 = Instant::now();
        if node_budget_exceeded(&spec.payload) {
            counter!("apply_err", 1u64);
            return Err(ApplyError::Rejected(format!("{} payload too complex", spec.id)));
        }
        let mut payload = spec.payload.clone();
        ensure_metadata(&mut payload, &spec.id.name, spec.namespace.as_deref())?;

        let api = self.api_for(spec).await?;
        let summary = match self.live(&api, &spec.id.name).await? {
            Some(live) => diff_summary(&strip_noisy(payload.clone()), &strip_noisy(live)),
            None => diff_summary(&strip_noisy(payload.clone()), &Json::Object(Default::default())),
        };

        let mut pp = PatchParams::apply(FIELD_MANAGER);
        if self.dry_run {
            pp = pp.dry_run();
        }
        let obj = match api.patch(&spec.id.name, &pp, &Patch::Apply(&payload)).await {
            Ok(o) => o,
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(resource = %spec.id, error = %e, "server-side apply failed");
                return Err(classify(e));
            }
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if self.dry_run {
            counter!("apply_dry_ok", 1u64);
        } else {
            counter!("apply_ok", 1u64);
        }
        info!(
            resource = %spec.id,
            dry_run = self.dry_run,
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "applied"
        );
        Ok(ApplyReceipt { dry_run: self.dry_run, revision: obj.metadata.resource_version, summary })
    }
}

/// 4xx API errors other than throttling are the payload's fault and not retried.
fn classify(e: kube::Error) -> ApplyError {
    match &e {
        kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429 => {
            ApplyError::Rejected(format!("{} ({})", ae.message, ae.reason))
        }
        _ => ApplyError::Unavailable(e.to_string()),
    }
}

fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) -> Result<(), ApplyError> {
    let obj = v.as_object_mut().ok_or_else(|| ApplyError::Rejected("payload is not an object".into()))?;
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| ApplyError::Rejected("metadata is not an object".into()))?;
    meta.insert("name".into(), Json::String(name.to_string()));
    if let Some(ns) = ns {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_metadata_fills_name_and_namespace() {
        let mut v = json!({ "apiVersion": "v1", "kind": "ConfigMap" });
        ensure_metadata(&mut v, "cfg", Some("shop")).unwrap();
        assert_eq!(v["metadata"]["name"], "cfg");
        assert_eq!(v["metadata"]["namespace"], "shop");

        let mut bad = json!({ "metadata": "nope" });
        assert!(matches!(ensure_metadata(&mut bad, "cfg", None), Err(ApplyError::Rejected(_))));
    }

    #[test]
    fn client_errors_are_rejections() {
        let ae = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "Invalid".into(),
                code,
            })
        };
        assert!(matches!(classify(ae(422)), ApplyError::Rejected(_)));
        assert!(matches!(classify(ae(429)), ApplyError::Unavailable(_)));
        assert!(matches!(classify(ae(503)), ApplyError::Unavailable(_)));
    }
}
