//! stagehand apply: the platform seam the sequencer drives, plus live-diff helpers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use stagehand_core::{ApplyError, ProbeReport, ResourceSpec};

pub mod cluster;

pub use cluster::KubePlatform;

/// Field manager recorded on every server-side apply.
pub const FIELD_MANAGER: &str = "stagehand";

fn max_payload_nodes() -> usize {
    std::env::var("STAGEHAND_MAX_PAYLOAD_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

/// What the platform currently holds for a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub present: bool,
    /// Live object already carries everything the payload asks for.
    pub in_sync: bool,
    pub report: ProbeReport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub dry_run: bool,
    pub revision: Option<String>,
    pub summary: DiffSummary,
}

/// Platform apply interface. Apply is create-or-update and idempotent.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Read the live state of `spec` and evaluate its readiness predicate.
    async fn observe(&self, spec: &ResourceSpec) -> Result<Observation, ApplyError>;

    /// Submit the payload. Returns once the platform acknowledged acceptance.
    async fn apply(&self, spec: &ResourceSpec) -> Result<ApplyReceipt, ApplyError>;
}

#[async_trait::async_trait]
impl<P: Platform + ?Sized> Platform for Arc<P> {
    async fn observe(&self, spec: &ResourceSpec) -> Result<Observation, ApplyError> {
        (**self).observe(spec).await
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<ApplyReceipt, ApplyError> {
        (**self).apply(spec).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// True when `live` already has every field of `target` with the same value.
/// Extra live fields (server defaults, status) do not count against sync.
pub fn in_sync(target: &Json, live: &Json) -> bool {
    let s = diff_summary(&strip_noisy(target.clone()), &strip_noisy(live.clone()));
    s.adds == 0 && s.updates == 0
}

pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        walk(&aa[i], &bb[i], s);
                    }
                }
                if aa.len() > bb.len() {
                    s.adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                }
            }
            // Scalars differ or type differs
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Cheap guard against pathological payloads before they reach the API server.
pub fn node_budget_exceeded(v: &Json) -> bool {
    let max = max_payload_nodes();
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "uid": "abc",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 2);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn server_defaults_do_not_break_sync() {
        let target = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api", "namespace": "shop" },
            "spec": { "replicas": 2 }
        });
        let mut live = target.clone();
        live["metadata"]["uid"] = json!("u-1");
        live["metadata"]["labels"] = json!({ "injected": "yes" });
        live["spec"]["strategy"] = json!({ "type": "RollingUpdate" });
        live["status"] = json!({ "readyReplicas": 2 });
        assert!(in_sync(&target, &live));
        live["spec"]["replicas"] = json!(3);
        assert!(!in_sync(&target, &live));
    }

    #[test]
    fn node_budget_is_enforced() {
        std::env::set_var("STAGEHAND_MAX_PAYLOAD_NODES", "10");
        let small = json!({ "a": 1 });
        let big = json!({ "items": (0..20).collect::<Vec<u32>>() });
        assert!(!node_budget_exceeded(&small));
        assert!(node_budget_exceeded(&big));
        std::env::remove_var("STAGEHAND_MAX_PAYLOAD_NODES");
    }
}
