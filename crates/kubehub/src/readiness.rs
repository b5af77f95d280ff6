//! Kind-specific readiness predicates evaluated over a live object.

use serde_json::Value as Json;
use stagehand_core::{ProbeReport, Readiness};

/// Evaluate `readiness` against the live object (`None` when it does not exist yet).
pub fn evaluate(readiness: Readiness, live: Option<&Json>) -> ProbeReport {
    let Some(obj) = live else {
        return ProbeReport::not_ready("object not found");
    };
    match readiness {
        Readiness::Immediate | Readiness::Exists => ProbeReport::ready("object present"),
        Readiness::Replicas => replicas(obj),
        Readiness::JobComplete => job_complete(obj),
        Readiness::Address => address(obj),
    }
}

fn int(v: Option<&Json>) -> Option<i64> {
    v.and_then(Json::as_i64)
}

fn replicas(obj: &Json) -> ProbeReport {
    let status = obj.get("status");
    let generation = int(obj.get("metadata").and_then(|m| m.get("generation")));
    let observed = int(status.and_then(|s| s.get("observedGeneration")));
    if let (Some(g), o) = (generation, observed) {
        if o.unwrap_or(0) < g {
            return ProbeReport::not_ready(format!("waiting for controller to observe generation {}", g));
        }
    }
    let is_daemonset = obj.get("kind").and_then(Json::as_str) == Some("DaemonSet");
    let (desired, ready, updated) = if is_daemonset {
        (
            int(status.and_then(|s| s.get("desiredNumberScheduled"))).unwrap_or(0),
            int(status.and_then(|s| s.get("numberReady"))).unwrap_or(0),
            int(status.and_then(|s| s.get("updatedNumberScheduled"))),
        )
    } else {
        (
            int(obj.get("spec").and_then(|s| s.get("replicas"))).unwrap_or(1),
            int(status.and_then(|s| s.get("readyReplicas"))).unwrap_or(0),
            int(status.and_then(|s| s.get("updatedReplicas"))),
        )
    };
    let updated = updated.unwrap_or(ready);
    let detail = format!("{}/{} replicas ready, {} updated", ready, desired, updated);
    if ready >= desired && updated >= desired {
        ProbeReport::ready(detail)
    } else {
        ProbeReport::not_ready(detail)
    }
}

fn condition<'a>(obj: &'a Json, kind: &str) -> Option<&'a Json> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Json::as_str) == Some(kind) && c.get("status").and_then(Json::as_str) == Some("True"))
}

fn job_complete(obj: &Json) -> ProbeReport {
    if condition(obj, "Complete").is_some() {
        return ProbeReport::ready("job complete");
    }
    if let Some(c) = condition(obj, "Failed") {
        let reason = c.get("reason").and_then(Json::as_str).unwrap_or("unknown");
        return ProbeReport::not_ready(format!("job failed: {}", reason));
    }
    let succeeded = int(obj.get("status").and_then(|s| s.get("succeeded"))).unwrap_or(0);
    ProbeReport::not_ready(format!("job running, {} succeeded", succeeded))
}

fn address(obj: &Json) -> ProbeReport {
    let entries = obj
        .get("status")
        .and_then(|s| s.get("loadBalancer"))
        .and_then(|lb| lb.get("ingress"))
        .and_then(Json::as_array);
    let addrs: Vec<&str> = entries
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("ip").or_else(|| e.get("hostname")).and_then(Json::as_str))
        .collect();
    if addrs.is_empty() {
        ProbeReport::not_ready("no load balancer address yet")
    } else {
        ProbeReport::ready(format!("address {}", addrs.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_object_is_never_ready() {
        for r in [Readiness::Immediate, Readiness::Exists, Readiness::Replicas] {
            assert!(!evaluate(r, None).ready);
        }
    }

    #[test]
    fn deployment_needs_all_replicas_ready_and_updated() {
        let mut d = json!({
            "kind": "Deployment",
            "metadata": { "generation": 2 },
            "spec": { "replicas": 3 },
            "status": { "observedGeneration": 2, "readyReplicas": 2, "updatedReplicas": 3 }
        });
        let r = evaluate(Readiness::Replicas, Some(&d));
        assert!(!r.ready);
        assert_eq!(r.detail, "2/3 replicas ready, 3 updated");
        d["status"]["readyReplicas"] = json!(3);
        assert!(evaluate(Readiness::Replicas, Some(&d)).ready);
    }

    #[test]
    fn stale_generation_is_not_ready() {
        let d = json!({
            "kind": "StatefulSet",
            "metadata": { "generation": 4 },
            "spec": { "replicas": 1 },
            "status": { "observedGeneration": 3, "readyReplicas": 1 }
        });
        let r = evaluate(Readiness::Replicas, Some(&d));
        assert!(!r.ready);
        assert!(r.detail.contains("generation 4"));
    }

    #[test]
    fn daemonset_uses_scheduled_counts() {
        let d = json!({
            "kind": "DaemonSet",
            "status": { "desiredNumberScheduled": 2, "numberReady": 2, "updatedNumberScheduled": 2 }
        });
        assert!(evaluate(Readiness::Replicas, Some(&d)).ready);
    }

    #[test]
    fn job_conditions() {
        let done = json!({ "status": { "conditions": [ { "type": "Complete", "status": "True" } ] } });
        assert!(evaluate(Readiness::JobComplete, Some(&done)).ready);
        let failed = json!({ "status": { "conditions": [ { "type": "Failed", "status": "True", "reason": "BackoffLimitExceeded" } ] } });
        let r = evaluate(Readiness::JobComplete, Some(&failed));
        assert!(!r.ready);
        assert!(r.detail.contains("BackoffLimitExceeded"));
    }

    #[test]
    fn ingress_waits_for_address() {
        let pending = json!({ "status": { "loadBalancer": {} } });
        assert!(!evaluate(Readiness::Address, Some(&pending)).ready);
        let ready = json!({ "status": { "loadBalancer": { "ingress": [ { "hostname": "lb.example.com" } ] } } });
        let r = evaluate(Readiness::Address, Some(&ready));
        assert!(r.ready);
        assert_eq!(r.detail, "address lb.example.com");
    }
}
