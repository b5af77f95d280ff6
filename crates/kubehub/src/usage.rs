//! Pod resource utilization from metrics-server, relative to container requests.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use stagehand_core::{MetricKind, MetricUnavailable, ResourceId};
use tracing::debug;

/// Average utilization (percent of requests) across the workload's running pods.
pub async fn workload_utilization(
    client: Client,
    namespace: &str,
    workload: &ResourceId,
    kind: MetricKind,
) -> Result<f64, MetricUnavailable> {
    let started = std::time::Instant::now();
    let unavailable = |reason: String| {
        counter!("usage_sample_failed", 1u64);
        MetricUnavailable { workload: workload.clone(), kind, reason }
    };
    let selector = workload_selector(client.clone(), namespace, workload).await.map_err(unavailable)?;

    let lp = ListParams::default().labels(&selector);
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = pods.list(&lp).await.map_err(|e| unavailable(format!("listing pods: {}", e)))?;
    let resource = resource_name(kind);
    let mut requests: BTreeMap<String, f64> = BTreeMap::new();
    for p in pods.items {
        let running = p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
        let Some(name) = p.metadata.name.clone() else { continue };
        if !running {
            continue;
        }
        let mut total = 0.0;
        for c in p.spec.iter().flat_map(|s| s.containers.iter()) {
            let req = c
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get(resource))
                .and_then(|q| parse_quantity(&q.0));
            match req {
                Some(v) => total += v,
                None => return Err(unavailable(format!("container {} in pod {} has no {} request", c.name, name, resource))),
            }
        }
        requests.insert(name, total);
    }
    if requests.is_empty() {
        return Err(unavailable("no running pods".into()));
    }

    let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
    let ar = ApiResource::from_gvk_with_plural(&gvk, "pods");
    let metrics_api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ar);
    let samples = metrics_api
        .list(&lp)
        .await
        .map_err(|e| unavailable(format!("reading pod metrics: {}", e)))?;
    let mut usage_by_pod: BTreeMap<String, f64> = BTreeMap::new();
    for m in samples.items {
        let Some(name) = m.metadata.name.clone() else { continue };
        usage_by_pod.insert(name, container_usage(&m.data, resource));
    }
    let (used, requested) = aggregate(&requests, &usage_by_pod).map_err(unavailable)?;
    let pct = used / requested * 100.0;
    histogram!("usage_sample_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(workload = %workload, %kind, pct, pods = requests.len(), "utilization sampled");
    Ok(pct)
}

/// Sum usage over pods that have both requests and a sample. Pods without a sample
/// are dropped so a lagging metrics-server does not read as idle capacity.
fn aggregate(requests: &BTreeMap<String, f64>, usage: &BTreeMap<String, f64>) -> Result<(f64, f64), String> {
    let mut used = 0.0;
    let mut requested = 0.0;
    for (pod, req) in requests {
        if let Some(u) = usage.get(pod) {
            used += u;
            requested += req;
        }
    }
    if requested <= 0.0 {
        return Err("no pod metrics for running pods".into());
    }
    Ok((used, requested))
}

fn resource_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Memory => "memory",
        _ => "cpu",
    }
}

fn container_usage(data: &Json, resource: &str) -> f64 {
    data.get("containers")
        .and_then(Json::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("usage").and_then(|u| u.get(resource)).and_then(Json::as_str))
        .filter_map(parse_quantity)
        .sum()
}

async fn workload_selector(client: Client, namespace: &str, workload: &ResourceId) -> Result<String, String> {
    let name = workload.name.as_str();
    let labels = match workload.kind.as_str() {
        "Deployment" => Api::<Deployment>::namespaced(client, namespace)
            .get(name)
            .await
            .map_err(|e| format!("reading workload: {}", e))?
            .spec
            .and_then(|s| s.selector.match_labels),
        "StatefulSet" => Api::<StatefulSet>::namespaced(client, namespace)
            .get(name)
            .await
            .map_err(|e| format!("reading workload: {}", e))?
            .spec
            .and_then(|s| s.selector.match_labels),
        "ReplicaSet" => Api::<ReplicaSet>::namespaced(client, namespace)
            .get(name)
            .await
            .map_err(|e| format!("reading workload: {}", e))?
            .spec
            .and_then(|s| s.selector.match_labels),
        other => return Err(format!("unsupported workload kind {}", other)),
    };
    let labels = labels.filter(|l| !l.is_empty()).ok_or_else(|| "workload has no matchLabels selector".to_string())?;
    Ok(labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
}

/// Parse a Kubernetes quantity (`250m`, `1.5`, `128Mi`, `2G`, `1e3`) into base units.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    for (suffix, mult) in SUFFIXES {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v * mult);
        }
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(s: &str, want: f64) {
        let got = parse_quantity(s).expect("quantity parses");
        assert!((got - want).abs() <= want.abs() * 1e-12, "{} -> {} (want {})", s, got, want);
    }

    #[test]
    fn parses_quantities() {
        approx("250m", 0.25);
        approx("500000n", 0.0005);
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("128Mi"), Some(134_217_728.0));
        assert_eq!(parse_quantity("1k"), Some(1000.0));
        assert_eq!(parse_quantity("1e3"), Some(1000.0));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("lots"), None);
    }

    #[test]
    fn sums_container_usage() {
        let data = serde_json::json!({
            "containers": [
                { "name": "app", "usage": { "cpu": "150m", "memory": "64Mi" } },
                { "name": "sidecar", "usage": { "cpu": "50m", "memory": "16Mi" } }
            ]
        });
        assert!((container_usage(&data, "cpu") - 0.2).abs() < 1e-9);
        assert_eq!(container_usage(&data, "memory"), 83_886_080.0);
    }

    #[test]
    fn aggregate_ignores_pods_without_samples() {
        let requests: BTreeMap<String, f64> = [("a".to_string(), 0.5), ("b".to_string(), 0.5)].into_iter().collect();
        let usage: BTreeMap<String, f64> = [("a".to_string(), 0.25)].into_iter().collect();
        assert_eq!(aggregate(&requests, &usage).unwrap(), (0.25, 0.5));
        assert!(aggregate(&requests, &BTreeMap::new()).is_err());
    }
}
