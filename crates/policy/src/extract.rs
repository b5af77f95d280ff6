//! Allow rules derived from `NetworkPolicy` manifests.
//!
//! `spec.podSelector` picks the pods a policy protects. Each ingress `from`
//! peer becomes a source selector and each egress `to` peer a destination
//! selector; every listed port yields its own rule, and an empty peer or port
//! list widens to "any". Peers keyed by namespace or IP block cannot be
//! expressed with pod labels and are skipped.

use serde_json::Value as Json;
use stagehand_core::{PolicyError, ResourceSpec, Selector};
use tracing::{debug, warn};

use crate::{Direction, NetworkRule, RuleSet};

/// Collect the rules of every NetworkPolicy in `specs`.
pub fn rules_from_specs<'a>(specs: impl IntoIterator<Item = &'a ResourceSpec>) -> Result<RuleSet, PolicyError> {
    let mut set = RuleSet::new();
    for spec in specs.into_iter().filter(|s| s.id.kind == "NetworkPolicy") {
        set.extend(rules_from_manifest(&spec.payload)?);
    }
    debug!(rules = set.len(), "network rules loaded");
    Ok(set)
}

pub fn rules_from_manifest(manifest: &Json) -> Result<Vec<NetworkRule>, PolicyError> {
    let policy = manifest
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let spec = manifest.get("spec").cloned().unwrap_or(Json::Null);
    let target = label_selector(&policy, spec.get("podSelector"))?;

    let mut rules = Vec::new();
    for (dir, section, peer_key) in [(Direction::Ingress, "ingress", "from"), (Direction::Egress, "egress", "to")] {
        for entry in spec.get(section).and_then(Json::as_array).into_iter().flatten() {
            let peers = peer_selectors(&policy, entry.get(peer_key))?;
            let ports = ports(&policy, entry.get("ports"))?;
            for peer in &peers {
                for port in &ports {
                    let (source, destination) = match dir {
                        Direction::Ingress => (peer.clone(), target.clone()),
                        Direction::Egress => (target.clone(), peer.clone()),
                    };
                    rules.push(NetworkRule::new(source, destination, *port, dir));
                }
            }
        }
    }
    Ok(rules)
}

fn label_selector(policy: &str, v: Option<&Json>) -> Result<Selector, PolicyError> {
    let Some(v) = v.filter(|v| !v.is_null()) else {
        return Ok(Selector::any());
    };
    let invalid = |reason: &str| PolicyError::Rule { policy: policy.to_string(), reason: reason.to_string() };
    if v.get("matchExpressions").and_then(Json::as_array).is_some_and(|e| !e.is_empty()) {
        return Err(invalid("matchExpressions are not supported; use matchLabels"));
    }
    let mut pairs = Vec::new();
    if let Some(labels) = v.get("matchLabels").and_then(Json::as_object) {
        for (k, val) in labels {
            let val = val.as_str().ok_or_else(|| invalid(&format!("label {} must be a string", k)))?;
            pairs.push((k.clone(), val.to_string()));
        }
    }
    Selector::from_pairs(pairs)
}

fn peer_selectors(policy: &str, peers: Option<&Json>) -> Result<Vec<Selector>, PolicyError> {
    let Some(list) = peers.and_then(Json::as_array).filter(|l| !l.is_empty()) else {
        return Ok(vec![Selector::any()]);
    };
    let mut out = Vec::new();
    for peer in list {
        if peer.get("namespaceSelector").is_some() || peer.get("ipBlock").is_some() {
            warn!(policy = %policy, "namespace and ipBlock peers are not modelled; peer skipped");
            continue;
        }
        out.push(label_selector(policy, peer.get("podSelector"))?);
    }
    Ok(out)
}

fn ports(policy: &str, ports: Option<&Json>) -> Result<Vec<Option<u16>>, PolicyError> {
    let Some(list) = ports.and_then(Json::as_array).filter(|l| !l.is_empty()) else {
        return Ok(vec![None]);
    };
    let mut out = Vec::new();
    for p in list {
        if p.get("endPort").is_some() {
            return Err(PolicyError::Rule { policy: policy.to_string(), reason: "port ranges (endPort) are not supported".into() });
        }
        match p.get("port") {
            None => out.push(None),
            Some(Json::Number(n)) => {
                let port = n
                    .as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| PolicyError::Rule { policy: policy.to_string(), reason: format!("invalid port {}", n) })?;
                out.push(Some(port));
            }
            Some(other) => {
                warn!(policy = %policy, port = %other, "named ports are not modelled; port skipped");
            }
        }
    }
    Ok(out)
}
