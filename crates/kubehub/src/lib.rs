//! stagehand kubehub – client, discovery and live reads used by the rollout
//! and the autoscaler.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod readiness;
pub mod usage;

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared client built from the ambient kubeconfig / in-cluster config.
pub async fn client() -> Result<Client> {
    CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await
        .cloned()
}

/// A served kind with its scope.
#[derive(Debug, Clone)]
pub struct ServedKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Discovery results keyed by (group, version, kind). Run once per platform.
#[derive(Debug, Clone, Default)]
pub struct ServedKinds {
    by_gvk: FxHashMap<(String, String, String), ServedKind>,
}

impl ServedKinds {
    pub async fn discover(client: Client) -> Result<Self> {
        let started = std::time::Instant::now();
        let discovery = Discovery::new(client).run().await.context("running API discovery")?;
        let mut by_gvk = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let key = (ar.group.clone(), ar.version.clone(), ar.kind.clone());
                by_gvk.insert(key, ServedKind { resource: ar, namespaced });
            }
        }
        histogram!("discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("discovery_runs", 1u64);
        info!(kinds = by_gvk.len(), "discovery complete");
        Ok(Self { by_gvk })
    }

    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<&ServedKind> {
        let (group, version) = split_api_version(api_version);
        self.by_gvk
            .get(&(group.to_string(), version.to_string(), kind.to_string()))
            .ok_or_else(|| anyhow!("kind not served: {}/{}", api_version, kind))
    }

    pub fn len(&self) -> usize {
        self.by_gvk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gvk.is_empty()
    }
}

/// `apps/v1` -> ("apps", "v1"); `v1` -> ("", "v1").
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Dynamic API handle honoring the kind's scope.
pub fn dynamic_api(client: Client, kind: &ServedKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
    if kind.namespaced {
        let ns = namespace.ok_or_else(|| anyhow!("namespace required for namespaced kind {}", kind.resource.kind))?;
        debug!(kind = %kind.resource.kind, ns = %ns, "namespaced api");
        Ok(Api::namespaced_with(client, ns, &kind.resource))
    } else {
        Ok(Api::all_with(client, &kind.resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("networking.k8s.io/v1"), ("networking.k8s.io", "v1"));
    }
}
