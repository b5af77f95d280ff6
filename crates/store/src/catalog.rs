//! Turning manifests into ResourceSpecs: orchestration annotations, dependency
//! resolution and stage inference.

use std::path::Path;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use stagehand_core::{
    parse_duration, AutoscaleTarget, ConfigError, MetricKind, MetricTarget, Readiness, ResourceId, ResourceSpec,
};
use tracing::{debug, info};

use crate::manifest::{self, Document};

pub const ANNOTATION_PREFIX: &str = "stagehand.io/";
pub const STAGE: &str = "stagehand.io/stage";
pub const DEPENDS_ON: &str = "stagehand.io/depends-on";
pub const READINESS: &str = "stagehand.io/readiness";
pub const OPTIONAL: &str = "stagehand.io/optional";
pub const TIMEOUT: &str = "stagehand.io/timeout";

/// Kinds that never carry a namespace.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "StorageClass",
    "IngressClass",
    "PriorityClass",
];

/// Stage a kind lands in when neither annotated nor pushed later by a dependency.
pub fn default_stage_for_kind(kind: &str) -> u32 {
    match kind {
        "Namespace" => 0,
        "Secret" | "ConfigMap" | "ServiceAccount" => 1,
        "NetworkPolicy" => 2,
        "ResourceQuota" | "LimitRange" => 3,
        "PersistentVolumeClaim" | "StatefulSet" => 4,
        "HorizontalPodAutoscaler" => 7,
        "Ingress" => 8,
        _ => 5,
    }
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Target namespace; overrides `metadata.namespace` of namespaced kinds.
    pub namespace: Option<String>,
    /// Add a stage-0 Namespace for the target namespace when none is defined.
    pub create_namespace: bool,
}

/// Immutable set of resource definitions for one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    specs: Vec<ResourceSpec>,
}

struct Raw {
    id: ResourceId,
    api_version: String,
    namespace: Option<String>,
    stage: Option<u32>,
    refs: Vec<String>,
    readiness: Readiness,
    optional: bool,
    timeout: Option<Duration>,
    payload: Json,
}

#[derive(Clone, Copy)]
enum Mark {
    Unvisited,
    Visiting,
    Done(u32),
}

impl Catalog {
    pub fn load(path: &Path, opts: &LoadOptions) -> Result<Self, ConfigError> {
        let docs = manifest::load_path(path)?;
        Self::from_documents(docs, opts)
    }

    pub fn from_documents(docs: Vec<Document>, opts: &LoadOptions) -> Result<Self, ConfigError> {
        let mut raws = Vec::with_capacity(docs.len() + 1);
        for doc in docs {
            raws.push(parse_document(doc, opts)?);
        }
        if opts.create_namespace {
            if let Some(ns) = opts.namespace.as_deref() {
                if !raws.iter().any(|r| r.id.kind == "Namespace" && r.id.name == ns) {
                    debug!(namespace = %ns, "synthesizing Namespace resource");
                    raws.insert(0, namespace_raw(ns));
                }
            }
        }

        let mut by_id: FxHashMap<ResourceId, usize> = FxHashMap::default();
        let mut by_name: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (i, r) in raws.iter().enumerate() {
            if by_id.insert(r.id.clone(), i).is_some() {
                return Err(ConfigError::Duplicate(r.id.clone()));
            }
            by_name.entry(r.id.name.clone()).or_default().push(i);
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(raws.len());
        for (i, r) in raws.iter().enumerate() {
            let mut out = Vec::with_capacity(r.refs.len());
            for reference in &r.refs {
                let j = resolve_ref(r, reference, &raws, &by_id, &by_name)?;
                if j == i {
                    return Err(ConfigError::SelfDependency(r.id.clone()));
                }
                if !out.contains(&j) {
                    out.push(j);
                }
            }
            deps.push(out);
        }

        let mut marks = vec![Mark::Unvisited; raws.len()];
        let mut path = Vec::new();
        let mut stages = Vec::with_capacity(raws.len());
        for i in 0..raws.len() {
            stages.push(infer_stage(i, &raws, &deps, &mut marks, &mut path)?);
        }

        let ids: Vec<ResourceId> = raws.iter().map(|r| r.id.clone()).collect();
        let specs: Vec<ResourceSpec> = raws
            .into_iter()
            .zip(deps.iter().zip(stages))
            .map(|(r, (d, stage))| ResourceSpec {
                depends_on: d.iter().map(|&j| ids[j].clone()).collect(),
                id: r.id,
                api_version: r.api_version,
                namespace: r.namespace,
                stage,
                readiness: r.readiness,
                optional: r.optional,
                timeout: r.timeout,
                payload: r.payload,
            })
            .collect();
        info!(resources = specs.len(), "catalog loaded");
        Ok(Self { specs })
    }

    pub fn from_specs(specs: Vec<ResourceSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    pub fn into_specs(self) -> Vec<ResourceSpec> {
        self.specs
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ResourceSpec> + 'a {
        self.specs.iter().filter(move |s| s.id.kind == kind)
    }

    /// Autoscaling bounds declared through HorizontalPodAutoscaler manifests.
    pub fn autoscale_targets(&self) -> Result<Vec<AutoscaleTarget>, ConfigError> {
        self.of_kind("HorizontalPodAutoscaler").map(autoscale_target).collect()
    }
}

fn resolve_ref(
    r: &Raw,
    reference: &str,
    raws: &[Raw],
    by_id: &FxHashMap<ResourceId, usize>,
    by_name: &FxHashMap<String, Vec<usize>>,
) -> Result<usize, ConfigError> {
    let unknown = || ConfigError::UnknownDependency { resource: r.id.clone(), reference: reference.to_string() };
    if reference.contains('/') {
        let id: ResourceId = reference.parse().map_err(|_| unknown())?;
        return by_id.get(&id).copied().ok_or_else(unknown);
    }
    match by_name.get(reference).map(Vec::as_slice) {
        None | Some([]) => Err(unknown()),
        Some([j]) => Ok(*j),
        Some(many) => Err(ConfigError::AmbiguousDependency {
            resource: r.id.clone(),
            reference: reference.to_string(),
            candidates: many.iter().map(|&j| raws[j].id.clone()).collect(),
        }),
    }
}

fn infer_stage(
    i: usize,
    raws: &[Raw],
    deps: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Result<u32, ConfigError> {
    match marks[i] {
        Mark::Done(s) => return Ok(s),
        Mark::Visiting => {
            let pos = path.iter().position(|&p| p == i).unwrap_or(0);
            let mut cycle: Vec<ResourceId> = path[pos..].iter().map(|&p| raws[p].id.clone()).collect();
            cycle.push(raws[i].id.clone());
            return Err(ConfigError::Cycle(cycle));
        }
        Mark::Unvisited => {}
    }
    if let Some(s) = raws[i].stage {
        marks[i] = Mark::Done(s);
        return Ok(s);
    }
    marks[i] = Mark::Visiting;
    path.push(i);
    let mut stage = default_stage_for_kind(&raws[i].id.kind);
    for &d in &deps[i] {
        stage = stage.max(infer_stage(d, raws, deps, marks, path)?.saturating_add(1));
    }
    path.pop();
    marks[i] = Mark::Done(stage);
    Ok(stage)
}

fn parse_document(doc: Document, opts: &LoadOptions) -> Result<Raw, ConfigError> {
    let Document { source, index, mut body } = doc;
    let manifest_err = |reason: &str| ConfigError::Manifest {
        file: source.clone(),
        reason: format!("document {}: {}", index, reason),
    };
    let api_version = body.get("apiVersion").and_then(Json::as_str).ok_or_else(|| manifest_err("missing apiVersion"))?.to_string();
    let kind = body.get("kind").and_then(Json::as_str).ok_or_else(|| manifest_err("missing kind"))?.to_string();
    let name = body
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .ok_or_else(|| manifest_err("missing metadata.name"))?
        .to_string();
    let id = ResourceId::new(kind, name);
    let annotations = take_annotations(&mut body);
    let annotation_err = |key: &str, reason: String| ConfigError::Annotation {
        resource: id.clone(),
        key: key.to_string(),
        reason,
    };

    let mut stage = None;
    let mut refs = Vec::new();
    let mut readiness = Readiness::for_kind(&id.kind);
    let mut optional = false;
    let mut timeout = None;
    for (key, value) in &annotations {
        match key.as_str() {
            STAGE => stage = Some(value.trim().parse::<u32>().map_err(|e| annotation_err(key, e.to_string()))?),
            DEPENDS_ON => refs.extend(value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)),
            READINESS => readiness = value.parse().map_err(|e: String| annotation_err(key, e))?,
            OPTIONAL => optional = value.trim().parse::<bool>().map_err(|e| annotation_err(key, e.to_string()))?,
            TIMEOUT => timeout = Some(parse_duration(value).map_err(|e| annotation_err(key, e))?),
            other => return Err(annotation_err(other, "unknown stagehand annotation".into())),
        }
    }

    let namespace = if is_cluster_scoped(&id.kind) {
        None
    } else {
        let doc_ns = body.get("metadata").and_then(|m| m.get("namespace")).and_then(Json::as_str).map(str::to_string);
        opts.namespace.clone().or(doc_ns)
    };
    if let (Some(ns), Some(meta)) = (namespace.as_deref(), body.get_mut("metadata").and_then(Json::as_object_mut)) {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }

    Ok(Raw { id, api_version, namespace, stage, refs, readiness, optional, timeout, payload: body })
}

/// Remove `stagehand.io/*` annotations from the payload and return them.
fn take_annotations(body: &mut Json) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Some(meta) = body.get_mut("metadata").and_then(Json::as_object_mut) else { return out };
    let Some(annos) = meta.get_mut("annotations").and_then(Json::as_object_mut) else { return out };
    let keys: Vec<String> = annos.keys().filter(|k| k.starts_with(ANNOTATION_PREFIX)).cloned().collect();
    for k in keys {
        if let Some(v) = annos.remove(&k) {
            let v = match v {
                Json::String(s) => s,
                other => other.to_string(),
            };
            out.push((k, v));
        }
    }
    if annos.is_empty() {
        meta.remove("annotations");
    }
    out
}

fn namespace_raw(ns: &str) -> Raw {
    Raw {
        id: ResourceId::new("Namespace", ns),
        api_version: "v1".into(),
        namespace: None,
        stage: Some(0),
        refs: Vec::new(),
        readiness: Readiness::Exists,
        optional: false,
        timeout: None,
        payload: serde_json::json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": ns } }),
    }
}

fn autoscale_target(spec: &ResourceSpec) -> Result<AutoscaleTarget, ConfigError> {
    let invalid = |reason: String| ConfigError::Autoscale { workload: spec.id.clone(), reason };
    let body = spec.payload.get("spec").ok_or_else(|| invalid("missing spec".into()))?;
    let target_ref = body.get("scaleTargetRef").ok_or_else(|| invalid("missing spec.scaleTargetRef".into()))?;
    let kind = target_ref.get("kind").and_then(Json::as_str).ok_or_else(|| invalid("scaleTargetRef.kind missing".into()))?;
    let name = target_ref.get("name").and_then(Json::as_str).ok_or_else(|| invalid("scaleTargetRef.name missing".into()))?;
    let as_u32 = |v: &Json| v.as_u64().and_then(|n| u32::try_from(n).ok());
    let min_replicas = match body.get("minReplicas") {
        None => 1,
        Some(v) => as_u32(v).ok_or_else(|| invalid("minReplicas must be a non-negative integer".into()))?,
    };
    let max_replicas = body
        .get("maxReplicas")
        .and_then(as_u32)
        .ok_or_else(|| invalid("maxReplicas missing or invalid".into()))?;

    let mut metrics = Vec::new();
    // autoscaling/v1
    if let Some(pct) = body.get("targetCPUUtilizationPercentage").and_then(Json::as_f64) {
        metrics.push(MetricTarget { kind: MetricKind::Cpu, target_percent: pct });
    }
    // autoscaling/v2
    for m in body.get("metrics").and_then(Json::as_array).into_iter().flatten() {
        if m.get("type").and_then(Json::as_str) != Some("Resource") {
            return Err(invalid("only Resource metrics are supported".into()));
        }
        let res = m.get("resource").ok_or_else(|| invalid("metric missing resource".into()))?;
        let kind: MetricKind = res
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| invalid("metric missing resource.name".into()))?
            .parse()
            .map_err(invalid)?;
        let pct = res
            .get("target")
            .and_then(|t| t.get("averageUtilization"))
            .and_then(Json::as_f64)
            .ok_or_else(|| invalid(format!("{} metric needs target.averageUtilization", kind)))?;
        metrics.push(MetricTarget { kind, target_percent: pct });
    }
    if metrics.is_empty() {
        metrics.push(MetricTarget { kind: MetricKind::Cpu, target_percent: 80.0 });
    }
    let target = AutoscaleTarget {
        workload: ResourceId::new(kind, name),
        namespace: spec.namespace.clone(),
        min_replicas,
        max_replicas,
        metrics,
    };
    target.validate()?;
    Ok(target)
}
