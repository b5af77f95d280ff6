//! Error taxonomy shared by every stagehand crate.

use crate::{MetricKind, ResourceId};

/// Invalid resource definitions. Detected before any side effect; never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{file}: {reason}")]
    Manifest { file: String, reason: String },
    #[error("{resource}: invalid annotation {key}: {reason}")]
    Annotation { resource: ResourceId, key: String, reason: String },
    #[error("duplicate resource {0}")]
    Duplicate(ResourceId),
    #[error("{resource}: unknown dependency {reference}")]
    UnknownDependency { resource: ResourceId, reference: String },
    #[error("{resource}: dependency {reference} is ambiguous (matches {})", join(.candidates))]
    AmbiguousDependency { resource: ResourceId, reference: String, candidates: Vec<ResourceId> },
    #[error("{0}: depends on itself")]
    SelfDependency(ResourceId),
    #[error("dependency cycle: {}", join(.0))]
    Cycle(Vec<ResourceId>),
    #[error("{resource} (stage {stage}) depends on {dependency} (stage {dependency_stage}); dependencies must sit in an earlier stage")]
    StageOrder { resource: ResourceId, stage: u32, dependency: ResourceId, dependency_stage: u32 },
    #[error("{0}: readiness-gated resource has no timeout and no default was supplied")]
    MissingTimeout(ResourceId),
    #[error("{workload}: invalid autoscaling spec: {reason}")]
    Autoscale { workload: ResourceId, reason: String },
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// The platform refused or could not take a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Malformed payload, quota exceeded, admission denied. Not retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transport or discovery failure; readiness polling treats this as transient.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// A metric read failed. The autoscaler skips the tick instead of reading zero.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} utilization unavailable for {workload}: {reason}")]
pub struct MetricUnavailable {
    pub workload: ResourceId,
    pub kind: MetricKind,
    pub reason: String,
}

/// Malformed selector or network rule. Raised at load time only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("malformed selector term {term:?}: {reason}")]
    Selector { term: String, reason: String },
    #[error("{policy}: {reason}")]
    Rule { policy: String, reason: String },
}

fn join(ids: &[ResourceId]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" -> ")
}
