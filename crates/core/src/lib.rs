//! stagehand core types: resource specs, rollout state, selectors and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod cancel;
pub mod error;
pub mod labels;
pub mod state;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use error::{ApplyError, ConfigError, MetricUnavailable, PolicyError};
pub use labels::{Labels, Selector};
pub use state::{ResourceState, RolloutState, RolloutStatus};

pub mod prelude {
    pub use super::{
        AutoscaleTarget, MetricKind, MetricTarget, ProbeReport, Readiness, ResourceId, ResourceSpec,
    };
    pub use super::{ApplyError, ConfigError, MetricUnavailable, PolicyError};
    pub use super::{CancelHandle, CancelSignal, Labels, Selector};
    pub use super::{ResourceState, RolloutState, RolloutStatus};
}

/// Identity of a resource: `Kind/name`. Serialized as that string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("invalid resource id {:?} (expect Kind/name)", s)),
        }
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind-specific notion of "healthy and serving".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    /// Ready as soon as the platform accepted the payload.
    Immediate,
    /// Ready once the object can be read back.
    Exists,
    /// All desired replicas report ready (Deployment, StatefulSet, ...).
    Replicas,
    /// A Job reports a Complete condition.
    JobComplete,
    /// A load balancer address has been published (Ingress, LoadBalancer Service).
    Address,
}

impl Readiness {
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            "Deployment" | "StatefulSet" | "ReplicaSet" | "DaemonSet" => Readiness::Replicas,
            "Job" => Readiness::JobComplete,
            "Ingress" => Readiness::Address,
            _ => Readiness::Exists,
        }
    }

    /// Whether the sequencer has to poll for this predicate.
    pub fn is_gated(&self) -> bool {
        !matches!(self, Readiness::Immediate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Immediate => "immediate",
            Readiness::Exists => "exists",
            Readiness::Replicas => "replicas",
            Readiness::JobComplete => "job-complete",
            Readiness::Address => "address",
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Readiness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "immediate" => Ok(Readiness::Immediate),
            "exists" => Ok(Readiness::Exists),
            "replicas" => Ok(Readiness::Replicas),
            "job-complete" => Ok(Readiness::JobComplete),
            "address" => Ok(Readiness::Address),
            other => Err(format!(
                "unknown readiness {:?} (expect immediate|exists|replicas|job-complete|address)",
                other
            )),
        }
    }
}

/// A named resource definition. Immutable for the duration of a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub api_version: String,
    /// Namespace the payload lands in; `None` for cluster-scoped kinds or platform default.
    pub namespace: Option<String>,
    pub stage: u32,
    pub depends_on: Vec<ResourceId>,
    pub readiness: Readiness,
    /// Optional resources may fail without blocking their stage.
    pub optional: bool,
    pub timeout: Option<Duration>,
    /// Opaque declarative body handed to the platform.
    pub payload: serde_json::Value,
}

impl ResourceSpec {
    /// Builder entry used by tests and programmatic callers. Readiness defaults per kind.
    pub fn new(kind: &str, name: &str, stage: u32) -> Self {
        Self {
            id: ResourceId::new(kind, name),
            api_version: "v1".to_string(),
            namespace: None,
            stage,
            depends_on: Vec::new(),
            readiness: Readiness::for_kind(kind),
            optional: false,
            timeout: None,
            payload: serde_json::json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": { "name": name },
            }),
        }
    }

    pub fn depends_on(mut self, dep: ResourceId) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of a single readiness check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub ready: bool,
    /// Human readable observation, kept for diagnostics on timeout.
    pub detail: String,
}

impl ProbeReport {
    pub fn ready(detail: impl Into<String>) -> Self {
        Self { ready: true, detail: detail.into() }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self { ready: false, detail: detail.into() }
    }
}

/// Utilization metric the autoscaler can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum MetricKind {
    Cpu,
    Memory,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Cpu => f.write_str("cpu"),
            MetricKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(MetricKind::Cpu),
            "memory" => Ok(MetricKind::Memory),
            other => Err(format!("unsupported metric {:?} (expect cpu|memory)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricTarget {
    pub kind: MetricKind,
    /// Target utilization in percent of requested resources.
    pub target_percent: f64,
}

/// Declarative autoscaling bounds for one workload, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscaleTarget {
    pub workload: ResourceId,
    pub namespace: Option<String>,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<MetricTarget>,
}

impl AutoscaleTarget {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Autoscale { workload: self.workload.clone(), reason };
        if self.min_replicas < 1 {
            return Err(invalid("minReplicas must be at least 1".into()));
        }
        if self.min_replicas > self.max_replicas {
            return Err(invalid(format!(
                "minReplicas {} exceeds maxReplicas {}",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.metrics.is_empty() {
            return Err(invalid("no metrics configured".into()));
        }
        for m in &self.metrics {
            if !(m.target_percent.is_finite() && m.target_percent > 0.0) {
                return Err(invalid(format!("{} target must be a positive percentage", m.kind)));
            }
        }
        Ok(())
    }
}

/// Parse durations like `500ms`, `30s`, `5m`, `1h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration {:?}", s))?;
    let per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("invalid duration unit in {:?} (expect ms|s|m|h)", s)),
    };
    n.checked_mul(per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {:?} out of range", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_round_trips_through_json_map_keys() {
        let mut m = std::collections::BTreeMap::new();
        m.insert(ResourceId::new("Deployment", "backend"), 1u32);
        let s = serde_json::to_string(&m).unwrap();
        assert_eq!(s, r#"{"Deployment/backend":1}"#);
        let back: std::collections::BTreeMap<ResourceId, u32> = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn resource_id_rejects_malformed() {
        assert!("backend".parse::<ResourceId>().is_err());
        assert!("/x".parse::<ResourceId>().is_err());
        assert!("A/b/c".parse::<ResourceId>().is_err());
    }

    #[test]
    fn readiness_defaults_follow_kind() {
        assert_eq!(Readiness::for_kind("StatefulSet"), Readiness::Replicas);
        assert_eq!(Readiness::for_kind("Job"), Readiness::JobComplete);
        assert_eq!(Readiness::for_kind("ConfigMap"), Readiness::Exists);
        assert!(!Readiness::Immediate.is_gated());
        assert_eq!("job-complete".parse::<Readiness>().unwrap(), Readiness::JobComplete);
    }

    #[test]
    fn durations_parse_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("9999999999999999h").unwrap_err().contains("out of range"));
        assert!(parse_duration("999999999999999999999s").is_err());
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn autoscale_target_bounds_are_checked() {
        let mut t = AutoscaleTarget {
            workload: ResourceId::new("Deployment", "api"),
            namespace: None,
            min_replicas: 0,
            max_replicas: 3,
            metrics: vec![MetricTarget { kind: MetricKind::Cpu, target_percent: 70.0 }],
        };
        assert!(t.validate().is_err());
        t.min_replicas = 4;
        assert!(t.validate().is_err());
        t.min_replicas = 2;
        assert!(t.validate().is_ok());
        t.metrics[0].target_percent = 0.0;
        assert!(t.validate().is_err());
    }
}
