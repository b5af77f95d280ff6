//! Control loop: one repeating tick per workload, serialized per workload.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use rustc_hash::FxHashMap;
use stagehand_core::{AutoscaleTarget, CancelSignal, ConfigError, MetricKind, MetricUnavailable, ResourceId};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::decision::{AutoscaleSpec, Decision, Reading, DEFAULT_COOLDOWN};

/// Supplies utilization readings. Failures must be reported, never read as zero.
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn utilization(&self, target: &AutoscaleTarget, kind: MetricKind) -> Result<f64, MetricUnavailable>;
}

/// Reads and sets a workload's replica count.
#[async_trait::async_trait]
pub trait Scaler: Send + Sync {
    async fn current_replicas(&self, target: &AutoscaleTarget) -> anyhow::Result<u32>;
    async fn scale(&self, target: &AutoscaleTarget, replicas: u32) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<T: MetricsSource + ?Sized> MetricsSource for Arc<T> {
    async fn utilization(&self, target: &AutoscaleTarget, kind: MetricKind) -> Result<f64, MetricUnavailable> {
        (**self).utilization(target, kind).await
    }
}

#[async_trait::async_trait]
impl<T: Scaler + ?Sized> Scaler for Arc<T> {
    async fn current_replicas(&self, target: &AutoscaleTarget) -> anyhow::Result<u32> {
        (**self).current_replicas(target).await
    }

    async fn scale(&self, target: &AutoscaleTarget, replicas: u32) -> anyhow::Result<()> {
        (**self).scale(target, replicas).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub interval: Duration,
    pub cooldown: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(15), cooldown: DEFAULT_COOLDOWN }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: Option<String>,
    pub workload: ResourceId,
}

impl WorkloadKey {
    pub fn of(target: &AutoscaleTarget) -> Self {
        Self { namespace: target.namespace.clone(), workload: target.workload.clone() }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.workload),
            None => write!(f, "{}", self.workload),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("tick skipped: {0}")]
    Metric(#[from] MetricUnavailable),
    #[error("scaling {workload} to {replicas} failed: {reason}")]
    Actuation { workload: WorkloadKey, replicas: u32, reason: String },
    #[error("workload {0} is not registered")]
    Unknown(WorkloadKey),
}

type Slot = Arc<tokio::sync::Mutex<AutoscaleSpec>>;

pub struct Controller<M, S> {
    metrics: M,
    scaler: S,
    config: ControllerConfig,
    workloads: Mutex<FxHashMap<WorkloadKey, Slot>>,
}

impl<M: MetricsSource, S: Scaler> Controller<M, S> {
    pub fn new(metrics: M, scaler: S, config: ControllerConfig) -> Self {
        Self { metrics, scaler, config, workloads: Mutex::new(FxHashMap::default()) }
    }

    /// Validate `target` and start tracking it from its live replica count.
    pub async fn register(&self, target: AutoscaleTarget) -> anyhow::Result<WorkloadKey> {
        target.validate()?;
        let current = self.scaler.current_replicas(&target).await?;
        let key = WorkloadKey::of(&target);
        let spec = AutoscaleSpec::new(target, current, self.config.cooldown);
        info!(workload = %key, replicas = current, "autoscaling registered");
        self.lock().insert(key.clone(), Arc::new(tokio::sync::Mutex::new(spec)));
        Ok(key)
    }

    /// Register already validated state, e.g. restored or built in tests.
    pub fn insert(&self, spec: AutoscaleSpec) -> Result<WorkloadKey, ConfigError> {
        spec.target.validate()?;
        let key = WorkloadKey::of(&spec.target);
        self.lock().insert(key.clone(), Arc::new(tokio::sync::Mutex::new(spec)));
        Ok(key)
    }

    pub fn keys(&self) -> Vec<WorkloadKey> {
        let mut keys: Vec<WorkloadKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of the workload's state.
    pub async fn snapshot(&self, key: &WorkloadKey) -> Option<AutoscaleSpec> {
        let slot = self.lock().get(key).cloned()?;
        let spec = slot.lock().await;
        Some(spec.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<WorkloadKey, Slot>> {
        self.workloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read metrics, decide and actuate while holding the workload's lock.
    pub async fn tick(&self, key: &WorkloadKey) -> Result<Decision, TickError> {
        let slot = self.lock().get(key).cloned().ok_or_else(|| TickError::Unknown(key.clone()))?;
        let mut spec = slot.lock().await;

        match self.scaler.current_replicas(&spec.target).await {
            Ok(live) if live != spec.current_replicas => {
                debug!(workload = %key, recorded = spec.current_replicas, live, "replica count changed outside the controller");
                spec.current_replicas = live;
            }
            Ok(_) => {}
            Err(e) => debug!(workload = %key, error = %e, "could not read live replicas; using recorded count"),
        }

        let mut readings = Vec::with_capacity(spec.target.metrics.len());
        for m in &spec.target.metrics {
            let value = self.metrics.utilization(&spec.target, m.kind).await;
            readings.push(Reading::new(m.kind, value));
        }
        let now = Instant::now();
        let decision = match spec.decide(&readings, now) {
            Ok(d) => d,
            Err(e) => {
                counter!("autoscale_skipped", 1u64);
                warn!(workload = %key, error = %e, "metric unavailable; keeping replica count");
                return Err(e.into());
            }
        };

        if let Some(replicas) = decision.target() {
            if let Err(e) = self.scaler.scale(&spec.target, replicas).await {
                counter!("autoscale_actuation_failed", 1u64);
                warn!(workload = %key, replicas, error = %e, "scale failed");
                return Err(TickError::Actuation { workload: key.clone(), replicas, reason: format!("{:#}", e) });
            }
            spec.record(&decision, now);
            match decision {
                Decision::ScaleUp { .. } => counter!("autoscale_scale_up", 1u64),
                Decision::Correct { .. } => counter!("autoscale_bounds_corrected", 1u64),
                _ => counter!("autoscale_scale_down", 1u64),
            }
            info!(workload = %key, %decision, "scaled");
        } else {
            if let Decision::Suppressed { .. } = decision {
                counter!("autoscale_suppressed", 1u64);
            }
            debug!(workload = %key, %decision, "no change");
        }
        Ok(decision)
    }

    /// Tick every registered workload on its own interval until `cancel` fires.
    pub async fn run(&self, cancel: CancelSignal) {
        let keys = self.keys();
        info!(workloads = keys.len(), interval_s = self.config.interval.as_secs(), "autoscale loop started");
        join_all(keys.into_iter().map(|k| self.run_workload(k, cancel.clone()))).await;
        info!("autoscale loop stopped");
    }

    async fn run_workload(&self, key: WorkloadKey, mut cancel: CancelSignal) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.tick(&key).await {
                    Ok(_) | Err(TickError::Metric(_)) | Err(TickError::Actuation { .. }) => {}
                    Err(e @ TickError::Unknown(_)) => {
                        warn!(error = %e, "workload dropped from the registry; stopping its loop");
                        break;
                    }
                },
            }
        }
        debug!(workload = %key, "workload loop stopped");
    }
}
