//! Replica decisions. Pure: callers pass the clock in.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use stagehand_core::{AutoscaleTarget, MetricKind, MetricUnavailable};
use tokio::time::Instant;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Absorbs float error so an exact ratio such as 3 * 70 / 70 does not round up.
const CEIL_EPSILON: f64 = 1e-9;

/// `ceil(current * observed / target)` clamped to `[min, max]`.
///
/// Negative readings count as zero and an infinite reading saturates at `max`.
/// NaN must be filtered by the caller; here it falls back to `current`.
pub fn desired_replicas(current: u32, observed: f64, target: f64, min: u32, max: u32) -> u32 {
    let (min, max) = (min.max(1), max.max(min.max(1)));
    if observed.is_nan() || !(target.is_finite() && target > 0.0) {
        return current.clamp(min, max);
    }
    if observed.is_infinite() && observed > 0.0 {
        return max;
    }
    let raw = f64::from(current) * observed.max(0.0) / target;
    let want = (raw - CEIL_EPSILON).ceil();
    if want >= f64::from(max) {
        max
    } else if want <= f64::from(min) {
        min
    } else {
        want as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Stable,
    CoolingDown { since: Instant },
}

/// One metric sample handed to [`AutoscaleSpec::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub metric: MetricKind,
    pub value: Result<f64, MetricUnavailable>,
}

impl Reading {
    pub fn new(metric: MetricKind, value: Result<f64, MetricUnavailable>) -> Self {
        Self { metric, value }
    }

    pub fn ok(metric: MetricKind, value: f64) -> Self {
        Self { metric, value: Ok(value) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Hold { replicas: u32 },
    ScaleUp { from: u32, to: u32 },
    ScaleDown { from: u32, to: u32 },
    /// A scale-down held back by the cooldown window.
    Suppressed { replicas: u32, wanted: u32 },
    /// Pulls a count changed outside the controller back into `[min, max]`.
    /// Not subject to the cooldown and does not open it.
    Correct { from: u32, to: u32 },
}

impl Decision {
    /// Replica count to actuate, if any.
    pub fn target(&self) -> Option<u32> {
        match self {
            Decision::ScaleUp { to, .. } | Decision::ScaleDown { to, .. } | Decision::Correct { to, .. } => Some(*to),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Hold { replicas } => write!(f, "hold at {}", replicas),
            Decision::ScaleUp { from, to } => write!(f, "scale up {} -> {}", from, to),
            Decision::ScaleDown { from, to } => write!(f, "scale down {} -> {}", from, to),
            Decision::Suppressed { replicas, wanted } => {
                write!(f, "hold at {} (cooldown suppresses scale down to {})", replicas, wanted)
            }
            Decision::Correct { from, to } => write!(f, "correct {} -> {} (outside bounds)", from, to),
        }
    }
}

/// Mutable autoscaling state of one workload.
#[derive(Debug, Clone)]
pub struct AutoscaleSpec {
    pub target: AutoscaleTarget,
    pub current_replicas: u32,
    pub last_scale: Option<Instant>,
    pub cooldown: CooldownState,
    pub cooldown_period: Duration,
}

impl AutoscaleSpec {
    pub fn new(target: AutoscaleTarget, current_replicas: u32, cooldown_period: Duration) -> Self {
        Self { target, current_replicas, last_scale: None, cooldown: CooldownState::Stable, cooldown_period }
    }

    /// Cooldown as seen at `now`; an elapsed window reads as Stable.
    pub fn cooldown_at(&self, now: Instant) -> CooldownState {
        match self.cooldown {
            CooldownState::CoolingDown { since } if now.saturating_duration_since(since) < self.cooldown_period => {
                self.cooldown
            }
            _ => CooldownState::Stable,
        }
    }

    /// Most constraining metric wins. If some metrics are unreadable only a
    /// scale-up may result; if none are readable the tick is skipped.
    pub fn decide(&self, readings: &[Reading], now: Instant) -> Result<Decision, MetricUnavailable> {
        let t = &self.target;
        let current = self.current_replicas;
        let mut wanted: Option<u32> = None;
        let mut unavailable: Option<MetricUnavailable> = None;
        for m in &t.metrics {
            let value = readings.iter().find(|r| r.metric == m.kind).map(|r| &r.value);
            let missing = |reason: &str| MetricUnavailable { workload: t.workload.clone(), kind: m.kind, reason: reason.into() };
            match value {
                Some(Ok(v)) if v.is_nan() => unavailable = Some(missing("reading is NaN")),
                Some(Ok(v)) => {
                    let d = desired_replicas(current, *v, m.target_percent, t.min_replicas, t.max_replicas);
                    wanted = Some(wanted.map_or(d, |w| w.max(d)));
                }
                Some(Err(e)) => unavailable = Some(e.clone()),
                None => unavailable = Some(missing("no reading")),
            }
        }
        let bounded = current.clamp(t.min_replicas, t.max_replicas);
        let Some(wanted) = wanted else {
            if bounded != current {
                return Ok(Decision::Correct { from: current, to: bounded });
            }
            return Err(unavailable.unwrap_or_else(|| MetricUnavailable {
                workload: t.workload.clone(),
                kind: MetricKind::Cpu,
                reason: "no metrics configured".into(),
            }));
        };
        if wanted > current {
            return Ok(Decision::ScaleUp { from: current, to: wanted });
        }
        let cooling = matches!(self.cooldown_at(now), CooldownState::CoolingDown { .. });
        if bounded != current && (cooling || unavailable.is_some()) {
            return Ok(Decision::Correct { from: current, to: bounded });
        }
        if wanted == current || unavailable.is_some() {
            return Ok(Decision::Hold { replicas: current });
        }
        if cooling {
            Ok(Decision::Suppressed { replicas: current, wanted })
        } else {
            Ok(Decision::ScaleDown { from: current, to: wanted })
        }
    }

    /// Commit an actuated decision. A scale-down opens the cooldown window.
    pub fn record(&mut self, decision: &Decision, now: Instant) {
        match *decision {
            Decision::Correct { to, .. } => self.current_replicas = to,
            Decision::ScaleUp { to, .. } => {
                self.current_replicas = to;
                self.last_scale = Some(now);
            }
            Decision::ScaleDown { to, .. } => {
                self.current_replicas = to;
                self.last_scale = Some(now);
                self.cooldown = CooldownState::CoolingDown { since: now };
            }
            Decision::Hold { .. } | Decision::Suppressed { .. } => {}
        }
    }

    /// Decide and commit in one step; returns the new replica count.
    pub fn tick(&mut self, readings: &[Reading], now: Instant) -> Result<u32, MetricUnavailable> {
        let decision = self.decide(readings, now)?;
        self.record(&decision, now);
        Ok(self.current_replicas)
    }
}
