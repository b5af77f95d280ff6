//! Stage sequencing: observe, apply, then wait for readiness, one stage at a time.

use std::fmt;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use stagehand_apply::Platform;
use stagehand_core::{CancelSignal, ConfigError, ResourceId, ResourceSpec, RolloutState, RolloutStatus};
use stagehand_store::{Plan, Stage, StateBoard};
use tracing::{debug, info, warn};

use crate::prober::{wait_ready, Backoff, ProbeError};

#[derive(Debug, Clone, Default)]
pub struct SequencerConfig {
    /// Applied to resources that carry no timeout of their own.
    pub default_timeout: Option<Duration>,
    pub backoff: Backoff,
}

/// A resource that ended in Failed, with the status it held when it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFailure {
    pub id: ResourceId,
    pub stage: u32,
    pub status: RolloutStatus,
    pub optional: bool,
    pub reason: String,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FAILED {} stage={} status={}: {}", self.id, self.stage, self.status, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("rollout aborted in stage {stage}: {} required resource(s) failed", .failures.len())]
    Aborted { stage: u32, failures: Vec<ResourceFailure>, state: RolloutState },
    #[error("rollout cancelled during stage {stage}")]
    Cancelled { stage: u32, state: RolloutState },
}

impl RolloutError {
    /// Progress made before the rollout stopped. None for configuration errors,
    /// which are raised before anything is applied.
    pub fn partial_state(&self) -> Option<&RolloutState> {
        match self {
            RolloutError::Config(_) => None,
            RolloutError::Aborted { state, .. } | RolloutError::Cancelled { state, .. } => Some(state),
        }
    }
}

/// Every Failed resource in `state`, in id order.
pub fn failures(state: &RolloutState) -> Vec<ResourceFailure> {
    state
        .with_status(RolloutStatus::Failed)
        .map(|(id, r)| ResourceFailure {
            id: id.clone(),
            stage: r.stage,
            status: r.failed_from.unwrap_or(RolloutStatus::Failed),
            optional: r.optional,
            reason: r.error.clone().unwrap_or_default(),
        })
        .collect()
}

pub struct Sequencer<P> {
    platform: P,
    config: SequencerConfig,
}

impl<P: Platform> Sequencer<P> {
    pub fn new(platform: P, config: SequencerConfig) -> Self {
        Self { platform, config }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Validate the dependency graph, then roll the specs out.
    pub async fn rollout(&self, specs: Vec<ResourceSpec>, cancel: CancelSignal) -> Result<RolloutState, RolloutError> {
        let plan = Plan::build(specs, self.config.default_timeout)?;
        let board = StateBoard::new(RolloutState::new(plan.specs()));
        self.rollout_with_board(&plan, &board, cancel).await
    }

    /// Roll out a validated plan, publishing every transition on `board`.
    pub async fn rollout_with_board(
        &self,
        plan: &Plan,
        board: &StateBoard,
        cancel: CancelSignal,
    ) -> Result<RolloutState, RolloutError> {
        let started = Instant::now();
        info!(stages = plan.stages().len(), resources = plan.len(), "rollout started");
        for stage in plan.stages() {
            let t0 = Instant::now();
            self.run_stage(stage, board, &cancel).await?;
            histogram!("rollout_stage_ms", t0.elapsed().as_secs_f64() * 1000.0);
        }
        let state = (*board.current()).clone();
        let optional_failed = state.count(RolloutStatus::Failed);
        if optional_failed > 0 {
            warn!(failed = optional_failed, "rollout settled with failed optional resources");
        }
        counter!("rollout_settled", 1u64);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "rollout settled");
        Ok(state)
    }

    async fn run_stage(&self, stage: &Stage, board: &StateBoard, cancel: &CancelSignal) -> Result<(), RolloutError> {
        let index = stage.index;
        let cancelled = || RolloutError::Cancelled { stage: index, state: (*board.current()).clone() };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        info!(stage = index, resources = stage.resources.len(), "stage started");

        let mut waiting: Vec<&ResourceSpec> = Vec::new();
        for spec in &stage.resources {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            if self.reuse_if_settled(spec, board).await {
                continue;
            }
            board.update(|s| s.advance(&spec.id, RolloutStatus::Applying));
            match self.platform.apply(spec).await {
                Ok(receipt) => {
                    counter!("rollout_applied", 1u64);
                    debug!(resource = %spec.id, revision = ?receipt.revision, "apply accepted");
                    board.update(|s| s.advance(&spec.id, RolloutStatus::WaitingReady));
                    if spec.readiness.is_gated() {
                        waiting.push(spec);
                    } else {
                        board.update(|s| s.advance(&spec.id, RolloutStatus::Ready));
                    }
                }
                Err(e) => {
                    counter!("rollout_failed", 1u64);
                    warn!(resource = %spec.id, stage = index, error = %e, "apply failed");
                    board.update(|s| s.fail(&spec.id, e.to_string()));
                }
            }
        }

        if self.required_failures(stage, board).is_empty() {
            let results = join_all(waiting.iter().map(|spec| self.probe(spec, board, cancel.clone()))).await;
            if results.iter().any(|r| matches!(r, Err(ProbeError::Cancelled))) {
                warn!(stage = index, "rollout cancelled; in-flight probes stopped");
                return Err(cancelled());
            }
        }

        let failed = self.required_failures(stage, board);
        if !failed.is_empty() {
            for f in &failed {
                warn!(resource = %f.id, stage = f.stage, status = %f.status, reason = %f.reason, "required resource failed");
            }
            return Err(RolloutError::Aborted { stage: index, failures: failed, state: (*board.current()).clone() });
        }
        info!(stage = index, "stage settled");
        Ok(())
    }

    /// An in-sync object whose predicate already holds goes straight to Ready.
    async fn reuse_if_settled(&self, spec: &ResourceSpec, board: &StateBoard) -> bool {
        match self.platform.observe(spec).await {
            Ok(obs) if obs.in_sync && obs.report.ready => {
                counter!("rollout_reused", 1u64);
                debug!(resource = %spec.id, detail = %obs.report.detail, "already settled; skipping apply");
                board.update(|s| {
                    s.record_probe(&spec.id, obs.report.detail.clone());
                    s.mark_reused(&spec.id);
                    s.advance(&spec.id, RolloutStatus::Ready)
                })
            }
            Ok(_) => false,
            Err(e) => {
                debug!(resource = %spec.id, error = %e, "pre-apply observe failed; applying");
                false
            }
        }
    }

    async fn probe(&self, spec: &ResourceSpec, board: &StateBoard, mut cancel: CancelSignal) -> Result<(), ProbeError> {
        // Plan::build guarantees a timeout on every gated resource.
        let timeout = spec.timeout.unwrap_or(Duration::ZERO);
        let platform = &self.platform;
        let res = wait_ready(
            || async move { platform.observe(spec).await.map(|o| o.report) },
            timeout,
            &self.config.backoff,
            &mut cancel,
            |r| board.update(|s| s.record_probe(&spec.id, r.detail.clone())),
        )
        .await;
        match &res {
            Ok(report) => {
                debug!(resource = %spec.id, detail = %report.detail, "ready");
                board.update(|s| s.advance(&spec.id, RolloutStatus::Ready));
            }
            Err(e @ ProbeError::Timeout { .. }) => {
                counter!("rollout_failed", 1u64);
                warn!(resource = %spec.id, error = %e, "readiness timeout");
                board.update(|s| s.fail(&spec.id, format!("readiness {}", e)));
            }
            Err(ProbeError::Cancelled) => {}
        }
        res.map(|_| ())
    }

    fn required_failures(&self, stage: &Stage, board: &StateBoard) -> Vec<ResourceFailure> {
        let state = board.current();
        failures(&state)
            .into_iter()
            .filter(|f| f.stage == stage.index && !f.optional)
            .collect()
    }
}
