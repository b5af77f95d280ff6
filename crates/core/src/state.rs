//! Per-resource rollout status and the forward-only transition rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ResourceId, ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RolloutStatus {
    Pending,
    Applying,
    WaitingReady,
    Ready,
    Failed,
}

impl RolloutStatus {
    /// Transitions only move forward; Ready and Failed are terminal.
    pub fn can_advance_to(self, next: RolloutStatus) -> bool {
        use RolloutStatus::*;
        matches!(
            (self, next),
            (Pending, Applying)
                | (Pending, Ready)
                | (Pending, Failed)
                | (Applying, WaitingReady)
                | (Applying, Failed)
                | (WaitingReady, Ready)
                | (WaitingReady, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RolloutStatus::Ready | RolloutStatus::Failed)
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutStatus::Pending => "Pending",
            RolloutStatus::Applying => "Applying",
            RolloutStatus::WaitingReady => "WaitingReady",
            RolloutStatus::Ready => "Ready",
            RolloutStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub stage: u32,
    pub optional: bool,
    pub status: RolloutStatus,
    /// Status held just before entering Failed.
    pub failed_from: Option<RolloutStatus>,
    pub applying_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    /// Number of readiness checks issued.
    pub probes: u32,
    /// Already in sync and ready; no apply was issued.
    pub reused: bool,
    pub last_observed: Option<String>,
    pub error: Option<String>,
}

impl ResourceState {
    fn pending(stage: u32, optional: bool) -> Self {
        Self {
            stage,
            optional,
            status: RolloutStatus::Pending,
            failed_from: None,
            applying_at: None,
            ready_at: None,
            probes: 0,
            reused: false,
            last_observed: None,
            error: None,
        }
    }
}

/// Mapping from resource to status, created at rollout start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    pub resources: BTreeMap<ResourceId, ResourceState>,
}

impl RolloutState {
    pub fn new<'a>(specs: impl IntoIterator<Item = &'a ResourceSpec>) -> Self {
        let resources = specs
            .into_iter()
            .map(|s| (s.id.clone(), ResourceState::pending(s.stage, s.optional)))
            .collect();
        Self { resources }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    pub fn status(&self, id: &ResourceId) -> Option<RolloutStatus> {
        self.resources.get(id).map(|r| r.status)
    }

    /// Move `id` to `next` if that is a legal forward step. Returns whether it moved.
    pub fn advance(&mut self, id: &ResourceId, next: RolloutStatus) -> bool {
        self.advance_at(id, next, Utc::now())
    }

    pub fn advance_at(&mut self, id: &ResourceId, next: RolloutStatus, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.resources.get_mut(id) else {
            warn!(resource = %id, "transition for unknown resource ignored");
            return false;
        };
        if !entry.status.can_advance_to(next) {
            warn!(resource = %id, from = %entry.status, to = %next, "illegal transition ignored");
            return false;
        }
        match next {
            RolloutStatus::Applying => entry.applying_at = Some(at),
            RolloutStatus::Ready => entry.ready_at = Some(at),
            RolloutStatus::Failed => entry.failed_from = Some(entry.status),
            _ => {}
        }
        entry.status = next;
        true
    }

    pub fn fail(&mut self, id: &ResourceId, reason: impl Into<String>) -> bool {
        let moved = self.advance(id, RolloutStatus::Failed);
        if moved {
            if let Some(entry) = self.resources.get_mut(id) {
                entry.error = Some(reason.into());
            }
        }
        moved
    }

    pub fn record_probe(&mut self, id: &ResourceId, detail: impl Into<String>) {
        if let Some(entry) = self.resources.get_mut(id) {
            entry.probes = entry.probes.saturating_add(1);
            entry.last_observed = Some(detail.into());
        }
    }

    pub fn mark_reused(&mut self, id: &ResourceId) {
        if let Some(entry) = self.resources.get_mut(id) {
            entry.reused = true;
        }
    }

    pub fn is_fully_ready(&self) -> bool {
        self.resources.values().all(|r| r.status == RolloutStatus::Ready)
    }

    pub fn with_status(&self, status: RolloutStatus) -> impl Iterator<Item = (&ResourceId, &ResourceState)> {
        self.resources.iter().filter(move |(_, r)| r.status == status)
    }

    pub fn count(&self, status: RolloutStatus) -> usize {
        self.with_status(status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (RolloutState, ResourceId) {
        let spec = ResourceSpec::new("ConfigMap", "cfg", 0);
        let id = spec.id.clone();
        (RolloutState::new([&spec]), id)
    }

    #[test]
    fn forward_path_records_timestamps() {
        let (mut s, id) = state();
        assert!(s.advance(&id, RolloutStatus::Applying));
        assert!(s.advance(&id, RolloutStatus::WaitingReady));
        assert!(s.advance(&id, RolloutStatus::Ready));
        let r = s.get(&id).unwrap();
        assert!(r.applying_at.is_some());
        assert!(r.ready_at.unwrap() >= r.applying_at.unwrap());
        assert!(s.is_fully_ready());
    }

    #[test]
    fn backward_and_terminal_moves_are_refused() {
        let (mut s, id) = state();
        assert!(s.advance(&id, RolloutStatus::Applying));
        assert!(!s.advance(&id, RolloutStatus::Pending));
        assert!(s.fail(&id, "boom"));
        assert!(!s.advance(&id, RolloutStatus::Ready));
        let r = s.get(&id).unwrap();
        assert_eq!(r.status, RolloutStatus::Failed);
        assert_eq!(r.failed_from, Some(RolloutStatus::Applying));
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_resource_is_ignored() {
        let (mut s, _) = state();
        assert!(!s.advance(&ResourceId::new("Secret", "nope"), RolloutStatus::Applying));
    }
}
