//! stagehand rollout: applies a validated plan stage by stage, gating each
//! stage on the readiness of its members.

#![forbid(unsafe_code)]

pub mod prober;
pub mod sequencer;

pub use prober::{wait_ready, Backoff, ProbeError};
pub use sequencer::{failures, ResourceFailure, RolloutError, Sequencer, SequencerConfig};
