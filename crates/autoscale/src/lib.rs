//! stagehand autoscale: the replica decision function, its cooldown state
//! machine and the per-workload control loop that drives it.

#![forbid(unsafe_code)]

pub mod controller;
pub mod decision;

pub use controller::{Controller, ControllerConfig, MetricsSource, Scaler, TickError, WorkloadKey};
pub use decision::{desired_replicas, AutoscaleSpec, CooldownState, Decision, Reading, DEFAULT_COOLDOWN};
