//! stagehand store: the ResourceSpec catalog, stage plan validation and the
//! rollout state board readers subscribe to.

#![forbid(unsafe_code)]

pub mod board;
pub mod catalog;
pub mod manifest;
pub mod plan;

pub use board::StateBoard;
pub use catalog::{Catalog, LoadOptions};
pub use manifest::Document;
pub use plan::{Plan, Stage};

/// Upper bound on a single manifest file (`STAGEHAND_MAX_YAML_BYTES`).
pub fn max_yaml_bytes() -> usize {
    std::env::var("STAGEHAND_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}
