mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MemoryPlatform;
use proptest::prelude::*;
use stagehand_core::{CancelSignal, Readiness, ResourceId, ResourceSpec};
use stagehand_rollout::{Backoff, Sequencer, SequencerConfig};

/// A stage-consistent graph: node `i` may only depend on nodes in a strictly earlier stage.
#[derive(Debug, Clone)]
struct Graph {
    stages: Vec<u32>,
    deps: Vec<Vec<usize>>,
    ready_after: Vec<u32>,
    immediate: Vec<bool>,
}

fn arb_graph() -> impl Strategy<Value = Graph> {
    (1usize..9).prop_flat_map(|n| {
        (
            prop::collection::vec(0u32..2, n),
            prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            prop::collection::vec(1u32..5, n),
            prop::collection::vec(any::<bool>(), n),
        )
            .prop_map(|(steps, mask, ready_after, immediate)| {
                let stages: Vec<u32> = steps
                    .iter()
                    .scan(0u32, |acc, s| {
                        *acc += s;
                        Some(*acc)
                    })
                    .collect();
                let deps = (0..stages.len())
                    .map(|i| (0..i).filter(|&j| mask[i][j] && stages[j] < stages[i]).collect())
                    .collect();
                Graph { stages, deps, ready_after, immediate }
            })
    })
}

fn name(i: usize) -> String {
    format!("w{}", i)
}

fn specs(g: &Graph) -> Vec<ResourceSpec> {
    (0..g.stages.len())
        .map(|i| {
            let kind = if g.immediate[i] { "ConfigMap" } else { "Deployment" };
            let mut s = ResourceSpec::new(kind, &name(i), g.stages[i]);
            if g.immediate[i] {
                s = s.readiness(Readiness::Immediate);
            }
            for &j in &g.deps[i] {
                let dep_kind = if g.immediate[j] { "ConfigMap" } else { "Deployment" };
                s = s.depends_on(ResourceId::new(dep_kind, name(j)));
            }
            s
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dependencies_are_ready_before_dependents_apply(g in arb_graph()) {
        let specs = specs(&g);
        let mut platform = MemoryPlatform::new();
        for (i, s) in specs.iter().enumerate() {
            platform = platform.ready_after(&s.id.to_string(), g.ready_after[i]);
        }
        let platform = Arc::new(platform);
        let config = SequencerConfig { default_timeout: Some(Duration::from_secs(60)), backoff: Backoff::default() };
        let seq = Sequencer::new(platform.clone(), config);

        let rt = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();
        let state = rt.block_on(seq.rollout(specs.clone(), CancelSignal::never())).unwrap();

        prop_assert!(state.is_fully_ready());
        prop_assert!(platform.violations().is_empty(), "{:?}", platform.violations());
        for s in &specs {
            let applying = state.get(&s.id).unwrap().applying_at.unwrap();
            for dep in &s.depends_on {
                let ready = state.get(dep).unwrap().ready_at.unwrap();
                prop_assert!(ready <= applying, "{} applied before {} was ready", s.id, dep);
            }
        }
    }
}
