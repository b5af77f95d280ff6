//! Dependency graph validation and stage grouping.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rustc_hash::FxHashMap;
use stagehand_core::{ConfigError, ResourceId, ResourceSpec};
use tracing::debug;

/// Resources sharing a stage index. Members never depend on each other.
#[derive(Debug, Clone)]
pub struct Stage {
    pub index: u32,
    pub resources: Vec<ResourceSpec>,
}

/// A validated rollout order. Building one performs every configuration check,
/// so holding a `Plan` means no apply can fail for configuration reasons.
#[derive(Debug, Clone)]
pub struct Plan {
    stages: Vec<Stage>,
}

impl Plan {
    /// Validate `specs` and group them by ascending stage. Resources without a
    /// timeout inherit `default_timeout`; gated resources left without one are rejected.
    pub fn build(specs: Vec<ResourceSpec>, default_timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let mut index: FxHashMap<ResourceId, usize> = FxHashMap::default();
        for (i, s) in specs.iter().enumerate() {
            if index.insert(s.id.clone(), i).is_some() {
                return Err(ConfigError::Duplicate(s.id.clone()));
            }
        }

        let mut edges: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
        for s in &specs {
            let mut deps = Vec::with_capacity(s.depends_on.len());
            for d in &s.depends_on {
                if *d == s.id {
                    return Err(ConfigError::SelfDependency(s.id.clone()));
                }
                let &j = index.get(d).ok_or_else(|| ConfigError::UnknownDependency {
                    resource: s.id.clone(),
                    reference: d.to_string(),
                })?;
                deps.push(j);
            }
            edges.push(deps);
        }

        if let Some(cycle) = find_cycle(&edges) {
            return Err(ConfigError::Cycle(cycle.into_iter().map(|i| specs[i].id.clone()).collect()));
        }

        for (s, deps) in specs.iter().zip(&edges) {
            for &j in deps {
                let dep = &specs[j];
                if dep.stage >= s.stage {
                    return Err(ConfigError::StageOrder {
                        resource: s.id.clone(),
                        stage: s.stage,
                        dependency: dep.id.clone(),
                        dependency_stage: dep.stage,
                    });
                }
            }
        }

        let mut grouped: BTreeMap<u32, Vec<ResourceSpec>> = BTreeMap::new();
        for mut s in specs {
            s.timeout = s.timeout.or(default_timeout);
            if s.readiness.is_gated() && s.timeout.is_none() {
                return Err(ConfigError::MissingTimeout(s.id));
            }
            grouped.entry(s.stage).or_default().push(s);
        }
        let stages: Vec<Stage> = grouped
            .into_iter()
            .map(|(index, mut resources)| {
                resources.sort_by(|a, b| a.id.cmp(&b.id));
                Stage { index, resources }
            })
            .collect();
        debug!(stages = stages.len(), "plan built");
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn specs(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.stages.iter().flat_map(|s| s.resources.iter())
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.resources.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kahn's algorithm over `edges[i] = dependencies of i`. Returns one cycle if any remain.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    let n = edges.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut pending: Vec<usize> = vec![0; n];
    for (i, deps) in edges.iter().enumerate() {
        pending[i] = deps.len();
        for &d in deps {
            dependents[d].push(i);
        }
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
    let mut done = vec![false; n];
    while let Some(i) = queue.pop_front() {
        done[i] = true;
        for &k in &dependents[i] {
            pending[k] -= 1;
            if pending[k] == 0 {
                queue.push_back(k);
            }
        }
    }
    let start = (0..n).find(|&i| !done[i])?;
    // Every unfinished node has an unfinished dependency; walk until a node repeats.
    let mut seen: FxHashMap<usize, usize> = FxHashMap::default();
    let mut path = Vec::new();
    let mut cur = start;
    loop {
        if let Some(&pos) = seen.get(&cur) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(cur);
            return Some(cycle);
        }
        seen.insert(cur, path.len());
        path.push(cur);
        cur = *edges[cur].iter().find(|&&d| !done[d])?;
    }
}
