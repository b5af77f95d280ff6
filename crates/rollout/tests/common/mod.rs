#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde_json::Value as Json;
use stagehand_apply::{ApplyReceipt, Observation, Platform};
use stagehand_core::{ApplyError, ProbeReport, ResourceId, ResourceSpec};

/// In-memory platform. Objects become ready after a configurable number of polls
/// and every apply checks that the resource's dependencies were seen ready first.
#[derive(Default)]
pub struct MemoryPlatform {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    live: BTreeMap<ResourceId, Json>,
    polls: BTreeMap<ResourceId, u32>,
    ready_after: BTreeMap<ResourceId, u32>,
    never_ready: BTreeSet<ResourceId>,
    reject: BTreeSet<ResourceId>,
    ready_seen: BTreeSet<ResourceId>,
    applies: Vec<ResourceId>,
    violations: Vec<String>,
}

pub fn rid(s: &str) -> ResourceId {
    s.parse().expect("Kind/name")
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// `id` reports ready on its `polls`-th observation after an apply.
    pub fn ready_after(self, id: &str, polls: u32) -> Self {
        self.inner.lock().unwrap().ready_after.insert(rid(id), polls);
        self
    }

    pub fn never_ready(self, id: &str) -> Self {
        self.inner.lock().unwrap().never_ready.insert(rid(id));
        self
    }

    pub fn reject(self, id: &str) -> Self {
        self.inner.lock().unwrap().reject.insert(rid(id));
        self
    }

    pub fn applies(&self) -> Vec<ResourceId> {
        self.inner.lock().unwrap().applies.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.inner.lock().unwrap().violations.clone()
    }
}

#[async_trait::async_trait]
impl Platform for MemoryPlatform {
    async fn observe(&self, spec: &ResourceSpec) -> Result<Observation, ApplyError> {
        let mut g = self.inner.lock().unwrap();
        let Some(live) = g.live.get(&spec.id).cloned() else {
            return Ok(Observation { present: false, in_sync: false, report: ProbeReport::not_ready("object not found") });
        };
        let polls = {
            let p = g.polls.entry(spec.id.clone()).or_insert(0);
            *p += 1;
            *p
        };
        let need = g.ready_after.get(&spec.id).copied().unwrap_or(1);
        let ready = !g.never_ready.contains(&spec.id) && polls >= need;
        let report = if ready {
            g.ready_seen.insert(spec.id.clone());
            ProbeReport::ready("1/1 replicas ready")
        } else {
            ProbeReport::not_ready(format!("0/1 replicas ready (poll {})", polls))
        };
        Ok(Observation { present: true, in_sync: live == spec.payload, report })
    }

    async fn apply(&self, spec: &ResourceSpec) -> Result<ApplyReceipt, ApplyError> {
        let mut g = self.inner.lock().unwrap();
        if g.reject.contains(&spec.id) {
            return Err(ApplyError::Rejected(format!("admission denied for {}", spec.id)));
        }
        for dep in &spec.depends_on {
            if !g.ready_seen.contains(dep) {
                let v = format!("{} applied before {} was ready", spec.id, dep);
                g.violations.push(v);
            }
        }
        if g.live.get(&spec.id) != Some(&spec.payload) {
            g.live.insert(spec.id.clone(), spec.payload.clone());
            g.polls.insert(spec.id.clone(), 0);
        }
        if !spec.readiness.is_gated() {
            g.ready_seen.insert(spec.id.clone());
        }
        g.applies.push(spec.id.clone());
        Ok(ApplyReceipt { dry_run: false, revision: Some(g.applies.len().to_string()), summary: Default::default() })
    }
}
