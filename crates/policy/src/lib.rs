//! stagehand policy: a default-deny, allow-only network policy evaluator.
//!
//! A flow is allowed when at least one rule matches its source, destination,
//! port and direction. There are no deny rules, so adding a rule can only widen
//! what is allowed.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stagehand_core::{Labels, Selector};

pub mod extract;

pub use extract::{rules_from_manifest, rules_from_specs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        })
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ingress" => Ok(Direction::Ingress),
            "egress" => Ok(Direction::Egress),
            other => Err(format!("unknown direction {:?} (expect ingress|egress)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn is_allow(self) -> bool {
        self == Verdict::Allow
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        })
    }
}

/// One allowed flow shape. `port: None` matches any port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRule {
    pub source: Selector,
    pub destination: Selector,
    pub port: Option<u16>,
    pub direction: Direction,
}

impl NetworkRule {
    pub fn new(source: Selector, destination: Selector, port: Option<u16>, direction: Direction) -> Self {
        Self { source, destination, port, direction }
    }

    pub fn allows(&self, src: &Labels, dst: &Labels, port: u16, dir: Direction) -> bool {
        self.direction == dir
            && self.port.map_or(true, |p| p == port)
            && self.source.matches(src)
            && self.destination.matches(dst)
    }
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allow {} {} -> {}", self.direction, self.source, self.destination)?;
        match self.port {
            Some(p) => write!(f, " port {}", p),
            None => f.write_str(" any port"),
        }
    }
}

/// Default deny: Allow only if some rule matches the whole flow.
pub fn evaluate(rules: &[NetworkRule], src: &Labels, dst: &Labels, port: u16, dir: Direction) -> Verdict {
    if rules.iter().any(|r| r.allows(src, dst, port, dir)) {
        Verdict::Allow
    } else {
        Verdict::Deny
    }
}

/// Unordered set of allow rules; inserting a duplicate is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<NetworkRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: NetworkRule) -> bool {
        if self.rules.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    pub fn rules(&self) -> &[NetworkRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, src: &Labels, dst: &Labels, port: u16, dir: Direction) -> Verdict {
        evaluate(&self.rules, src, dst, port, dir)
    }

    /// First rule that admits the flow, for explaining an Allow.
    pub fn matching(&self, src: &Labels, dst: &Labels, port: u16, dir: Direction) -> Option<&NetworkRule> {
        self.rules.iter().find(|r| r.allows(src, dst, port, dir))
    }
}

impl FromIterator<NetworkRule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = NetworkRule>>(iter: T) -> Self {
        let mut set = RuleSet::new();
        for r in iter {
            set.insert(r);
        }
        set
    }
}

impl Extend<NetworkRule> for RuleSet {
    fn extend<T: IntoIterator<Item = NetworkRule>>(&mut self, iter: T) {
        for r in iter {
            self.insert(r);
        }
    }
}
