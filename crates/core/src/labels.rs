//! Label sets and equality selectors.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::PolicyError;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9_.-]{0,61}[A-Za-z0-9])?$").expect("label name regex"));
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$").expect("label prefix regex")
});

/// Labels attached to a workload instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(SmallVec<[(String, String); 8]>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Insert or replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `k=v,k2=v2`.
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        let mut out = Labels::new();
        for (k, v) in parse_terms(s)? {
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = Labels::new();
        for (k, v) in iter {
            out.insert(k, v);
        }
        out
    }
}

/// Label-equality predicate: every pair must match. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    match_labels: SmallVec<[(String, String); 4]>,
}

impl Selector {
    /// Selector matching every label set.
    pub fn any() -> Self {
        Self::default()
    }

    /// Build from already validated pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut match_labels: SmallVec<[(String, String); 4]> = SmallVec::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            validate_pair(&k, &v)?;
            match match_labels.iter().find(|(ek, _)| *ek == k) {
                Some((_, ev)) if *ev != v => {
                    return Err(PolicyError::Selector {
                        term: format!("{}={}", k, v),
                        reason: format!("conflicts with {}={}", k, ev),
                    })
                }
                Some(_) => {}
                None => match_labels.push((k, v)),
            }
        }
        match_labels.sort();
        Ok(Self { match_labels })
    }

    /// Parse `k=v,k2=v2`; the empty string is the match-all selector.
    pub fn parse(s: &str) -> Result<Self, PolicyError> {
        Self::from_pairs(parse_terms(s)?)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.match_labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.match_labels.is_empty() {
            return f.write_str("*");
        }
        let terms: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&terms.join(","))
    }
}

fn parse_terms(s: &str) -> Result<Vec<(String, String)>, PolicyError> {
    let mut out = Vec::new();
    for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (k, v) = term.split_once('=').ok_or_else(|| PolicyError::Selector {
            term: term.to_string(),
            reason: "expected key=value".into(),
        })?;
        let (k, v) = (k.trim(), v.trim());
        validate_pair(k, v)?;
        out.push((k.to_string(), v.to_string()));
    }
    Ok(out)
}

fn validate_pair(key: &str, value: &str) -> Result<(), PolicyError> {
    let bad = |reason: &str| PolicyError::Selector { term: format!("{}={}", key, value), reason: reason.to_string() };
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.len() > 253 || !PREFIX_RE.is_match(prefix) {
                return Err(bad("invalid key prefix"));
            }
            name
        }
        None => key,
    };
    if !NAME_RE.is_match(name) {
        return Err(bad("invalid key"));
    }
    if !value.is_empty() && !NAME_RE.is_match(value) {
        return Err(bad("invalid value"));
    }
    Ok(())
}
