//! Label queries
//!
//! Labels are the foreign keys between a provider and the objects it
//! installed, and between a Cluster and its machines. Every lookup of that
//! kind is expressed as a [`LabelSelector`] instead of an ad-hoc label map.

use std::collections::BTreeMap;

/// A single label requirement
#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Exists,
    Equals(String),
}

/// Conjunction of label requirements; empty matches everything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, Requirement>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be present with any value
    pub fn has(mut self, key: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), Requirement::Exists);
        self
    }

    /// Require `key` to be present with exactly `value`
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .insert(key.into(), Requirement::Equals(value.into()));
        self
    }

    /// True when no requirement is set
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against an object's labels
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|(key, req)| {
            let value = labels.and_then(|l| l.get(key));
            match req {
                Requirement::Exists => value.is_some(),
                Requirement::Equals(expected) => value == Some(expected),
            }
        })
    }

    /// Render in the API server's `labelSelector` syntax
    pub fn to_selector_string(&self) -> String {
        self.requirements
            .iter()
            .map(|(key, req)| match req {
                Requirement::Exists => key.clone(),
                Requirement::Equals(value) => format!("{}={}", key, value),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}
