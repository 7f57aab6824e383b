//! Exact-match label selectors
//!
//! Selectors are written as `key:value` pairs separated by commas
//! (`app:node-exporter,tier:infra`). `key=value` is accepted as well so
//! that selectors copied from kubectl keep working.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a label selector
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("label requirement {0:?} is not a key:value pair")]
    MissingSeparator(String),

    #[error("label requirement {0:?} has an empty key")]
    EmptyKey(String),

    #[error("label {key:?} is given twice with different values")]
    Conflict { key: String },
}

/// Conjunction of exact-match label requirements
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requirement, rejecting a second value for the same key
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SelectorError> {
        let key = key.into();
        let value = value.into();

        match self.labels.get(&key) {
            Some(existing) if *existing != value => Err(SelectorError::Conflict { key }),
            _ => {
                self.labels.insert(key, value);
                Ok(())
            }
        }
    }

    /// Merge another selector into this one
    pub fn merge(&mut self, other: LabelSelector) -> Result<(), SelectorError> {
        for (key, value) in other.labels {
            self.insert(key, value)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Render in the control plane's `labelSelector` query syntax
    pub fn to_query(&self) -> String {
        self.labels
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = LabelSelector::new();

        for requirement in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (key, value) = requirement
                .split_once(':')
                .or_else(|| requirement.split_once('='))
                .ok_or_else(|| SelectorError::MissingSeparator(requirement.to_string()))?;

            let key = key.trim();
            if key.is_empty() {
                return Err(SelectorError::EmptyKey(requirement.to_string()));
            }

            selector.insert(key, value.trim())?;
        }

        Ok(selector)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}
