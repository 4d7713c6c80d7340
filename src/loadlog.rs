// src/loadlog.rs

//! Outcome tracking for batch persistence of keyed records
//!
//! A [`LoadLog`] only grows: [`LoadLog::add`] appends a [`LoadResult`] and
//! updates the counters, and nothing edits an entry once added. At all times
//! `attempt_count == success_count + failure_count`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one attempt to persist one keyed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl LoadResult {
    pub fn success(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            errors: None,
        }
    }

    pub fn failure(key: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            key: key.into(),
            errors: Some(errors),
        }
    }

    /// True iff no errors were recorded
    pub fn successful(&self) -> bool {
        self.errors.as_ref().is_none_or(Vec::is_empty)
    }

    pub fn errors(&self) -> &[String] {
        self.errors.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadLog {
    results: Vec<LoadResult>,
    success_count: usize,
    failure_count: usize,
}

impl LoadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: LoadResult) -> &mut Self {
        if result.successful() {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.results.push(result);
        self
    }

    /// Append every result of another log
    pub fn merge(&mut self, other: LoadLog) -> &mut Self {
        for result in other.results {
            self.add(result);
        }
        self
    }

    pub fn attempt_count(&self) -> usize {
        self.results.len()
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// Whether any attempt for this key succeeded
    pub fn succeeded(&self, key: &str) -> bool {
        self.results.iter().any(|r| r.key == key && r.successful())
    }

    /// Whether any attempt for this key failed
    pub fn failed(&self, key: &str) -> bool {
        self.results.iter().any(|r| r.key == key && !r.successful())
    }

    /// Failed attempts for this key, in the order they were added
    pub fn failures(&self, key: &str) -> Vec<&LoadResult> {
        self.results
            .iter()
            .filter(|r| r.key == key && !r.successful())
            .collect()
    }

    /// Keys of every failed attempt, in order
    pub fn failed_keys(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.successful())
            .map(|r| r.key.as_str())
            .collect()
    }

    pub fn results(&self) -> &[LoadResult] {
        &self.results
    }
}

impl fmt::Display for LoadLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempted, {} succeeded, {} failed",
            self.attempt_count(),
            self.success_count,
            self.failure_count
        )?;
        for result in self.results.iter().filter(|r| !r.successful()) {
            write!(f, "\n  {}: {}", result.key, result.errors().join("; "))?;
        }
        Ok(())
    }
}
