// src/validate/mod.rs

//! Bag validation
//!
//! A [`Validator`] runs an ordered list of rules over a bag and collects
//! every [`Issue`] they raise. Rules never fail; a problem with the bag is an
//! issue, not an error. `validate` only errors when the bag root itself
//! cannot be opened.
//!
//! A bag is conformant when it has no `PROB` issues.

mod rules;

use crate::Result;
use crate::bag::Bag;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// How serious an issue is, least to most
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational note
    Info,
    /// Recommended practice not followed
    Warn,
    /// Required condition not met
    Error,
    /// Problem that makes the bag unfit for preservation
    Prob,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Prob => "PROB",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One finding from one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    /// Stable identifier of the check that raised it
    pub code: String,
    pub message: String,
    /// Bag-relative path the issue is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Issue {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.severity, self.code, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " ({})", path)?;
        }
        Ok(())
    }
}

/// Every issue raised by one validation run, in rule order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub issues: Vec<Issue>,
}

impl ValidationResults {
    /// Issues of exactly this severity
    pub fn failed(&self, severity: Severity) -> Vec<&Issue> {
        self.issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// No `PROB` issues
    pub fn is_conformant(&self) -> bool {
        self.count(Severity::Prob) == 0
    }

    /// One-line summary, e.g. `FAIL: 1 PROB, 0 ERROR, 2 WARN`
    pub fn summary(&self) -> String {
        format!(
            "{}: {} PROB, {} ERROR, {} WARN",
            if self.is_conformant() { "PASS" } else { "FAIL" },
            self.count(Severity::Prob),
            self.count(Severity::Error),
            self.count(Severity::Warn)
        )
    }
}

/// A single check over a bag
pub type Rule = fn(&Bag) -> Vec<Issue>;

/// Ordered rule registry
#[derive(Clone, Default)]
pub struct Validator {
    rules: Vec<(&'static str, Rule)>,
}

impl Validator {
    /// An empty validator; add rules with [`Validator::register`]
    pub fn new() -> Self {
        Self::default()
    }

    /// The rule set a bag must pass before it is archived
    pub fn preservation_profile() -> Self {
        let mut validator = Self::new();
        validator
            .register("structure", rules::check_structure)
            .register("required-fields", rules::check_required_fields)
            .register("components", rules::check_components)
            .register("inventory", rules::check_inventory)
            .register("manifest", rules::check_manifest)
            .register("tagmanifest", rules::check_tagmanifest)
            .register("bag-info", rules::check_bag_info);
        validator
    }

    pub fn register(&mut self, name: &'static str, rule: Rule) -> &mut Self {
        self.rules.push((name, rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|(name, _)| *name).collect()
    }

    /// Run every rule over the bag at `root`
    pub fn validate(&self, root: &std::path::Path) -> Result<ValidationResults> {
        let bag = Bag::open(root)?;
        Ok(self.validate_bag(&bag))
    }

    pub fn validate_bag(&self, bag: &Bag) -> ValidationResults {
        let mut results = ValidationResults::default();
        for (name, rule) in &self.rules {
            let issues = rule(bag);
            debug!("Rule {} raised {} issue(s)", name, issues.len());
            results.issues.extend(issues);
        }

        info!("Validated bag {}: {}", bag.name(), results.summary());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_severity_order_and_display() {
        assert!(Severity::Prob > Severity::Error);
        assert!(Severity::Error > Severity::Warn);
        assert_eq!(Severity::Prob.to_string(), "PROB");
    }

    #[test]
    fn test_results_conformance() {
        let mut results = ValidationResults::default();
        results.issues.push(Issue::new(Severity::Warn, "x", "minor"));
        results.issues.push(Issue::new(Severity::Error, "z", "oxum"));
        assert!(results.is_conformant());

        results
            .issues
            .push(Issue::new(Severity::Prob, "y", "broken").at("data/a.csv"));
        assert!(!results.is_conformant());
        assert_eq!(results.failed(Severity::Prob).len(), 1);
        assert_eq!(results.summary(), "FAIL: 1 PROB, 1 ERROR, 1 WARN");
        assert_eq!(
            results.issues[2].to_string(),
            "PROB: [y] broken (data/a.csv)"
        );
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let validator = Validator::preservation_profile();
        assert!(validator.validate(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_custom_rule_runs() {
        fn always(_: &Bag) -> Vec<Issue> {
            vec![Issue::new(Severity::Info, "always", "ran")]
        }

        let dir = TempDir::new().unwrap();
        let mut validator = Validator::new();
        validator.register("always", always);
        let results = validator.validate(dir.path()).unwrap();
        assert_eq!(results.issues.len(), 1);
        assert_eq!(validator.rule_names(), vec!["always"]);
    }
}
