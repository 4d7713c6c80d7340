// src/bag/manifest.rs

//! Payload and tag manifests
//!
//! One line per file: `<hexdigest>  <path>`, where the path is relative to
//! the bag root (`data/a/b.csv`). Lines are rendered sorted by path so a
//! manifest for a fixed set of files is byte-stable.

use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// A single parsed manifest line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub path: String,
}

/// A parsed manifest, keyed by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    algorithm: HashAlgorithm,
    entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            entries: BTreeMap::new(),
        }
    }

    /// Parse a manifest, failing on the first malformed or duplicated line
    pub fn parse(algorithm: HashAlgorithm, text: &str) -> Result<Self> {
        let mut manifest = Self::new(algorithm);
        for (line_num, parsed) in parse_lines(algorithm, text) {
            let entry = parsed?;
            if manifest.entries.contains_key(&entry.path) {
                return Err(Error::Manifest {
                    line: line_num,
                    reason: format!("duplicate entry for {}", entry.path),
                });
            }
            manifest.entries.insert(entry.path, entry.digest);
        }
        Ok(manifest)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Record a digest for a path, replacing any earlier one
    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(path.into(), digest.into().to_lowercase());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, d)| (p.as_str(), d.as_str()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (path, digest) in &self.entries {
            out.push_str(digest);
            out.push_str("  ");
            out.push_str(path);
            out.push('\n');
        }
        out
    }
}

/// Parse each non-blank line independently, keeping 1-based line numbers
///
/// Used by the validator so that one bad line does not hide the rest.
pub fn parse_lines(
    algorithm: HashAlgorithm,
    text: &str,
) -> Vec<(usize, Result<ManifestEntry>)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, parse_line(algorithm, idx + 1, line)))
        .collect()
}

fn parse_line(algorithm: HashAlgorithm, line_num: usize, line: &str) -> Result<ManifestEntry> {
    let line = line.trim_end_matches('\r');
    let (digest, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::Manifest {
            line: line_num,
            reason: "missing path after digest".to_string(),
        })?;

    // Binary-mode marker written by some checksum tools
    let path = rest.trim_start().trim_start_matches('*');
    if path.is_empty() {
        return Err(Error::Manifest {
            line: line_num,
            reason: "missing path after digest".to_string(),
        });
    }

    if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Manifest {
            line: line_num,
            reason: format!("not a {} digest: {}", algorithm, digest),
        });
    }

    Ok(ManifestEntry {
        digest: digest.to_lowercase(),
        path: path.to_string(),
    })
}
