// src/bag/info.rs

//! `bagit.txt` and `bag-info.txt` tag files
//!
//! `bag-info.txt` is an ordered list of `Label: value` lines; a line starting
//! with whitespace continues the previous value.

use crate::{Error, Result};

/// Contents of `bagit.txt`
pub const BAGIT_DECLARATION: &str = "BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n";

pub const PAYLOAD_OXUM: &str = "Payload-Oxum";
pub const BAGGING_DATE: &str = "Bagging-Date";
pub const EXTERNAL_IDENTIFIER: &str = "External-Identifier";
pub const SOFTWARE_AGENT: &str = "Bag-Software-Agent";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BagInfo {
    fields: Vec<(String, String)>,
}

impl BagInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut fields: Vec<(String, String)> = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let (_, value) = fields.last_mut().ok_or_else(|| {
                    Error::InvalidRecord(format!(
                        "bag-info.txt line {}: continuation without a label",
                        idx + 1
                    ))
                })?;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let (label, value) = line.split_once(':').ok_or_else(|| {
                Error::InvalidRecord(format!("bag-info.txt line {}: missing ':'", idx + 1))
            })?;
            fields.push((label.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { fields })
    }

    /// First value for a label (labels compare case-insensitively)
    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
            .map(|(_, v)| v.as_str())
    }

    /// Replace a label's value in place, or append it
    pub fn set(&mut self, label: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
        {
            Some((_, v)) => *v = value,
            None => self.fields.push((label.to_string(), value)),
        }
    }

    /// `Payload-Oxum` as (octet count, file count)
    pub fn payload_oxum(&self) -> Option<(u64, u64)> {
        let (octets, count) = self.get(PAYLOAD_OXUM)?.split_once('.')?;
        Some((octets.trim().parse().ok()?, count.trim().parse().ok()?))
    }

    pub fn set_payload_oxum(&mut self, octets: u64, count: u64) {
        self.set(PAYLOAD_OXUM, format!("{}.{}", octets, count));
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (label, value) in &self.fields {
            out.push_str(label);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}
