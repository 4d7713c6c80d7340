// src/bag/buildlog.rs

//! Append-only build log kept in the bag root
//!
//! Each record is written as a single line with a CRC32 checksum:
//! `{crc32_hex}|{json}\n`. Records are never rewritten; readers stop at the
//! first line whose checksum does not match (a torn write from a crash).

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What the logged operation was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOperation {
    Initialize,
    Finalize,
}

/// How it ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    Failed { reason: String },
}

/// A single build log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogRecord {
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
    pub operation: BuildOperation,
    pub outcome: BuildOutcome,
}

impl BuildLogRecord {
    pub fn new(identifier: &str, operation: BuildOperation, outcome: BuildOutcome) -> Self {
        Self {
            identifier: identifier.to_string(),
            timestamp: Utc::now(),
            operation,
            outcome,
        }
    }
}

/// Open handle on a bag's build log
pub struct BuildLog {
    path: PathBuf,
    file: File,
}

impl BuildLog {
    /// Open for appending, creating the file if needed
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk
    pub fn append(&mut self, record: &BuildLogRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every intact record from a build log
    pub fn read_all(path: &Path) -> Result<Vec<BuildLogRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            let Some((crc_hex, json)) = line.split_once('|') else {
                warn!("Malformed build log line {}: missing delimiter", line_num + 1);
                break;
            };

            let intact = u32::from_str_radix(crc_hex, 16)
                .map(|expected| expected == crc32fast::hash(json.as_bytes()))
                .unwrap_or(false);
            if !intact {
                warn!("Build log checksum mismatch at line {}", line_num + 1);
                break;
            }

            records.push(serde_json::from_str(json)?);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preserv.log");

        let mut log = BuildLog::open(&path).unwrap();
        log.append(&BuildLogRecord::new(
            "ark:/88434/mds2-1",
            BuildOperation::Initialize,
            BuildOutcome::Succeeded,
        ))
        .unwrap();
        log.append(&BuildLogRecord::new(
            "ark:/88434/mds2-1",
            BuildOperation::Finalize,
            BuildOutcome::Failed {
                reason: "disk full".to_string(),
            },
        ))
        .unwrap();
        drop(log);

        // Reopening appends rather than truncating
        let mut log = BuildLog::open(&path).unwrap();
        log.append(&BuildLogRecord::new(
            "ark:/88434/mds2-1",
            BuildOperation::Finalize,
            BuildOutcome::Succeeded,
        ))
        .unwrap();

        let records = BuildLog::read_all(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].operation, BuildOperation::Finalize);
        assert!(matches!(records[1].outcome, BuildOutcome::Failed { .. }));
        assert_eq!(records[2].outcome, BuildOutcome::Succeeded);
    }

    #[test]
    fn test_read_stops_at_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preserv.log");

        let mut log = BuildLog::open(&path).unwrap();
        log.append(&BuildLogRecord::new(
            "id",
            BuildOperation::Initialize,
            BuildOutcome::Succeeded,
        ))
        .unwrap();
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "00000000|{{\"torn\":").unwrap();

        let records = BuildLog::read_all(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(BuildLog::read_all(&dir.path().join("none.log")).unwrap().is_empty());
    }
}
