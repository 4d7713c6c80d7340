// src/external.rs

//! Collaborators the preservation service depends on but does not implement
//!
//! - [`MetadataTransform`]: converts a submission's source metadata (POD) into
//!   a NERDm resource record
//! - [`RecordValidator`]: schema oracle for NERDm records
//! - [`ArchiveStore`]: long-term store receiving serialized bags
//!
//! All three are called from blocking worker threads. Returning
//! [`Error::Rerequest`] from any of them asks the scheduler to try the build
//! again later.

use crate::{Error, Result};
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};
use wait_timeout::ChildExt;

/// Source metadata + identifier in, NERDm resource record out
pub trait MetadataTransform: Send + Sync {
    fn to_nerdm(&self, source: &Value, identifier: &str) -> Result<Value>;
}

/// Pass/fail oracle: an empty list means the record is acceptable
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: &Value) -> Vec<String>;
}

/// Push target for finished, serialized bags
pub trait ArchiveStore: Send + Sync {
    fn push(&self, identifier: &str, serialized_bag: &Path) -> Result<()>;
}

/// Treats the source document as NERDm already, filling in identifiers
pub struct IdentityTransform;

impl MetadataTransform for IdentityTransform {
    fn to_nerdm(&self, source: &Value, identifier: &str) -> Result<Value> {
        let mut record = source
            .as_object()
            .cloned()
            .ok_or_else(|| Error::InvalidRecord("source metadata must be a JSON object".to_string()))?;
        record
            .entry("@id")
            .or_insert_with(|| Value::String(identifier.to_string()));
        record
            .entry("ediid")
            .or_insert_with(|| Value::String(identifier.to_string()));
        Ok(Value::Object(record))
    }
}

/// Runs an external converter: `<program> <args...> <identifier>`
///
/// The source document is written to the program's stdin and the NERDm
/// record is read from its stdout. Exit code 75 (`EX_TEMPFAIL`) is reported
/// as a re-request; any other failure is permanent. A program still running
/// when its timeout runs out is killed and the build re-requested.
pub struct CommandTransform {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

const EX_TEMPFAIL: i32 = 75;

const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_secs(300);

impl CommandTransform {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TRANSFORM_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read a child pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

impl MetadataTransform for CommandTransform {
    fn to_nerdm(&self, source: &Value, identifier: &str) -> Result<Value> {
        debug!("Running metadata transform {:?} for {}", self.program, identifier);

        let payload = serde_json::to_vec(source)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(identifier)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Config(format!("cannot run transform {:?}: {}", self.program, e))
            })?;

        // Feed stdin while stdout and stderr drain
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload)?;
            }
            Ok(())
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Rerequest(format!(
                    "metadata transform timed out after {} seconds",
                    self.timeout.as_secs()
                )));
            }
        };

        match writer.join() {
            Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                debug!("Writing to metadata transform failed: {}", e);
            }
            _ => {}
        }
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            return match status.code() {
                Some(EX_TEMPFAIL) => Err(Error::Rerequest(format!(
                    "metadata transform asked to retry: {}",
                    stderr
                ))),
                code => Err(Error::InvalidRecord(format!(
                    "metadata transform failed (exit {:?}): {}",
                    code, stderr
                ))),
            };
        }

        Ok(serde_json::from_slice(&stdout)?)
    }
}

/// Accepts every record
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _record: &Value) -> Vec<String> {
        Vec::new()
    }
}

/// Archive store backed by a local directory
pub struct DirectoryArchive {
    dir: PathBuf,
}

impl DirectoryArchive {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArchiveStore for DirectoryArchive {
    fn push(&self, identifier: &str, serialized_bag: &Path) -> Result<()> {
        let file_name = serialized_bag.file_name().ok_or_else(|| {
            Error::InvalidPath(format!("not a file: {}", serialized_bag.display()))
        })?;

        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(file_name);
        let content = fs::read(serialized_bag)?;
        crate::bag::write_atomic(&dest, &content)?;

        info!("Archived {} as {}", identifier, dest.display());
        Ok(())
    }
}
