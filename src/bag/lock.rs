// src/bag/lock.rs

//! Exclusive per-bag lock
//!
//! A builder holds this lock for its whole lifetime, so two builders (in this
//! process or another) never write the same bag at once. The lock file lives
//! beside the bag, not inside it, so it never shows up in a manifest.
//!
//! # Example
//!
//! ```ignore
//! use aipbag::bag::BagLock;
//!
//! let lock = BagLock::for_bag(bag_root)?;
//! // ... build ...
//! // Lock automatically released on drop
//! ```

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct BagLock {
    /// The lock file handle (kept open to maintain lock)
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl BagLock {
    /// Lock file path for a bag root: `<parent>/<name>.lock`
    pub fn path_for(bag_root: &Path) -> PathBuf {
        let name = bag_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bag".to_string());
        bag_root.with_file_name(format!("{}.lock", name))
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns:
    /// - `Ok(Some(lock))` if lock was acquired
    /// - `Ok(None)` if another builder holds it
    /// - `Err` on I/O errors
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired bag lock at {:?}", path);
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Bag lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lock the bag at `bag_root`, or `Rerequest` if another builder has it
    pub fn for_bag(bag_root: &Path) -> Result<Self> {
        Self::try_acquire(Self::path_for(bag_root))?.ok_or_else(|| {
            Error::Rerequest(format!(
                "bag {} is being built by another builder",
                bag_root.display()
            ))
        })
    }

    /// Check if the lock is currently held by anyone
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(_) => return false,
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BagLock {
    fn drop(&mut self) {
        // Lock is released when the file is closed
        debug!("Released bag lock at {:?}", self.path);
    }
}
