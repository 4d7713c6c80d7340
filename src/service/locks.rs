// src/service/locks.rs

//! In-memory identifier lock table
//!
//! An identifier is locked from `submit` until its request reaches a
//! terminal state, including across requeues, so builds for one identifier
//! never overlap.

use super::RequestId;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct IdentifierLocks {
    held: Mutex<HashMap<String, RequestId>>,
}

impl IdentifierLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `identifier` for `request_id`; on failure returns the current holder
    pub fn try_acquire(&self, identifier: &str, request_id: &str) -> Result<(), RequestId> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(identifier) {
            Some(holder) if holder != request_id => Err(holder.clone()),
            _ => {
                held.insert(identifier.to_string(), request_id.to_string());
                debug!("Locked {} for request {}", identifier, request_id);
                Ok(())
            }
        }
    }

    /// Release `identifier` if `request_id` holds it
    pub fn release(&self, identifier: &str, request_id: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(identifier).is_some_and(|holder| holder == request_id) {
            held.remove(identifier);
            debug!("Released {} from request {}", identifier, request_id);
            true
        } else {
            false
        }
    }

    pub fn holder(&self, identifier: &str) -> Option<RequestId> {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identifier)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_per_identifier() {
        let locks = IdentifierLocks::new();
        locks.try_acquire("ark:/1", "r1").unwrap();
        assert_eq!(locks.try_acquire("ark:/1", "r2"), Err("r1".to_string()));
        locks.try_acquire("ark:/2", "r2").unwrap();

        // Re-acquiring for the holder is a no-op
        locks.try_acquire("ark:/1", "r1").unwrap();
    }

    #[test]
    fn test_release_only_by_holder() {
        let locks = IdentifierLocks::new();
        locks.try_acquire("ark:/1", "r1").unwrap();

        assert!(!locks.release("ark:/1", "r2"));
        assert_eq!(locks.holder("ark:/1").as_deref(), Some("r1"));
        assert!(locks.release("ark:/1", "r1"));
        assert!(locks.holder("ark:/1").is_none());
        locks.try_acquire("ark:/1", "r2").unwrap();
    }
}
