// src/lib.rs

//! aipbag: preservation bag builder and asynchronous preservation service
//!
//! Turns a dataset submission (source metadata plus data files) into an
//! Archival Information Package laid out as a BagIt-style bag, checks it
//! against a preservation profile, and pushes it to long-term storage.
//!
//! # Architecture
//!
//! - `bag`: on-disk layout, manifests, tag files, bag lock, build log
//! - `nerdm`: resource records, component hierarchy, inventory assembly
//! - `builder`: places data and metadata, finalizes a bag
//! - `validate`: rule registry producing graded issues
//! - `service`: worker pool, identifier locks, durable request status

pub mod bag;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod context;
mod error;
pub mod external;
pub mod hash;
pub mod loadlog;
pub mod nerdm;
pub mod service;
pub mod validate;

pub use bag::Bag;
pub use builder::BagBuilder;
pub use cancel::CancellationToken;
pub use config::PreservationConfig;
pub use context::BuildContext;
pub use error::{Error, Result};
pub use external::{ArchiveStore, MetadataTransform, RecordValidator};
pub use hash::{HashAlgorithm, Hasher};
pub use loadlog::{LoadLog, LoadResult};
pub use nerdm::{Component, ComponentKind, InventoryEntry, ResourceRecord};
pub use service::{
    CancelOutcome, Collaborators, PreservationService, PreservationState, PreservationStatus,
    RequestId, ServiceEvent, SipLocation,
};
pub use validate::{Issue, Severity, ValidationResults, Validator};
