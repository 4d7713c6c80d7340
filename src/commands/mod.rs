// src/commands/mod.rs
//! Command handlers for the aipbag CLI

mod bag;
mod service;

pub use bag::{cmd_add, cmd_finalize, cmd_init, cmd_remove, cmd_set_meta, cmd_validate};
pub use service::{cmd_preserve, cmd_recover, cmd_status};

use aipbag::{BuildContext, PreservationConfig};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Load the configuration file, or defaults when none was given
pub fn load_config(path: Option<&Path>) -> Result<PreservationConfig> {
    match path {
        Some(path) => PreservationConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(PreservationConfig::default()),
    }
}

pub(crate) fn build_context(config: &PreservationConfig) -> BuildContext {
    BuildContext::new(Arc::new(config.clone()))
}
