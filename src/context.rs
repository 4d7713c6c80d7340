// src/context.rs

//! Explicit build context handed to the builder, validator and scheduler
//!
//! Holds the configuration and the tracing span every log line of one build
//! is recorded under. Nothing in the crate installs global state; the binary
//! sets up the subscriber and constructs contexts.

use crate::config::PreservationConfig;
use crate::hash::HashAlgorithm;
use std::sync::Arc;
use tracing::Span;

#[derive(Debug, Clone)]
pub struct BuildContext {
    config: Arc<PreservationConfig>,
    span: Span,
}

impl BuildContext {
    pub fn new(config: Arc<PreservationConfig>) -> Self {
        Self {
            config,
            span: Span::none(),
        }
    }

    /// Context for one build, with a span carrying the identifier and request
    pub fn for_request(&self, identifier: &str, request_id: &str) -> Self {
        Self {
            config: self.config.clone(),
            span: tracing::info_span!("preserve", identifier = %identifier, request = %request_id),
        }
    }

    pub fn config(&self) -> &PreservationConfig {
        &self.config
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn checksum(&self) -> HashAlgorithm {
        self.config.bags.checksum
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new(Arc::new(PreservationConfig::default()))
    }
}
