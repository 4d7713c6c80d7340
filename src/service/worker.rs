// src/service/worker.rs

//! The blocking build job a worker runs for one request
//!
//! transform -> bag build -> finalize -> validate -> serialize -> archive.
//! Cancellation is checked between components and files, before finalize and
//! before the archive push.

use super::{Collaborators, SipLocation};
use crate::bag::BagLock;
use crate::builder::BagBuilder;
use crate::cancel::CancellationToken;
use crate::context::BuildContext;
use crate::loadlog::LoadLog;
use crate::validate::{Issue, Validator};
use crate::{Error, Result};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// How a build that ran to completion ended
#[derive(Debug)]
pub enum JobOutcome {
    /// Conformant bag pushed to the archive
    Archived { issues: Vec<Issue>, serialized: PathBuf },
    /// Bag built but failed validation; nothing was pushed
    Rejected { issues: Vec<Issue> },
}

pub fn build_and_archive(
    ctx: &BuildContext,
    collaborators: &Collaborators,
    identifier: &str,
    sip: &SipLocation,
    cancel: &CancellationToken,
) -> Result<JobOutcome> {
    let span = ctx.span().clone();
    let _enter = span.enter();

    cancel.checkpoint()?;

    // Held from here on, so other processes can tell this build is live
    let bag_dir = ctx.config().bag_dir_for(identifier);
    let lock = BagLock::for_bag(&bag_dir)?;

    let source = read_source(sip)?;
    let nerdm = collaborators.transform.to_nerdm(&source, identifier)?;
    let Value::Object(mut resource) = nerdm else {
        return Err(Error::InvalidRecord(
            "metadata transform did not return a JSON object".to_string(),
        ));
    };

    let components = match resource.remove("components") {
        Some(Value::Array(list)) => list,
        Some(_) => {
            return Err(Error::InvalidRecord(
                "'components' in the NERDm record is not a list".to_string(),
            ));
        }
        None => Vec::new(),
    };
    resource.remove("inventory");
    // The bag's identity is fixed by the request
    resource.remove("@id");

    let mut builder = BagBuilder::initialize_locked(ctx, identifier, &bag_dir, lock)?;
    builder.set_component_metadata("", &Value::Object(resource))?;

    let log = builder.load_components(&components, collaborators.validator.as_ref(), cancel)?;
    fail_on_load_errors("components", &log)?;

    if let Some(data_dir) = &sip.data_dir {
        let log = builder.add_data_files_from(data_dir, cancel)?;
        fail_on_load_errors("data files", &log)?;
    }

    cancel.checkpoint()?;
    builder.finalize()?;
    for warning in builder.warnings() {
        warn!("{}: {}", identifier, warning);
    }

    let results = Validator::preservation_profile().validate_bag(builder.bag());
    if !results.is_conformant() {
        info!("Bag for {} rejected: {}", identifier, results.summary());
        return Ok(JobOutcome::Rejected {
            issues: results.issues,
        });
    }

    cancel.checkpoint()?;
    let serialized = builder.serialize(&ctx.config().bags.staging_dir)?;
    collaborators.archive.push(identifier, &serialized)?;

    Ok(JobOutcome::Archived {
        issues: results.issues,
        serialized,
    })
}

fn read_source(sip: &SipLocation) -> Result<Value> {
    let bytes = fs::read(&sip.metadata).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("submission metadata {}", sip.metadata.display()))
        } else {
            Error::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn fail_on_load_errors(what: &str, log: &LoadLog) -> Result<()> {
    if log.failure_count() == 0 {
        return Ok(());
    }
    Err(Error::InvalidRecord(format!("{} failed to load: {}", what, log)))
}
