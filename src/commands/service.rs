// src/commands/service.rs
//! Preservation service commands

use aipbag::external::CommandTransform;
use aipbag::service::StatusStore;
use aipbag::{
    Collaborators, PreservationConfig, PreservationService, PreservationState, PreservationStatus,
    SipLocation,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn wait_timeout(config: &PreservationConfig, wait_secs: Option<u64>) -> Duration {
    // Default: long enough for every retry to hit the build timeout
    wait_secs.map(Duration::from_secs).unwrap_or_else(|| {
        config
            .build_timeout()
            .saturating_mul(config.service.max_retries.saturating_add(2))
    })
}

fn print_status(status: &PreservationStatus) {
    println!("Request:     {}", status.request_id);
    println!("Identifier:  {}", status.identifier);
    println!("State:       {}", status.state);
    println!("Attempt:     {}", status.attempt);
    println!("Submitted:   {}", status.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:     {}", status.last_updated.format("%Y-%m-%d %H:%M:%S"));
    if let Some(cause) = &status.cause {
        println!("Cause:       {}", cause);
    }
    if status.retry_eligible {
        println!("Retry:       eligible");
    }
    if !status.issues.is_empty() {
        println!();
        println!("Issues:");
        for issue in &status.issues {
            println!("  {}", issue);
        }
    }
}

/// Submit one request and wait for it; returns whether it succeeded
#[allow(clippy::too_many_arguments)]
pub fn cmd_preserve(
    config: &PreservationConfig,
    identifier: &str,
    metadata: &Path,
    data: Option<&Path>,
    transform: Option<&Path>,
    transform_args: &[String],
    archive: &Path,
    wait_secs: Option<u64>,
) -> Result<bool> {
    info!("Preserving {} from {}", identifier, metadata.display());

    let mut collaborators = Collaborators::local(archive);
    if let Some(program) = transform {
        collaborators.transform = Arc::new(
            CommandTransform::new(program)
                .with_args(transform_args.to_vec())
                .with_timeout(config.build_timeout()),
        );
    }

    let mut sip = SipLocation::new(metadata);
    if let Some(dir) = data {
        sip = sip.with_data_dir(dir);
    }

    let timeout = wait_timeout(config, wait_secs);
    let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let status = rt.block_on(async {
        let service = PreservationService::new(config.clone(), collaborators)
            .context("Failed to start preservation service")?;
        let recovered = service.start().context("Failed to recover earlier requests")?;
        for request_id in &recovered.failed {
            info!("Failed interrupted request {}", request_id);
        }

        let request_id = service
            .submit(identifier, sip)
            .with_context(|| format!("Failed to submit {}", identifier))?;
        println!("Submitted request {}", request_id);

        let status = service.wait(&request_id, timeout).await?;
        if !status.state.is_terminal() {
            println!("Request still {} after {:?}; cancelling", status.state, timeout);
            service.cancel(&request_id)?;
        }
        service.shutdown().await;
        anyhow::Ok(service.status(&request_id)?)
    })?;

    println!();
    print_status(&status);
    Ok(status.state == PreservationState::Succeeded)
}

pub fn cmd_status(config: &PreservationConfig, target: &str, by_identifier: bool) -> Result<()> {
    let db_path = &config.service.status_db;
    if !db_path.exists() {
        println!("No preservation requests recorded ({} missing)", db_path.display());
        return Ok(());
    }

    let store = StatusStore::open(db_path)
        .with_context(|| format!("Failed to open status store {}", db_path.display()))?;
    let status = if by_identifier {
        store.latest_for_identifier(target)?
    } else {
        store.get(target)?
    };

    match status {
        Some(status) => print_status(&status),
        None => println!("No request found for {}", target),
    }
    Ok(())
}

pub fn cmd_recover(
    config: &PreservationConfig,
    archive: Option<&Path>,
    wait_secs: Option<u64>,
) -> Result<()> {
    info!("Recovering preservation requests");

    let archive_dir = archive
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.bags.staging_dir.join("archive"));
    let timeout = wait_timeout(config, wait_secs);

    let rt = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    rt.block_on(async {
        let service = PreservationService::new(config.clone(), Collaborators::local(archive_dir))
            .context("Failed to open preservation service")?;
        // Starting the workers recovers first; without an archive only reconcile
        let report = if archive.is_some() {
            service.start()
        } else {
            service.recover()
        }
        .context("Recovery failed")?;

        if report.failed.is_empty() && report.requeued.is_empty() {
            println!("Nothing to recover");
            service.shutdown().await;
            return anyhow::Ok(());
        }

        for request_id in &report.failed {
            println!("failed    {}  (interrupted; retry eligible)", request_id);
        }

        if archive.is_none() {
            for request_id in &report.requeued {
                println!("queued    {}", request_id);
            }
            if !report.requeued.is_empty() {
                println!();
                println!("Pass --archive to run queued requests now");
            }
            return anyhow::Ok(());
        }

        for request_id in &report.requeued {
            let status = service.wait(request_id, timeout).await?;
            println!("{:<9} {}", status.state.as_str(), request_id);
        }
        service.shutdown().await;
        anyhow::Ok(())
    })
}
