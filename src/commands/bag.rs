// src/commands/bag.rs
//! Bag building and validation commands

use super::build_context;
use aipbag::{BagBuilder, PreservationConfig, Severity, Validator};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use tracing::info;

pub fn cmd_init(config: &PreservationConfig, bag: &Path, identifier: &str) -> Result<()> {
    let ctx = build_context(config);
    let builder = BagBuilder::initialize(&ctx, identifier, bag)
        .with_context(|| format!("Failed to initialize bag at {}", bag.display()))?;

    println!(
        "Initialized bag {} for {}",
        builder.bag().root().display(),
        builder.identifier()
    );
    Ok(())
}

pub fn cmd_add(
    config: &PreservationConfig,
    bag: &Path,
    file: &Path,
    dest: Option<&str>,
) -> Result<()> {
    let ctx = build_context(config);
    let mut builder = BagBuilder::open(&ctx, bag)
        .with_context(|| format!("Failed to open bag at {}", bag.display()))?;

    let relpath = match dest {
        Some(dest) => dest.to_string(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("{} has no file name", file.display()))?,
    };

    let source = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    builder
        .add_data_file(&relpath, source)
        .with_context(|| format!("Failed to add {}", relpath))?;

    println!("Added data/{}", relpath);
    Ok(())
}

pub fn cmd_set_meta(
    config: &PreservationConfig,
    bag: &Path,
    component: &str,
    record: &Path,
) -> Result<()> {
    let ctx = build_context(config);
    let mut builder = BagBuilder::open(&ctx, bag)
        .with_context(|| format!("Failed to open bag at {}", bag.display()))?;

    let content = std::fs::read(record)
        .with_context(|| format!("Failed to read {}", record.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&content)
        .with_context(|| format!("{} is not valid JSON", record.display()))?;

    builder.set_component_metadata(component, &value)?;

    if component.is_empty() {
        println!("Updated resource record");
    } else {
        println!("Updated metadata for {}", component);
    }
    Ok(())
}

pub fn cmd_remove(config: &PreservationConfig, bag: &Path, component: &str) -> Result<()> {
    let ctx = build_context(config);
    let mut builder = BagBuilder::open(&ctx, bag)
        .with_context(|| format!("Failed to open bag at {}", bag.display()))?;

    builder.remove_component(component)?;
    println!("Removed {}", component);
    Ok(())
}

pub fn cmd_finalize(config: &PreservationConfig, bag: &Path) -> Result<()> {
    let ctx = build_context(config);
    let mut builder = BagBuilder::open(&ctx, bag)
        .with_context(|| format!("Failed to open bag at {}", bag.display()))?;

    let record = builder.finalize().context("Failed to finalize bag")?;
    for warning in builder.warnings() {
        println!("warning: {}", warning);
    }

    println!(
        "Finalized {}: {} component(s)",
        builder.bag().name(),
        record.components().len()
    );
    Ok(())
}

/// Print the bag's issues; returns whether the bag is conformant
pub fn cmd_validate(bag: &Path, json: bool) -> Result<bool> {
    info!("Validating bag at {}", bag.display());

    let results = Validator::preservation_profile()
        .validate(bag)
        .with_context(|| format!("Cannot validate {}", bag.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for issue in &results.issues {
            println!("{}", issue);
        }
        println!("{}", results.summary());
    }

    if !results.is_conformant() {
        info!(
            "{} PROB issue(s) in {}",
            results.count(Severity::Prob),
            bag.display()
        );
    }
    Ok(results.is_conformant())
}
