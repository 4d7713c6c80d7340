// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use aipbag::{BagBuilder, BuildContext, Collaborators, PreservationConfig, SipLocation};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const ID: &str = "ark:/88434/mds2-1234";

/// A minimal resource record that satisfies the required fields
pub fn resource_metadata() -> Value {
    json!({
        "title": "Calibration measurements",
        "accessLevel": "public",
        "description": ["Raw and reduced calibration runs"]
    })
}

/// Create a bag with `a.csv` and `b/c.csv` and finalize it.
///
/// Returns (TempDir, builder) - keep the TempDir alive to prevent cleanup.
pub fn finished_bag() -> (TempDir, BagBuilder) {
    let dir = TempDir::new().unwrap();
    let mut builder = BagBuilder::initialize(
        &BuildContext::default(),
        ID,
        &dir.path().join("mds2-1234"),
    )
    .unwrap();

    builder
        .set_component_metadata("", &resource_metadata())
        .unwrap();
    builder.add_data_file("a.csv", &b"1,2,3\n"[..]).unwrap();
    builder.add_data_file("b/c.csv", &b"x,y\n"[..]).unwrap();
    builder.finalize().unwrap();

    (dir, builder)
}

/// Write a submission: `sip/pod.json` plus `sip/data/{a.csv,b/c.csv}`
pub fn write_sip(root: &Path, metadata: &Value) -> SipLocation {
    let sip = root.join("sip");
    fs::create_dir_all(sip.join("data/b")).unwrap();
    fs::write(sip.join("pod.json"), serde_json::to_vec_pretty(metadata).unwrap()).unwrap();
    fs::write(sip.join("data/a.csv"), b"1,2,3\n").unwrap();
    fs::write(sip.join("data/b/c.csv"), b"x,y\n").unwrap();
    SipLocation::new(sip.join("pod.json")).with_data_dir(sip.join("data"))
}

/// Configuration rooted in a temp dir, with a short build timeout
pub fn test_config(root: &Path) -> PreservationConfig {
    let mut config = PreservationConfig::under(root);
    config.service.workers = 2;
    config.service.build_timeout_secs = 30;
    config
}

pub fn local_collaborators(root: &Path) -> Collaborators {
    Collaborators::local(root.join("archive"))
}
