// src/config.rs

//! Configuration file parsing for the preservation service
//!
//! Supports TOML configuration files with the following sections:
//! - [service] - Worker pool size, retry ceiling, build timeout, status database
//! - [bags] - Where bags are built and serialized, manifest checksum algorithm
//! - [logging] - Default tracing filter

use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreservationConfig {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub bags: BagsSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Scheduler and worker pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// Number of concurrent build workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Requeues allowed after a re-request before the build is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wall-clock budget for a single build attempt
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// SQLite database holding durable request status
    #[serde(default = "default_status_db")]
    pub status_db: PathBuf,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            build_timeout_secs: default_build_timeout_secs(),
            status_db: default_status_db(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_build_timeout_secs() -> u64 {
    3600
}

fn default_status_db() -> PathBuf {
    PathBuf::from("/var/lib/aipbag/status.db")
}

/// Bag placement settings
#[derive(Debug, Clone, Deserialize)]
pub struct BagsSection {
    /// Directory under which each identifier's bag is built
    #[serde(default = "default_parent_dir")]
    pub parent_dir: PathBuf,

    /// Directory receiving serialized bags before archive push
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Manifest checksum algorithm
    #[serde(default)]
    pub checksum: HashAlgorithm,
}

impl Default for BagsSection {
    fn default() -> Self {
        Self {
            parent_dir: default_parent_dir(),
            staging_dir: default_staging_dir(),
            checksum: HashAlgorithm::default(),
        }
    }
}

fn default_parent_dir() -> PathBuf {
    PathBuf::from("/var/lib/aipbag/bags")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/var/lib/aipbag/staging")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl PreservationConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted entirely under one working directory
    pub fn under(root: &Path) -> Self {
        Self {
            service: ServiceSection {
                status_db: root.join("status.db"),
                ..ServiceSection::default()
            },
            bags: BagsSection {
                parent_dir: root.join("bags"),
                staging_dir: root.join("staging"),
                checksum: HashAlgorithm::default(),
            },
            logging: LoggingSection::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.workers == 0 {
            return Err(Error::Config("service.workers must be at least 1".to_string()));
        }
        if self.service.build_timeout_secs == 0 {
            return Err(Error::Config(
                "service.build_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.bags.parent_dir.as_os_str().is_empty() {
            return Err(Error::Config("bags.parent_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.service.build_timeout_secs)
    }

    /// Directory a given identifier's bag is built in
    pub fn bag_dir_for(&self, identifier: &str) -> PathBuf {
        self.bags.parent_dir.join(bag_name_for(identifier))
    }
}

/// Derive a bag directory name from a dataset identifier
///
/// ARK identifiers drop the `ark:/` scheme and join the NAAN and name with
/// `-` (`ark:/88434/mds2-1234` becomes `88434-mds2-1234`), so datasets from
/// different authorities never share a bag.
pub fn bag_name_for(identifier: &str) -> String {
    let local = match identifier.strip_prefix("ark:") {
        Some(rest) => rest.trim_start_matches('/').replace('/', "-"),
        None => identifier.to_string(),
    };

    let name: String = local
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PreservationConfig::from_toml("").unwrap();
        assert_eq!(config.service.workers, 2);
        assert_eq!(config.service.max_retries, 3);
        assert_eq!(config.bags.checksum, HashAlgorithm::Sha256);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_parse_sections() {
        let config = PreservationConfig::from_toml(
            r#"
            [service]
            workers = 4
            max_retries = 1
            build_timeout_secs = 60
            status_db = "/tmp/status.db"

            [bags]
            parent_dir = "/srv/bags"
            checksum = "sha512"
            "#,
        )
        .unwrap();

        assert_eq!(config.service.workers, 4);
        assert_eq!(config.build_timeout(), Duration::from_secs(60));
        assert_eq!(config.bags.checksum, HashAlgorithm::Sha512);
        assert_eq!(
            config.bag_dir_for("ark:/88434/mds2-1234"),
            PathBuf::from("/srv/bags/88434-mds2-1234")
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = PreservationConfig::from_toml("[service]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = PreservationConfig::from_toml("[service\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bag_name_for() {
        assert_eq!(bag_name_for("ark:/88434/mds2-1234"), "88434-mds2-1234");
        assert_eq!(bag_name_for("ark:88434/mds2-1234"), "88434-mds2-1234");
        assert_eq!(bag_name_for("doi:10.18434/T4/1"), "doi_10.18434_T4_1");
        assert_eq!(bag_name_for(".."), "_");
    }

    #[test]
    fn test_bag_name_keeps_naan() {
        let a = bag_name_for("ark:/88434/mds2-1");
        let b = bag_name_for("ark:/99999/mds2-1");
        assert_ne!(a, b);
        assert_eq!(b, "99999-mds2-1");

        let config = PreservationConfig::under(Path::new("/srv"));
        assert_ne!(
            config.bag_dir_for("ark:/88434/mds2-1"),
            config.bag_dir_for("ark:/99999/mds2-1")
        );
    }
}
