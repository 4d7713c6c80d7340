// src/bag/mod.rs

//! Bag model: path resolution and I/O over a bag's on-disk layout
//!
//! ```text
//! <bagroot>/
//!   bagit.txt
//!   bag-info.txt
//!   data/<relpath...>                     original files
//!   metadata/record.json                  resource record
//!   metadata/<relpath...>/record.json     per-component record
//!   manifest-sha256.txt
//!   tagmanifest-sha256.txt
//!   preserv.log
//! ```
//!
//! Path resolution is pure arithmetic. Only `exists`, `read*`, `write*` and
//! the zone listings touch the filesystem. Writes are atomic per file.

pub mod buildlog;
pub mod info;
pub mod lock;
pub mod manifest;

pub use buildlog::{BuildLog, BuildLogRecord, BuildOperation, BuildOutcome};
pub use info::BagInfo;
pub use lock::BagLock;
pub use manifest::{Manifest, ManifestEntry};

use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use serde_json::Value;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DATA_DIR: &str = "data";
pub const METADATA_DIR: &str = "metadata";
pub const RECORD_FILE: &str = "record.json";
pub const BAGIT_TXT: &str = "bagit.txt";
pub const BAG_INFO_TXT: &str = "bag-info.txt";
pub const BUILD_LOG: &str = "preserv.log";

/// A bag rooted at a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bag {
    root: PathBuf,
    name: String,
}

impl Bag {
    /// View a bag root; no I/O is performed
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { root, name }
    }

    /// View an existing bag root, failing if it is not a readable directory
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let bag = Self::new(root);
        match fs::metadata(&bag.root) {
            Ok(meta) if meta.is_dir() => Ok(bag),
            Ok(_) => Err(Error::NotFound(format!(
                "bag root is not a directory: {}",
                bag.root.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
                "bag root: {}",
                bag.root.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base name of the root directory
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    pub fn resource_record_path(&self) -> PathBuf {
        self.metadata_dir().join(RECORD_FILE)
    }

    /// Mirrored metadata record path; `""` resolves to the resource record
    pub fn metadata_record_path(&self, relpath: &str) -> Result<PathBuf> {
        let rel = normalize_relpath(relpath)?;
        if rel.is_empty() {
            return Ok(self.resource_record_path());
        }
        Ok(self.metadata_dir().join(&rel).join(RECORD_FILE))
    }

    pub fn data_file_path(&self, relpath: &str) -> Result<PathBuf> {
        let rel = normalize_relpath(relpath)?;
        if rel.is_empty() {
            return Err(Error::InvalidPath(
                "data file path must not be empty".to_string(),
            ));
        }
        Ok(self.data_dir().join(rel))
    }

    pub fn manifest_path(&self, algorithm: HashAlgorithm) -> PathBuf {
        self.root.join(manifest_name(algorithm))
    }

    pub fn tagmanifest_path(&self, algorithm: HashAlgorithm) -> PathBuf {
        self.root.join(tagmanifest_name(algorithm))
    }

    pub fn bagit_path(&self) -> PathBuf {
        self.root.join(BAGIT_TXT)
    }

    pub fn bag_info_path(&self) -> PathBuf {
        self.root.join(BAG_INFO_TXT)
    }

    pub fn build_log_path(&self) -> PathBuf {
        self.root.join(BUILD_LOG)
    }

    /// Path relative to the bag root, `/`-separated
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root).ok().map(to_slash_path)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| not_found_or(e, path))
    }

    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| not_found_or(e, path))
    }

    pub fn read_json(&self, path: &Path) -> Result<Value> {
        let bytes = self.read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically replace a file's content, creating parent directories
    pub fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        write_atomic(path, content)
    }

    /// Write a JSON document in the bag's canonical (pretty, key-sorted) form
    pub fn write_json(&self, path: &Path, value: &Value) -> Result<()> {
        self.write(path, &to_canonical_json(value)?)
    }

    /// Every regular file in the data zone, as sorted relative paths
    pub fn data_files(&self) -> Result<Vec<String>> {
        let data_dir = self.data_dir();
        if !data_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&data_dir).follow_links(false) {
            let entry = entry.map_err(walk_error)?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&data_dir) {
                    files.push(to_slash_path(rel));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Every component with a record in the metadata zone, as sorted paths
    ///
    /// The resource record itself (`metadata/record.json`) is not a component.
    pub fn component_paths(&self) -> Result<Vec<String>> {
        let metadata_dir = self.metadata_dir();
        if !metadata_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&metadata_dir).min_depth(2).follow_links(false) {
            let entry = entry.map_err(walk_error)?;
            if !entry.file_type().is_file() || entry.file_name() != RECORD_FILE {
                continue;
            }
            let Some(parent) = entry.path().parent() else {
                continue;
            };
            if let Ok(rel) = parent.strip_prefix(&metadata_dir) {
                let rel = to_slash_path(rel);
                if !rel.is_empty() {
                    paths.push(rel);
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Every file in the metadata zone, relative to the bag root
    pub fn metadata_files(&self) -> Result<Vec<String>> {
        let metadata_dir = self.metadata_dir();
        if !metadata_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&metadata_dir).follow_links(false) {
            let entry = entry.map_err(walk_error)?;
            if entry.file_type().is_file() {
                if let Some(rel) = self.relative(entry.path()) {
                    files.push(rel);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Algorithms for which a payload manifest is present
    pub fn manifest_algorithms(&self) -> Vec<HashAlgorithm> {
        HashAlgorithm::ALL
            .into_iter()
            .filter(|alg| self.manifest_path(*alg).is_file())
            .collect()
    }
}

pub fn manifest_name(algorithm: HashAlgorithm) -> String {
    format!("manifest-{}.txt", algorithm.name())
}

pub fn tagmanifest_name(algorithm: HashAlgorithm) -> String {
    format!("tagmanifest-{}.txt", algorithm.name())
}

/// Normalise a component path: `/` separators, no empty or `.` segments
///
/// `""`, `"/"` and `"."` all name the root collection. Any `..` segment is
/// rejected so a path can never leave its zone.
pub fn normalize_relpath(relpath: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in relpath.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidPath(format!(
                    "path escapes its zone: {}",
                    relpath
                )));
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Parent collection of a normalised path (`"a/b.csv"` -> `"a"`, `"a"` -> `""`)
pub fn parent_path(relpath: &str) -> &str {
    relpath.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Serialize JSON the way every record in a bag is stored
pub fn to_canonical_json(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write to a temp file in the destination directory, then rename over the target
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(format!("no parent directory: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn not_found_or(e: std::io::Error, path: &Path) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::NotFound(path.display().to_string())
    } else {
        Error::Io(e)
    }
}

fn walk_error(e: walkdir::Error) -> Error {
    match e.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::InvalidPath("filesystem loop in bag".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_name_from_root() {
        let bag = Bag::new("/srv/bags/mds2-1234");
        assert_eq!(bag.name(), "mds2-1234");
    }

    #[test]
    fn test_path_resolution() {
        let bag = Bag::new("/b");
        assert_eq!(bag.resource_record_path(), PathBuf::from("/b/metadata/record.json"));
        assert_eq!(
            bag.metadata_record_path("a/b.csv").unwrap(),
            PathBuf::from("/b/metadata/a/b.csv/record.json")
        );
        assert_eq!(
            bag.metadata_record_path("/").unwrap(),
            bag.resource_record_path()
        );
        assert_eq!(
            bag.data_file_path("a/b.csv").unwrap(),
            PathBuf::from("/b/data/a/b.csv")
        );
        assert_eq!(
            bag.manifest_path(HashAlgorithm::Sha256),
            PathBuf::from("/b/manifest-sha256.txt")
        );
        assert!(bag.data_file_path("").is_err());
    }

    #[test]
    fn test_normalize_relpath() {
        assert_eq!(normalize_relpath("b/").unwrap(), "b");
        assert_eq!(normalize_relpath("/a//./b.csv").unwrap(), "a/b.csv");
        assert_eq!(normalize_relpath("").unwrap(), "");
        assert!(matches!(
            normalize_relpath("a/../../etc"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("a/b/c.csv"), "a/b");
        assert_eq!(parent_path("a.csv"), "");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let bag = Bag::new(dir.path().join("bag"));
        let err = bag.read(&bag.resource_record_path()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_open_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Bag::open(dir.path().join("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_write_creates_dirs_and_zone_listings() {
        let dir = TempDir::new().unwrap();
        let bag = Bag::new(dir.path().join("bag"));

        bag.write(&bag.data_file_path("b/c.csv").unwrap(), b"1,2\n").unwrap();
        bag.write(&bag.data_file_path("a.csv").unwrap(), b"x\n").unwrap();
        bag.write_json(&bag.metadata_record_path("b").unwrap(), &json!({"filepath": "b"}))
            .unwrap();
        bag.write_json(&bag.metadata_record_path("b/c.csv").unwrap(), &json!({}))
            .unwrap();
        bag.write_json(&bag.resource_record_path(), &json!({"@id": "x"}))
            .unwrap();

        assert_eq!(bag.data_files().unwrap(), vec!["a.csv", "b/c.csv"]);
        assert_eq!(bag.component_paths().unwrap(), vec!["b", "b/c.csv"]);
        assert_eq!(
            bag.metadata_files().unwrap(),
            vec![
                "metadata/b/c.csv/record.json",
                "metadata/b/record.json",
                "metadata/record.json"
            ]
        );
        assert_eq!(
            bag.read_json(&bag.metadata_record_path("b").unwrap()).unwrap(),
            json!({"filepath": "b"})
        );
    }
}
