// src/nerdm/mod.rs

//! NERDm resource records and their components
//!
//! Records are kept as JSON objects rather than fully typed structs: the
//! builder only owns a handful of fields (`@id`, `ediid`, `components`,
//! `inventory`, the per-file checksum block) and must carry everything else
//! through untouched.

pub mod inventory;
pub mod merge;

pub use inventory::{InventoryEntry, InventoryReport, assemble};
pub use merge::merge_record;

use crate::bag::normalize_relpath;
use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::Path;

pub const DATAFILE_TYPES: [&str; 3] = ["nrdp:DataFile", "nrdp:DownloadableFile", "dcat:Distribution"];
pub const SUBCOLLECTION_TYPE: &str = "nrdp:Subcollection";

/// Fields the validator requires on every resource record
pub const REQUIRED_FIELDS: [&str; 4] = ["@id", "ediid", "title", "accessLevel"];

/// Whether a component is a data file or a sub-collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    File,
    Collection,
}

impl ComponentKind {
    /// Decide from a record's `@type` tags
    pub fn from_record(record: &Value) -> Self {
        let is_collection = record
            .get("@type")
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|t| t.ends_with("Subcollection"))
            })
            .unwrap_or(false);

        if is_collection {
            Self::Collection
        } else {
            Self::File
        }
    }
}

/// A component's position in the file hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component {
    /// Normalised path relative to the dataset root (`""` is the root)
    pub path: String,
    pub kind: ComponentKind,
}

impl Component {
    pub fn new(path: &str, kind: ComponentKind) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            kind,
        }
    }

    pub fn file(path: &str) -> Self {
        Self::new(path, ComponentKind::File)
    }

    pub fn collection(path: &str) -> Self {
        Self::new(path, ComponentKind::Collection)
    }

    /// Hierarchy position of a component record, if it has a `filepath`
    pub fn from_record(record: &Value) -> Option<Self> {
        let filepath = record.get("filepath")?.as_str()?;
        let path = normalize_relpath(filepath).ok()?;
        Some(Self {
            path,
            kind: ComponentKind::from_record(record),
        })
    }
}

/// The resource-level NERDm record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRecord(Map<String, Value>);

impl ResourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidRecord(format!(
                "resource record must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("@id").and_then(Value::as_str)
    }

    pub fn ediid(&self) -> Option<&str> {
        self.0.get("ediid").and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }

    pub fn components(&self) -> &[Value] {
        self.0
            .get("components")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Hierarchy positions of every component carrying a `filepath`
    pub fn hierarchy(&self) -> Vec<Component> {
        self.components()
            .iter()
            .filter_map(Component::from_record)
            .collect()
    }

    /// Persisted inventory, if present and well-formed
    pub fn inventory(&self) -> Option<Vec<InventoryEntry>> {
        let value = self.0.get("inventory")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Component record for a data file added to the bag
pub fn file_component_record(
    path: &str,
    size: u64,
    algorithm: HashAlgorithm,
    digest: &str,
) -> Value {
    json!({
        "@id": format!("cmps/{}", path),
        "@type": DATAFILE_TYPES,
        "filepath": path,
        "size": size,
        "mediaType": media_type_for(path),
        "checksum": {
            "algorithm": { "@type": "Thing", "tag": algorithm.name() },
            "hash": digest,
        },
    })
}

/// Component record for a sub-collection
pub fn collection_component_record(path: &str) -> Value {
    json!({
        "@id": format!("cmps/{}", path),
        "@type": [SUBCOLLECTION_TYPE],
        "filepath": path,
    })
}

/// Guess a file's media type from its extension
pub fn media_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "txt" | "sha256" | "sha512" | "md5" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "h5" | "hdf5" => "application/x-hdf5",
        "nc" => "application/x-netcdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_types() {
        assert_eq!(
            ComponentKind::from_record(&json!({"@type": ["nrdp:Subcollection"]})),
            ComponentKind::Collection
        );
        assert_eq!(
            ComponentKind::from_record(&json!({"@type": DATAFILE_TYPES})),
            ComponentKind::File
        );
        assert_eq!(ComponentKind::from_record(&json!({})), ComponentKind::File);
    }

    #[test]
    fn test_component_from_record_requires_filepath() {
        assert!(Component::from_record(&json!({"@type": ["nrdp:AccessPage"]})).is_none());
        assert_eq!(
            Component::from_record(&json!({"filepath": "b/", "@type": ["nrdp:Subcollection"]})),
            Some(Component::collection("b"))
        );
    }

    #[test]
    fn test_resource_record_accessors() {
        let record = ResourceRecord::from_value(json!({
            "@id": "ark:/88434/mds2-1",
            "ediid": "ark:/88434/mds2-1",
            "title": "Test data",
            "components": [
                {"filepath": "a.csv", "@type": DATAFILE_TYPES},
                {"@type": ["nrdp:AccessPage"], "accessURL": "https://example.org"}
            ],
            "inventory": [{"forCollection": "", "childCount": 1, "descCount": 1}]
        }))
        .unwrap();

        assert_eq!(record.id(), Some("ark:/88434/mds2-1"));
        assert_eq!(record.components().len(), 2);
        assert_eq!(record.hierarchy(), vec![Component::file("a.csv")]);
        assert_eq!(record.inventory().unwrap()[0].child_count, 1);
    }

    #[test]
    fn test_resource_record_must_be_object() {
        assert!(ResourceRecord::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_file_component_record() {
        let record = file_component_record("b/c.csv", 4, HashAlgorithm::Sha256, "abcd");
        assert_eq!(record["filepath"], "b/c.csv");
        assert_eq!(record["@id"], "cmps/b/c.csv");
        assert_eq!(record["mediaType"], "text/csv");
        assert_eq!(record["checksum"]["algorithm"]["tag"], "sha256");
        assert_eq!(ComponentKind::from_record(&record), ComponentKind::File);
    }
}
