// src/validate/rules.rs

//! The preservation profile's rules
//!
//! Each rule reads what it needs through the bag model and turns every
//! problem into an [`Issue`]. A rule that depends on a file another rule
//! already reported missing stays quiet about it.

use super::{Issue, Severity};
use crate::bag::{self, Bag, BagInfo, manifest};
use crate::hash::{self, HashAlgorithm};
use crate::nerdm::{self, ComponentKind, REQUIRED_FIELDS, ResourceRecord};
use serde_json::Value;
use std::collections::BTreeSet;

const ROOT_RECORD: &str = "metadata/record.json";

fn root_record(bag: &Bag) -> Option<ResourceRecord> {
    let value = bag.read_json(&bag.resource_record_path()).ok()?;
    ResourceRecord::from_value(value).ok()
}

fn manifest_algorithm(bag: &Bag) -> HashAlgorithm {
    bag.manifest_algorithms()
        .into_iter()
        .next()
        .unwrap_or_default()
}

pub(super) fn check_structure(bag: &Bag) -> Vec<Issue> {
    let mut issues = Vec::new();

    if !bag.bagit_path().is_file() {
        issues.push(
            Issue::new(Severity::Prob, "structure", "bag declaration is missing")
                .at(bag::BAGIT_TXT),
        );
    }
    if !bag.data_dir().is_dir() {
        issues.push(
            Issue::new(Severity::Prob, "structure", "data directory is missing")
                .at(bag::DATA_DIR),
        );
    }
    if !bag.metadata_dir().is_dir() {
        issues.push(
            Issue::new(Severity::Prob, "structure", "metadata directory is missing")
                .at(bag::METADATA_DIR),
        );
    }

    match bag.read_json(&bag.resource_record_path()) {
        Ok(Value::Object(_)) => {}
        Ok(_) => issues.push(
            Issue::new(Severity::Prob, "structure", "resource record is not a JSON object")
                .at(ROOT_RECORD),
        ),
        Err(crate::Error::NotFound(_)) => issues.push(
            Issue::new(Severity::Prob, "structure", "resource record is missing")
                .at(ROOT_RECORD),
        ),
        Err(e) => issues.push(
            Issue::new(
                Severity::Prob,
                "structure",
                format!("resource record is unreadable: {}", e),
            )
            .at(ROOT_RECORD),
        ),
    }

    issues
}

pub(super) fn check_required_fields(bag: &Bag) -> Vec<Issue> {
    let Some(record) = root_record(bag) else {
        return Vec::new();
    };

    let mut issues = Vec::new();
    for field in REQUIRED_FIELDS {
        let present = match record.get(field) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if !present {
            issues.push(
                Issue::new(
                    Severity::Prob,
                    "required-field",
                    format!("resource record lacks a value for '{}'", field),
                )
                .at(ROOT_RECORD),
            );
        }
    }

    for field in ["components", "inventory"] {
        if !record.get(field).is_some_and(Value::is_array) {
            issues.push(
                Issue::new(
                    Severity::Prob,
                    "required-field",
                    format!("resource record has no '{}' list", field),
                )
                .at(ROOT_RECORD),
            );
        }
    }

    issues
}

pub(super) fn check_components(bag: &Bag) -> Vec<Issue> {
    let mut issues = Vec::new();

    let recorded: BTreeSet<String> = match bag.component_paths() {
        Ok(paths) => paths.into_iter().collect(),
        Err(e) => {
            issues.push(Issue::new(
                Severity::Prob,
                "components",
                format!("cannot list the metadata zone: {}", e),
            ));
            return issues;
        }
    };

    let record = root_record(bag);
    if let Some(record) = record.as_ref().filter(|r| r.get("components").is_some()) {
        let listed: BTreeSet<String> = record
            .hierarchy()
            .into_iter()
            .map(|c| c.path)
            .filter(|p| !p.is_empty())
            .collect();

        for path in listed.difference(&recorded) {
            issues.push(
                Issue::new(
                    Severity::Prob,
                    "components",
                    format!("component {} has no metadata record", path),
                )
                .at(format!("{}/{}/{}", bag::METADATA_DIR, path, bag::RECORD_FILE)),
            );
        }
        for path in recorded.difference(&listed) {
            issues.push(
                Issue::new(
                    Severity::Prob,
                    "components",
                    format!("metadata record for {} is not listed in the resource record", path),
                )
                .at(format!("{}/{}/{}", bag::METADATA_DIR, path, bag::RECORD_FILE)),
            );
        }
    }

    let data_files: BTreeSet<String> = bag.data_files().unwrap_or_default().into_iter().collect();
    for rel in data_files.difference(&recorded) {
        issues.push(
            Issue::new(
                Severity::Prob,
                "components",
                format!("data file {} has no metadata record", rel),
            )
            .at(format!("{}/{}", bag::DATA_DIR, rel)),
        );
    }

    for path in &recorded {
        if data_files.contains(path) {
            continue;
        }
        let Ok(record_path) = bag.metadata_record_path(path) else {
            continue;
        };
        let Ok(component) = bag.read_json(&record_path) else {
            continue;
        };
        if ComponentKind::from_record(&component) == ComponentKind::File {
            issues.push(
                Issue::new(
                    Severity::Warn,
                    "components",
                    format!("file component {} has no data file", path),
                )
                .at(format!("{}/{}", bag::DATA_DIR, path)),
            );
        }
    }

    issues
}

pub(super) fn check_inventory(bag: &Bag) -> Vec<Issue> {
    let Some(record) = root_record(bag) else {
        return Vec::new();
    };

    let Some(persisted) = record.inventory() else {
        return vec![
            Issue::new(
                Severity::Prob,
                "inventory",
                "resource record has no well-formed inventory",
            )
            .at(ROOT_RECORD),
        ];
    };

    let expected = nerdm::assemble(&record.hierarchy()).entries;
    nerdm::inventory::diff(&expected, &persisted)
        .into_iter()
        .map(|(collection, want, have)| {
            let message = match (want, have) {
                (Some(w), Some(h)) => format!(
                    "inventory for '{}' says {} children / {} descendants, components give {} / {}",
                    collection, h.child_count, h.desc_count, w.child_count, w.desc_count
                ),
                (Some(_), None) => format!("inventory has no entry for collection '{}'", collection),
                (None, _) => format!("inventory lists unknown collection '{}'", collection),
            };
            Issue::new(Severity::Prob, "inventory", message).at(ROOT_RECORD)
        })
        .collect()
}

/// A manifest path as a normalised bag-relative path, or `None` if it leaves the bag
fn bag_relative(path: &str) -> Option<String> {
    if path.starts_with('/') {
        return None;
    }
    bag::normalize_relpath(path).ok().filter(|p| !p.is_empty())
}

pub(super) fn check_manifest(bag: &Bag) -> Vec<Issue> {
    let algorithm = manifest_algorithm(bag);
    let manifest_name = bag::manifest_name(algorithm);

    let text = match bag.read_to_string(&bag.manifest_path(algorithm)) {
        Ok(text) => text,
        Err(e) => {
            let message = match e {
                crate::Error::NotFound(_) => "payload manifest is missing".to_string(),
                other => format!("payload manifest is unreadable: {}", other),
            };
            return vec![Issue::new(Severity::Prob, "manifest", message).at(manifest_name)];
        }
    };

    let mut issues = Vec::new();
    let mut listed = BTreeSet::new();

    for (_, parsed) in manifest::parse_lines(algorithm, &text) {
        let entry = match parsed {
            Ok(entry) => entry,
            Err(e) => {
                issues.push(
                    Issue::new(Severity::Prob, "manifest", e.to_string()).at(manifest_name.clone()),
                );
                continue;
            }
        };

        let Some(rel) = bag_relative(&entry.path) else {
            issues.push(
                Issue::new(Severity::Prob, "manifest", "listed path escapes the bag")
                    .at(entry.path.clone()),
            );
            continue;
        };
        match hash::hash_file(algorithm, &bag.root().join(&rel)) {
            Ok(actual) if hash::digests_match(&entry.digest, &actual) => {}
            Ok(actual) => issues.push(
                Issue::new(
                    Severity::Prob,
                    "manifest",
                    format!(
                        "checksum mismatch: manifest has {}, file has {}",
                        entry.digest, actual
                    ),
                )
                .at(entry.path.clone()),
            ),
            Err(_) => issues.push(
                Issue::new(Severity::Prob, "manifest", "listed file does not exist")
                    .at(entry.path.clone()),
            ),
        }
        listed.insert(rel);
    }

    for rel in bag.data_files().unwrap_or_default() {
        let path = format!("{}/{}", bag::DATA_DIR, rel);
        if !listed.contains(&path) {
            issues.push(
                Issue::new(
                    Severity::Prob,
                    "manifest",
                    format!("data file is not listed in {}", manifest_name),
                )
                .at(path),
            );
        }
    }

    issues
}

pub(super) fn check_tagmanifest(bag: &Bag) -> Vec<Issue> {
    let algorithm = manifest_algorithm(bag);
    let name = bag::tagmanifest_name(algorithm);

    let Ok(text) = bag.read_to_string(&bag.tagmanifest_path(algorithm)) else {
        return vec![Issue::new(Severity::Warn, "tagmanifest", "tag manifest is missing").at(name)];
    };

    let mut issues = Vec::new();
    for (_, parsed) in manifest::parse_lines(algorithm, &text) {
        let entry = match parsed {
            Ok(entry) => entry,
            Err(e) => {
                issues.push(Issue::new(Severity::Prob, "tagmanifest", e.to_string()).at(name.clone()));
                continue;
            }
        };

        let Some(rel) = bag_relative(&entry.path) else {
            issues.push(
                Issue::new(Severity::Prob, "tagmanifest", "listed path escapes the bag")
                    .at(entry.path),
            );
            continue;
        };
        match hash::hash_file(algorithm, &bag.root().join(&rel)) {
            Ok(actual) if hash::digests_match(&entry.digest, &actual) => {}
            Ok(_) => issues.push(
                Issue::new(Severity::Prob, "tagmanifest", "tag file checksum mismatch")
                    .at(entry.path),
            ),
            Err(_) => issues.push(
                Issue::new(Severity::Prob, "tagmanifest", "listed tag file does not exist")
                    .at(entry.path),
            ),
        }
    }

    issues
}

pub(super) fn check_bag_info(bag: &Bag) -> Vec<Issue> {
    let Ok(text) = bag.read_to_string(&bag.bag_info_path()) else {
        return vec![
            Issue::new(Severity::Warn, "bag-info", "bag-info.txt is missing").at(bag::BAG_INFO_TXT),
        ];
    };

    let bag_info = match BagInfo::parse(&text) {
        Ok(info) => info,
        Err(e) => {
            return vec![Issue::new(Severity::Error, "bag-info", e.to_string()).at(bag::BAG_INFO_TXT)];
        }
    };

    let mut octets = 0u64;
    let files = bag.data_files().unwrap_or_default();
    for rel in &files {
        if let Ok(meta) = bag.data_file_path(rel).and_then(|p| Ok(std::fs::metadata(p)?)) {
            octets += meta.len();
        }
    }
    let count = files.len() as u64;

    let mut issues = Vec::new();
    match bag_info.payload_oxum() {
        Some((o, c)) if o == octets && c == count => {}
        Some((o, c)) => issues.push(
            Issue::new(
                Severity::Error,
                "bag-info",
                format!(
                    "Payload-Oxum {}.{} disagrees with data zone {}.{}",
                    o, c, octets, count
                ),
            )
            .at(bag::BAG_INFO_TXT),
        ),
        None => issues.push(
            Issue::new(Severity::Warn, "bag-info", "Payload-Oxum is missing or malformed")
                .at(bag::BAG_INFO_TXT),
        ),
    }

    issues.push(Issue::new(
        Severity::Info,
        "bag-info",
        format!("payload: {} file(s), {} octet(s)", count, octets),
    ));
    issues
}

#[cfg(test)]
mod tests {
    use super::super::Validator;
    use super::*;
    use crate::builder::BagBuilder;
    use crate::context::BuildContext;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn finished_bag(dir: &TempDir) -> Bag {
        let mut builder = BagBuilder::initialize(
            &BuildContext::default(),
            "ark:/88434/mds2-7",
            &dir.path().join("mds2-7"),
        )
        .unwrap();
        builder
            .set_component_metadata("", &json!({"title": "Test data", "accessLevel": "public"}))
            .unwrap();
        builder.add_data_file("a.csv", &b"1,2\n"[..]).unwrap();
        builder.add_data_file("b/c.csv", &b"3,4\n"[..]).unwrap();
        builder.finalize().unwrap();
        builder.bag().clone()
    }

    fn probs(bag: &Bag) -> Vec<Issue> {
        Validator::preservation_profile()
            .validate_bag(bag)
            .issues
            .into_iter()
            .filter(|i| i.severity == Severity::Prob)
            .collect()
    }

    #[test]
    fn test_finished_bag_is_conformant() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        let results = Validator::preservation_profile().validate_bag(&bag);
        assert!(results.is_conformant(), "{:?}", results.issues);
        assert_eq!(results.count(Severity::Error), 0);
        assert_eq!(results.count(Severity::Warn), 0);
        assert_eq!(results.count(Severity::Info), 1);
    }

    #[test]
    fn test_unlisted_data_file_is_one_prob() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        let path = bag.manifest_path(HashAlgorithm::Sha256);
        let text = fs::read_to_string(&path).unwrap();
        let kept: String = text
            .lines()
            .filter(|l| !l.ends_with("data/b/c.csv"))
            .map(|l| format!("{}\n", l))
            .collect();
        fs::write(&path, kept).unwrap();

        let about_file: Vec<Issue> = probs(&bag)
            .into_iter()
            .filter(|i| i.path.as_deref() == Some("data/b/c.csv"))
            .collect();
        assert_eq!(about_file.len(), 1);
        assert_eq!(about_file[0].code, "manifest");
    }

    #[test]
    fn test_changed_data_file_is_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);
        fs::write(bag.data_file_path("a.csv").unwrap(), b"9,9\n").unwrap();

        let issues = probs(&bag);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("checksum mismatch"));
        assert_eq!(issues[0].path.as_deref(), Some("data/a.csv"));
    }

    #[test]
    fn test_missing_required_field() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        let mut record = bag.read_json(&bag.resource_record_path()).unwrap();
        record.as_object_mut().unwrap().remove("title");
        bag.write_json(&bag.resource_record_path(), &record).unwrap();

        let issues = check_required_fields(&bag);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("'title'"));
    }

    #[test]
    fn test_stale_inventory_is_reported() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        let mut record = bag.read_json(&bag.resource_record_path()).unwrap();
        record["inventory"][0]["descCount"] = json!(99);
        bag.write_json(&bag.resource_record_path(), &record).unwrap();

        let issues = check_inventory(&bag);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("99"));

        record.as_object_mut().unwrap().remove("inventory");
        bag.write_json(&bag.resource_record_path(), &record).unwrap();
        assert_eq!(check_inventory(&bag).len(), 1);
    }

    #[test]
    fn test_component_without_record_and_stray_record() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        fs::remove_dir_all(bag.metadata_dir().join("a.csv")).unwrap();
        bag.write_json(
            &bag.metadata_record_path("ghost.csv").unwrap(),
            &json!({"filepath": "ghost.csv", "@type": ["nrdp:DataFile"]}),
        )
        .unwrap();

        let issues = check_components(&bag);
        let paths: Vec<&str> = issues.iter().filter_map(|i| i.path.as_deref()).collect();
        assert!(paths.contains(&"metadata/a.csv/record.json"));
        assert!(paths.contains(&"metadata/ghost.csv/record.json"));
        assert!(paths.contains(&"data/a.csv"));
        assert!(
            issues
                .iter()
                .any(|i| i.severity == Severity::Warn && i.path.as_deref() == Some("data/ghost.csv"))
        );
    }

    #[test]
    fn test_manifest_paths_outside_the_bag_are_prob() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);

        // A real file beside the bag with a matching digest
        fs::write(dir.path().join("outside.csv"), b"secret\n").unwrap();
        let digest = hash::hash_bytes(HashAlgorithm::Sha256, b"secret\n");
        for path in [
            bag.manifest_path(HashAlgorithm::Sha256),
            bag.tagmanifest_path(HashAlgorithm::Sha256),
        ] {
            let mut text = fs::read_to_string(&path).unwrap();
            text.push_str(&format!("{}  ../outside.csv\n", digest));
            fs::write(&path, text).unwrap();
        }

        let escaped: Vec<Issue> = probs(&bag)
            .into_iter()
            .filter(|i| i.path.as_deref() == Some("../outside.csv"))
            .collect();
        assert_eq!(escaped.len(), 2, "{:?}", escaped);
        assert!(escaped.iter().all(|i| i.message.contains("escapes the bag")));
        assert!(escaped.iter().any(|i| i.code == "manifest"));
        assert!(escaped.iter().any(|i| i.code == "tagmanifest"));
    }

    #[test]
    fn test_bag_relative_rejects_escapes() {
        assert_eq!(bag_relative("data/./a.csv").as_deref(), Some("data/a.csv"));
        assert_eq!(bag_relative("data/../../x"), None);
        assert_eq!(bag_relative("/etc/passwd"), None);
        assert_eq!(bag_relative("."), None);
    }

    #[test]
    fn test_missing_manifest_and_structure() {
        let dir = TempDir::new().unwrap();
        let bag = Bag::new(dir.path());

        let issues = check_structure(&bag);
        assert_eq!(issues.len(), 4);
        assert_eq!(check_manifest(&bag).len(), 1);
        assert_eq!(check_tagmanifest(&bag)[0].severity, Severity::Warn);
        assert_eq!(check_bag_info(&bag)[0].severity, Severity::Warn);
    }

    #[test]
    fn test_payload_oxum_mismatch_is_error() {
        let dir = TempDir::new().unwrap();
        let bag = finished_bag(&dir);
        fs::write(bag.data_file_path("a.csv").unwrap(), b"longer content\n").unwrap();

        let issues = check_bag_info(&bag);
        assert!(issues.iter().any(|i| i.severity == Severity::Error));
    }
}
