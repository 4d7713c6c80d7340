// src/nerdm/inventory.rs

//! Inventory assembly: per-collection child and descendant counts
//!
//! The inventory is always derived from the current component set and is
//! never treated as ground truth. For every collection `p`:
//!
//! ```text
//! descCount(p) = childCount(p) + sum(descCount(c) for each child collection c)
//! ```
//!
//! and the root's `descCount` equals the number of components. A component
//! whose path is the root itself counts toward the root's `descCount` but is
//! nobody's child.

use super::{Component, ComponentKind};
use crate::bag::parent_path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One inventory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub for_collection: String,
    pub child_count: usize,
    pub desc_count: usize,
}

/// Assembled inventory plus any non-fatal problems found on the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryReport {
    /// Root first, then breadth-first by path
    pub entries: Vec<InventoryEntry>,
    /// Components re-attached to the root because their parent is missing
    pub warnings: Vec<String>,
}

impl InventoryReport {
    pub fn entry(&self, collection: &str) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.for_collection == collection)
    }
}

/// Compute the inventory for a component set
pub fn assemble(components: &[Component]) -> InventoryReport {
    let collections: BTreeSet<&str> = std::iter::once("")
        .chain(
            components
                .iter()
                .filter(|c| c.kind == ComponentKind::Collection)
                .map(|c| c.path.as_str()),
        )
        .collect();

    let mut warnings = Vec::new();
    let mut root_self = 0usize;
    let mut children: HashMap<&str, Vec<&Component>> = HashMap::new();

    for component in components {
        if component.path.is_empty() {
            root_self += 1;
            continue;
        }

        let mut parent = parent_path(&component.path);
        if !collections.contains(parent) {
            warnings.push(format!(
                "component {} has no parent collection {}; attached to root",
                component.path, parent
            ));
            parent = "";
        }
        children.entry(parent).or_default().push(component);
    }

    let mut memo: HashMap<&str, usize> = HashMap::new();
    let mut entries: Vec<InventoryEntry> = collections
        .iter()
        .map(|&collection| {
            let child_count = children.get(collection).map_or(0, Vec::len);
            let mut desc_count = descendants(collection, &children, &mut memo);
            if collection.is_empty() {
                desc_count += root_self;
            }
            InventoryEntry {
                for_collection: collection.to_string(),
                child_count,
                desc_count,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        depth(&a.for_collection)
            .cmp(&depth(&b.for_collection))
            .then_with(|| a.for_collection.cmp(&b.for_collection))
    });

    InventoryReport { entries, warnings }
}

/// Post-order descendant count, memoised per collection
fn descendants<'a>(
    collection: &'a str,
    children: &HashMap<&'a str, Vec<&'a Component>>,
    memo: &mut HashMap<&'a str, usize>,
) -> usize {
    if let Some(&count) = memo.get(collection) {
        return count;
    }

    let mut count = 0;
    if let Some(kids) = children.get(collection) {
        count += kids.len();
        for kid in kids {
            if kid.kind == ComponentKind::Collection {
                count += descendants(kid.path.as_str(), children, memo);
            }
        }
    }

    memo.insert(collection, count);
    count
}

fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// Entries that differ between two inventories, keyed by collection
///
/// Returns `(collection, expected, found)` for every collection present in
/// either list whose entry is not identical in both.
pub fn diff(
    expected: &[InventoryEntry],
    found: &[InventoryEntry],
) -> Vec<(String, Option<InventoryEntry>, Option<InventoryEntry>)> {
    let expected_by: BTreeMap<&str, &InventoryEntry> = expected
        .iter()
        .map(|e| (e.for_collection.as_str(), e))
        .collect();
    let found_by: BTreeMap<&str, &InventoryEntry> = found
        .iter()
        .map(|e| (e.for_collection.as_str(), e))
        .collect();

    let keys: BTreeSet<&str> = expected_by.keys().chain(found_by.keys()).copied().collect();
    keys.into_iter()
        .filter_map(|key| {
            let e = expected_by.get(key).copied();
            let f = found_by.get(key).copied();
            if e == f {
                None
            } else {
                Some((key.to_string(), e.cloned(), f.cloned()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(collection: &str, child_count: usize, desc_count: usize) -> InventoryEntry {
        InventoryEntry {
            for_collection: collection.to_string(),
            child_count,
            desc_count,
        }
    }

    #[test]
    fn test_reference_hierarchy() {
        let components = vec![
            Component::collection(""),
            Component::file("a.csv"),
            Component::collection("b/"),
            Component::file("b/c.csv"),
        ];

        let report = assemble(&components);
        assert_eq!(report.entries, vec![entry("", 2, 4), entry("b", 1, 1)]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_empty_collection_gets_entry() {
        let report = assemble(&[Component::collection("empty")]);
        assert_eq!(report.entries, vec![entry("", 1, 1), entry("empty", 0, 0)]);
    }

    #[test]
    fn test_no_components() {
        assert_eq!(assemble(&[]).entries, vec![entry("", 0, 0)]);
    }

    #[test]
    fn test_nested_counts_are_additive() {
        let components = vec![
            Component::collection("x"),
            Component::collection("x/y"),
            Component::file("x/y/1.dat"),
            Component::file("x/y/2.dat"),
            Component::file("x/3.dat"),
            Component::collection("z"),
        ];

        let report = assemble(&components);
        assert_eq!(
            report.entries,
            vec![
                entry("", 2, 6),
                entry("x", 2, 4),
                entry("z", 0, 0),
                entry("x/y", 2, 2),
            ]
        );
    }

    #[test]
    fn test_orphan_attached_to_root_with_warning() {
        let components = vec![Component::file("missing/f.csv"), Component::file("a.csv")];

        let report = assemble(&components);
        assert_eq!(report.entries, vec![entry("", 2, 2)]);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("missing/f.csv"));
    }

    #[test]
    fn test_order_independent() {
        let forward = vec![
            Component::collection("b"),
            Component::file("b/c.csv"),
            Component::file("a.csv"),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(assemble(&forward), assemble(&backward));
    }

    #[test]
    fn test_diff_reports_changed_and_missing() {
        let expected = vec![entry("", 2, 3), entry("b", 1, 1)];
        let found = vec![entry("", 2, 4)];

        let changes = diff(&expected, &found);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, "");
        assert_eq!(changes[1], ("b".to_string(), Some(entry("b", 1, 1)), None));
    }
}
