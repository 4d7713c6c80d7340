// src/nerdm/merge.rs

//! Metadata merge policy for component and resource records
//!
//! - objects merge recursively, field by field, last write wins
//! - arrays and scalars are replaced wholesale
//! - a `null` value removes the field
//! - fields absent from the update are left alone

use serde_json::{Map, Value};

pub fn merge_record(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(update_obj) => match target.get_mut(key) {
                Some(Value::Object(target_obj)) => merge_record(target_obj, update_obj),
                _ => {
                    target.insert(key.clone(), strip_nulls(value));
                }
            },
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Copy of a value with removal markers dropped from nested objects
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
