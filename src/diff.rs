use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{Attribute, StateValue};

/// Recursive JSON diff; leaf changes are reported with dotted paths.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            for (key, curr_val) in curr_map {
                let path = if path_prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{path_prefix}.{key}")
                };
                match prev_map.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None => {
                        if curr_val.is_object() {
                            diff_json(&Value::Object(serde_json::Map::new()), curr_val, &path, changes);
                        } else {
                            changes.push((path, Value::Null, curr_val.clone()));
                        }
                    }
                }
            }
            for (key, prev_val) in prev_map {
                if !curr_map.contains_key(key) {
                    let path = if path_prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{path_prefix}.{key}")
                    };
                    changes.push((path, prev_val.clone(), Value::Null));
                }
            }
        }
        (prev, curr) if prev != curr => {
            changes.push((path_prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

/// Entries of `incoming` whose value differs from (or is absent in) `known`.
pub(crate) fn diff_attributes(
    known: &BTreeMap<Attribute, StateValue>,
    incoming: Vec<(Attribute, StateValue)>,
) -> Vec<(Attribute, StateValue)> {
    incoming
        .into_iter()
        .filter(|(attr, value)| known.get(attr) != Some(value))
        .collect()
}
