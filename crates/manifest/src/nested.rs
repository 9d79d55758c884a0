//! Helpers for moving between nested and flattened row shapes.
//!
//! Three flattenings are used by the service:
//!
//! * [`flatten`] expands a nested value into flat dictionaries with
//!   dotted keys, one per combination of array elements. Array segments
//!   are marked with a `[]` suffix. Checksums are computed over this
//!   shape.
//! * [`list_rows`] mirrors every array subtree into per-item rows for
//!   the lists side table: one row per array element, keyed by the
//!   array's place, with the element flattened to dotted leaf places.
//! * [`nest`] rebuilds a nested object from dotted keys, the inverse
//!   used when shaping external source rows.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde_json::{Map, Value};

/// One mirrored row of an array subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRow {
    /// Place of the array this element belongs to.
    pub key: String,
    /// The element, flattened to `place -> leaf value`.
    pub data: Map<String, Value>,
}

/// Mirror every array subtree of `value` into per-element rows.
///
/// Nested arrays produce their own rows under their own place; their
/// values do not repeat in the parent element's row.
pub fn list_rows(value: &Value) -> Vec<ListRow> {
    let mut rows = Vec::new();
    if let Value::Object(map) = value {
        for (name, member) in map {
            descend(name, member, &mut rows);
        }
    }
    rows
}

fn descend(place: &str, value: &Value, rows: &mut Vec<ListRow>) {
    match value {
        Value::Array(items) => array_rows(place, items, rows),
        Value::Object(map) => {
            for (name, member) in map {
                descend(&join(place, name), member, rows);
            }
        }
        _ => {}
    }
}

fn array_rows(place: &str, items: &[Value], rows: &mut Vec<ListRow>) {
    for item in items {
        let mut data = Map::new();
        flatten_item(place, item, &mut data, rows);
        rows.push(ListRow {
            key: place.to_string(),
            data,
        });
    }
}

fn flatten_item(place: &str, value: &Value, data: &mut Map<String, Value>, rows: &mut Vec<ListRow>) {
    match value {
        Value::Object(map) => {
            for (name, member) in map {
                let member_place = join(place, name);
                match member {
                    Value::Array(items) => array_rows(&member_place, items, rows),
                    _ => flatten_item(&member_place, member, data, rows),
                }
            }
        }
        Value::Array(items) => array_rows(place, items, rows),
        Value::Null => {}
        scalar => {
            data.insert(place.to_string(), scalar.clone());
        }
    }
}

/// The subtree of `value` containing only paths that lead to an array,
/// or `None` when the value holds no arrays at all.
pub fn lists_only(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (k, v) in map {
                if let Some(v) = lists_only(v) {
                    result.insert(k.clone(), v);
                }
            }
            if result.is_empty() {
                None
            } else {
                Some(Value::Object(result))
            }
        }
        Value::Array(..) => Some(value.clone()),
        _ => None,
    }
}

/// Expand a nested value into flat dictionaries with dotted keys.
///
/// Arrays multiply: each output dictionary holds one combination of
/// array elements, with the array key marked by a `[]` suffix. Null
/// values are dropped.
pub fn flatten(value: &Value) -> Vec<BTreeMap<String, Value>> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &Value, out: &mut Vec<BTreeMap<String, Value>>) {
    let (data, lists) = split(value, &[]);

    if let Value::Array(..) = value {
        // A bare array flattens each element on its own.
        for (_, items) in lists {
            for item in items {
                flatten_into(&item, out);
            }
        }
        return;
    }

    if lists.is_empty() {
        out.push(data);
        return;
    }

    // One output per combination of elements across all arrays.
    let keys: Vec<String> = lists.iter().map(|(k, _)| k.clone()).collect();
    for combo in lists
        .into_iter()
        .map(|(_, items)| items)
        .multi_cartesian_product()
    {
        let mut val = Map::new();
        for (key, item) in keys.iter().zip(combo) {
            if !item.is_null() {
                val.insert(key.clone(), item);
            }
        }
        for (k, v) in &data {
            val.insert(k.clone(), v.clone());
        }
        flatten_into(&Value::Object(val), out);
    }
}

type Lists = Vec<(String, Vec<Value>)>;

fn split(value: &Value, key: &[&str]) -> (BTreeMap<String, Value>, Lists) {
    match value {
        Value::Object(map) => {
            let mut data = BTreeMap::new();
            let mut lists = Lists::new();
            for (k, v) in map {
                if v.is_null() {
                    continue;
                }
                let mut child_key = key.to_vec();
                child_key.push(k);
                let (d, more) = split(v, &child_key);
                data.extend(d);
                lists.extend(more);
            }
            (data, lists)
        }
        Value::Array(items) => {
            if items.is_empty() {
                (BTreeMap::new(), Lists::new())
            } else {
                let mut marked: Vec<String> = key.iter().map(|s| s.to_string()).collect();
                if let Some(last) = marked.last_mut() {
                    last.push_str("[]");
                }
                (
                    BTreeMap::new(),
                    vec![(marked.join("."), items.clone())],
                )
            }
        }
        Value::Null => (BTreeMap::new(), Lists::new()),
        scalar => {
            let mut data = BTreeMap::new();
            data.insert(key.join("."), scalar.clone());
            (data, Lists::new())
        }
    }
}

/// Rebuild a nested object from `dotted place -> value` pairs.
pub fn nest(flat: impl IntoIterator<Item = (String, Value)>) -> Value {
    let mut root = Map::new();
    for (key, value) in flat {
        let (path, leaf) = match key.rsplit_once('.') {
            Some((path, leaf)) => (path, leaf),
            None => ("", key.as_str()),
        };
        let mut node = &mut root;
        for part in path.split('.').filter(|p| !p.is_empty()) {
            let entry = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                // A scalar was written where a subtree now lands.
                *entry = Value::Object(Map::new());
            }
            node = entry.as_object_mut().expect("entry was just made an object");
        }
        node.insert(leaf.to_string(), value);
    }
    Value::Object(root)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        [prefix, name].join(".")
    }
}
