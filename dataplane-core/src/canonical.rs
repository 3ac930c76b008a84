//! Canonical JSON form.
//!
//! Every object's keys are sorted lexicographically at every depth; array
//! order is preserved. Two documents that are deeply equal therefore encode
//! to the same bytes regardless of how they were built, which is what makes
//! published artifacts reproducible and their hashes stable.

use serde::Serialize;
use serde_json::{Map, Value};

/// Rebuild a value with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical encoding of a JSON value (no trailing newline).
pub fn canonical_serialize(value: &Value) -> String {
    // Value's Display is infallible compact JSON.
    canonicalize(value).to_string()
}

/// Canonical encoding of any serializable document.
pub fn to_canonical_string<T: Serialize + ?Sized>(doc: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(doc)?;
    Ok(canonical_serialize(&value))
}

/// Canonical document bytes as written to disk: the canonical string plus `\n`.
pub fn to_canonical_document<T: Serialize + ?Sized>(doc: &T) -> serde_json::Result<Vec<u8>> {
    let mut text = to_canonical_string(doc)?;
    text.push('\n');
    Ok(text.into_bytes())
}

/// Canonical NDJSON: one canonical row per line, each newline-terminated.
pub fn to_canonical_ndjson<T: Serialize>(rows: &[T]) -> serde_json::Result<Vec<u8>> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&to_canonical_string(row)?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}
