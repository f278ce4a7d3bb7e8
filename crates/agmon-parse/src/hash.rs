//! Deterministic content hashing of endpoint payloads.
//!
//! The hash is SHA-256 over a canonical JSON serialization (object keys
//! sorted recursively, compact separators), so it is stable under upstream
//! key reordering and under serialize/deserialize round-trips. Two editions
//! with the same hash for the same `(report_id, report_date)` are the same
//! edition.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Payloads;

/// Canonical hash of the full payload structure (one row list per endpoint).
pub fn payload_hash(payloads: &Payloads) -> String {
    let value = Value::Array(
        payloads
            .iter()
            .map(|rows| {
                Value::Array(rows.iter().map(|r| Value::Object(r.clone())).collect())
            })
            .collect(),
    );
    hash_value(&value)
}

/// SHA-256 hex digest of the canonical serialization of any JSON value.
pub fn hash_value(value: &Value) -> String {
    let canonical = canonicalize_json(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
