//! Cache-key derivation.
//!
//! Equal settings must always produce equal keys, regardless of key
//! order, and `$`-prefixed settings are caller-private hints that never
//! participate in cache identity.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Key under which a run's progress record is stored.
pub fn progress_key(cache_key: &str) -> String {
    format!("{cache_key}-progress")
}

/// Derive the cache key for `(id, settings)`: drop `$`-prefixed keys,
/// serialize with deeply sorted keys, and hash. Settings that project to
/// nothing yield the bare id.
pub fn derive_key(id: &str, settings: &Value) -> String {
    let projected = project(settings);
    if is_empty(&projected) {
        return id.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(stable_stringify(&projected).as_bytes());
    format!("{}-{:x}", id, hasher.finalize())
}

fn project(settings: &Value) -> Value {
    match settings {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// JSON serialization with deeply sorted object keys, so semantically
/// equal values always serialize identically.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_stable(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
