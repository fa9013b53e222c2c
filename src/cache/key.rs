//! Stable cache keys for (question, context) pairs.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash of a structured execution context (tenant, visible tables, user
/// scope). Object keys are sorted at every depth before hashing, so insertion
/// order never changes the result.
pub fn derive_context_hash(context: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(context, &mut canonical);
    sha256_hex(&canonical)
}

/// `H(normalize(query) ++ context_hash)`.
pub fn derive_query_hash(query: &str, context_hash: &str) -> String {
    let mut material = normalize_query(query);
    material.push_str(context_hash);
    sha256_hex(&material)
}

pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
