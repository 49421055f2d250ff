//! Argument redaction and canonical JSON serialization.
//!
//! Both are pure functions over the recursive [`Value`](crate::types::Value)
//! tree so the hash chain, the rule engine's `argument_pattern` matcher, and
//! the anomaly detector's fingerprinting all observe byte-identical input.

use crate::types::Value;
use std::collections::BTreeMap;

/// Field name substrings (case-insensitive) that trigger redaction.
const SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "api-key",
    "accesskey",
    "access_key",
    "access-key",
    "privatekey",
    "private_key",
    "private-key",
    "credential",
    "auth",
    "bearer",
    "jwt",
];

const REDACTED: &str = "[REDACTED]";

fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Recursively redact any map value whose key name matches a sensitive
/// pattern. Null/undefined values are preserved; arrays and nested objects
/// are recursed into.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::List(items) => Value::List(items.iter().map(redact).collect()),
        Value::Map(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                if is_sensitive_field(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Map(out)
        }
    }
}

/// Serialize a value to canonical JSON: object keys sorted lexicographically
/// at every level, no extraneous whitespace. `Value::Map` is already a
/// `BTreeMap` so key ordering falls out of the type; this function only has
/// to avoid whitespace and keep recursion explicit for lists.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Map(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_else(|_| "\"\"".to_string()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}
