//! Canonical form and hashing for override mappings and research payloads.
//!
//! The canonical form is produced without going through a serialization library so the
//! rendered text (and therefore every hash) only depends on the data: object keys sorted,
//! compact separators, non-ASCII characters written as-is.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Fingerprint of an empty or absent override mapping
pub const DEFAULT_FINGERPRINT: &str = "default";

/// Closed set of containers a configuration value can normalize to
#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    Null,
    Bool(bool),
    /// Numbers keep their textual rendering so integers and floats stay distinct
    Number(String),
    Text(String),
    List(Vec<Canonical>),
    Map(BTreeMap<String, Canonical>),
}

/// Recursively normalize a JSON value (keys sorted at every level)
pub fn normalize(value: &Value) -> Canonical {
    match value {
        Value::Null => Canonical::Null,
        Value::Bool(b) => Canonical::Bool(*b),
        Value::Number(n) => Canonical::Number(n.to_string()),
        Value::String(s) => Canonical::Text(s.clone()),
        Value::Array(items) => Canonical::List(items.iter().map(normalize).collect()),
        Value::Object(map) => Canonical::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
    }
}

impl Canonical {
    /// Compact JSON text of the canonical form
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Canonical::Null => out.push_str("null"),
            Canonical::Bool(true) => out.push_str("true"),
            Canonical::Bool(false) => out.push_str("false"),
            Canonical::Number(n) => out.push_str(n),
            Canonical::Text(s) => write_escaped(s, out),
            Canonical::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.render_into(out);
                }
                out.push(']');
            }
            Canonical::Map(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_escaped(key, out);
                    out.push(':');
                    value.render_into(out);
                }
                out.push('}');
            }
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Lowercase hex sha256 of the canonical rendering
pub fn canonical_hash(value: &Value) -> String {
    let rendered = normalize(value).render();
    hex::encode(Sha256::digest(rendered.as_bytes()))
}

/// Deterministic fingerprint of an override mapping.
///
/// Empty mappings map to [`DEFAULT_FINGERPRINT`] instead of the hash of `{}`.
pub fn fingerprint_overrides(overrides: &serde_json::Map<String, Value>) -> String {
    if overrides.is_empty() {
        return DEFAULT_FINGERPRINT.to_string();
    }
    canonical_hash(&Value::Object(overrides.clone()))
}

/// Content hash of a research payload; `None` for null or empty payloads
pub fn hash_payload(payload: &Value) -> Option<String> {
    match payload {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(canonical_hash(other)),
    }
}
