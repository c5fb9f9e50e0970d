//! Content hashing for job identity.
//!
//! A job's identity is the hash of its full configuration. Hashing goes
//! through canonical JSON (sorted keys, no whitespace) so that two
//! structurally-equal configs always produce the same hash regardless of
//! field order in the source document.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A job-config content hash.
///
/// First 16 bytes of the SHA-256 over the canonical JSON of the config,
/// rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHash(String);

impl JobHash {
    /// Compute the hash of an arbitrary JSON value.
    pub fn of_value(value: &serde_json::Value) -> Self {
        let canonical = canonical_json(value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an already-computed hash string.
    ///
    /// Used when a hash arrives over the wire (e.g. in an unschedule
    /// request path segment).
    pub fn from_hex(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic task id for one ordinal of a job: `<job-hash>-<ordinal>`.
pub fn task_id(hash: &JobHash, ordinal: u32) -> String {
    format!("{}-{}", hash.as_str(), ordinal)
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}
