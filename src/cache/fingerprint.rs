//! Reproducible identities for cache entries.
//!
//! A fingerprint is the blake3 hash of every input that affects a cached
//! value: the cache format version, a kind tag, and named parts rendered as
//! canonical (key-sorted) JSON. Changing any part yields a new fingerprint,
//! so stale entries are never matched.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CACHE_FORMAT_VERSION;

/// Hex-encoded blake3 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hashes a single JSON document.
    #[must_use]
    pub fn of_json(value: &serde_json::Value) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(canonical_json(value).as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Starts a fingerprint for a kind of cache entry.
    #[must_use]
    pub fn builder(kind: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(kind)
    }

    /// Hex digest, used as the entry file stem.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// Parses a fingerprint from an entry file stem.
    pub(crate) fn from_hex(hex: &str) -> Option<Self> {
        (hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())).then(|| Self(hex.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental fingerprint construction.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    fn new(kind: &str) -> Self {
        let mut builder = Self {
            hasher: blake3::Hasher::new(),
        };
        builder.field("version", &CACHE_FORMAT_VERSION.to_string());
        builder.field("kind", kind);
        builder
    }

    fn field(&mut self, name: &str, text: &str) {
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for chunk in [name, text] {
            self.hasher.update(&(chunk.len() as u64).to_le_bytes());
            self.hasher.update(chunk.as_bytes());
        }
    }

    /// Adds a named JSON part.
    #[must_use]
    pub fn part(mut self, name: &str, value: &serde_json::Value) -> Self {
        self.field(name, &canonical_json(value));
        self
    }

    /// Adds a named upstream fingerprint.
    #[must_use]
    pub fn upstream(mut self, name: &str, fingerprint: &Fingerprint) -> Self {
        self.field(name, fingerprint.as_str());
        self
    }

    /// Hashes the collected parts.
    #[must_use]
    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().to_hex().to_string())
    }
}

/// Renders JSON with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
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
