use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content fingerprint: lowercase hex SHA-256 over raw bytes.
///
/// Every cache validation and content-hash comparison in the system goes
/// through this type. Changing the algorithm invalidates every stored
/// `content_hash` and requires a full re-index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint of a JSON value in canonical encoding.
    ///
    /// serde_json's default map is key-ordered, so serializing a `Value`
    /// yields the same bytes for semantically identical objects regardless
    /// of insertion order. Query-cache keys rely on this.
    pub fn of_canonical_json(value: &serde_json::Value) -> Self {
        Self::of(canonical_json(value).as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
