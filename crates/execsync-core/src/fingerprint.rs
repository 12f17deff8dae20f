//! Per-record sync metadata and content hashing.
//!
//! A fingerprint captures the state both sides agreed on after the last
//! successful reconciliation of a record. It is embedded in the stored record;
//! absence means the record has never been reconciled.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Source-relative path of the file that held the record.
    pub file_path: String,
    pub file_mtime: DateTime<Utc>,
    /// Hex SHA-256 of the file (documents) or of the item's line (list items).
    pub file_hash: String,
    pub store_revision_time: DateTime<Utc>,
}

/// A content hash representing file state at time of read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_content(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Truncate a timestamp to whole milliseconds, the precision both sides share.
pub fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(time.timestamp_millis())
        .single()
        .unwrap_or(time)
}
