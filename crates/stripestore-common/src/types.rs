//! Core type definitions for StripeStore

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque identifier of a file, assigned by the metadata node
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct FileId(String);

impl FileId {
    /// Create a file id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 64-bit placement hash of the id
    ///
    /// Used for on-disk directory placement and for routing requests to a
    /// storage thread, so it must stay stable across releases.
    #[must_use]
    pub fn placement_hash(&self) -> u64 {
        xxhash_rust::xxh64::xxh64(self.0.as_bytes(), 0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Milliseconds since the Unix epoch, used as snapshot timestamp
#[must_use]
pub fn global_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
