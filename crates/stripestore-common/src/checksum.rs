//! Checksum providers for object data
//!
//! Object checksums are always computed over the complete materialized
//! object and stored as a 64-bit value in the object's file name. A value of
//! 0 means checksums are disabled for that object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Digest algorithm used for object checksums
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32C (hardware accelerated where available)
    Crc32c,
    /// xxHash64 with seed 0
    #[default]
    Xxhash64,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32c => write!(f, "crc32c"),
            Self::Xxhash64 => write!(f, "xxhash64"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "crc32c" => Ok(Self::Crc32c),
            "xxhash64" | "xxh64" => Ok(Self::Xxhash64),
            other => Err(crate::Error::Configuration(format!(
                "unknown checksum algorithm: {other}"
            ))),
        }
    }
}

/// Pluggable digest algorithm for object checksums
pub trait ChecksumProvider: Send + Sync {
    /// Name of the algorithm, for logging
    fn name(&self) -> &'static str;

    /// Compute the checksum of a complete object
    fn checksum(&self, data: &[u8]) -> u64;

    /// Verify data against a stored checksum
    fn verify(&self, data: &[u8], expected: u64) -> bool {
        self.checksum(data) == expected
    }
}

/// CRC32C provider, widened to 64 bits
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32cChecksum;

impl ChecksumProvider for Crc32cChecksum {
    fn name(&self) -> &'static str {
        "crc32c"
    }

    fn checksum(&self, data: &[u8]) -> u64 {
        u64::from(crc32c::crc32c(data))
    }
}

/// xxHash64 provider
#[derive(Debug, Default, Clone, Copy)]
pub struct XxHash64Checksum;

impl ChecksumProvider for XxHash64Checksum {
    fn name(&self) -> &'static str {
        "xxhash64"
    }

    fn checksum(&self, data: &[u8]) -> u64 {
        xxhash_rust::xxh64::xxh64(data, 0)
    }
}

/// Create a shared provider for the given algorithm
#[must_use]
pub fn checksum_provider(algorithm: ChecksumAlgorithm) -> Arc<dyn ChecksumProvider> {
    match algorithm {
        ChecksumAlgorithm::Crc32c => Arc::new(Crc32cChecksum),
        ChecksumAlgorithm::Xxhash64 => Arc::new(XxHash64Checksum),
    }
}
