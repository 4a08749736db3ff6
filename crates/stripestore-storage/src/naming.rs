//! Object file name codec
//!
//! Each stored object version is a single file whose name encodes
//! `(object_number, version, checksum)` as fixed-width upper-case hex:
//!
//! ```text
//! current: OOOOOOOOOOOOOOOO VVVVVVVVVVVVVVVV CCCCCCCCCCCCCCCC   (16 + 16 + 16)
//! legacy:  OOOOOOOOOOOOOOOO VVVVVVVV CCCCCCCC                   (16 + 8 + 8)
//! ```
//!
//! Legacy names are only parsed, never written.

use std::fmt;

/// Length of a current-format object file name
pub const NAME_LEN: usize = 48;

/// Length of a legacy object file name
pub const LEGACY_NAME_LEN: usize = 32;

/// Decoded object file name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectFileName {
    pub object_number: u64,
    pub version: u64,
    pub checksum: u64,
}

impl ObjectFileName {
    #[must_use]
    pub const fn new(object_number: u64, version: u64, checksum: u64) -> Self {
        Self {
            object_number,
            version,
            checksum,
        }
    }

    /// Current-format file name
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{:016X}{:016X}{:016X}",
            self.object_number, self.version, self.checksum
        )
    }

    /// Legacy file name, if version and checksum fit the narrower fields
    #[must_use]
    pub fn encode_legacy(&self) -> Option<String> {
        let version = u32::try_from(self.version).ok()?;
        let checksum = u32::try_from(self.checksum).ok()?;
        Some(format!(
            "{:016X}{:08X}{:08X}",
            self.object_number, version, checksum
        ))
    }

    /// Parse a file name in either format
    ///
    /// Returns `None` for auxiliary files and anything that is not a
    /// well-formed object name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if !name.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let (version_len, checksum_len) = match name.len() {
            NAME_LEN => (16, 16),
            LEGACY_NAME_LEN => (8, 8),
            _ => return None,
        };
        let object_number = u64::from_str_radix(&name[..16], 16).ok()?;
        let version = u64::from_str_radix(&name[16..16 + version_len], 16).ok()?;
        let checksum =
            u64::from_str_radix(&name[16 + version_len..16 + version_len + checksum_len], 16)
                .ok()?;
        Some(Self {
            object_number,
            version,
            checksum,
        })
    }
}

impl fmt::Display for ObjectFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
