//! Snapshot version table of a file
//!
//! Maps a snapshot timestamp to the per-object version vector and file size
//! that were current when the snapshot was taken.
//!
//! On-disk format (`.vtable`), records in ascending timestamp order, all
//! integers big-endian:
//! ```text
//! +-----------+----------+-------------+---------------------------+
//! | Timestamp | FileSize | ObjectCount | ObjectVersion x Count     |
//! | 8B        | 8B       | 8B          | 4B each                   |
//! +-----------+----------+-------------+---------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use stripestore_common::{Error, Result};
use tracing::debug;

const RECORD_HEADER_SIZE: usize = 24;

/// One recorded snapshot of a file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Version {
    /// Version of each object, indexed by object number; 0 = object absent
    pub object_versions: Vec<u64>,
    /// File size at snapshot time
    pub file_size: u64,
}

impl Version {
    /// Number of object slots
    #[must_use]
    pub fn object_count(&self) -> u64 {
        self.object_versions.len() as u64
    }

    /// Version of an object in this snapshot, 0 if it did not exist
    #[must_use]
    pub fn object_version(&self, object_number: u64) -> u64 {
        usize::try_from(object_number)
            .ok()
            .and_then(|idx| self.object_versions.get(idx))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object_versions.is_empty() && self.file_size == 0
    }
}

/// Timestamp-ordered snapshot history of one file
#[derive(Debug)]
pub struct VersionTable {
    path: PathBuf,
    versions: BTreeMap<u64, Version>,
}

impl VersionTable {
    /// Create an empty table persisted at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            versions: BTreeMap::new(),
        }
    }

    /// Load a table from `path`; a missing file yields an empty table
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut table = Self::new(path);
        let data = match fs::read(&table.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(table),
            Err(e) => return Err(e.into()),
        };
        table.versions = Self::decode(&data)?;
        debug!(
            "loaded version table {:?} with {} entries",
            table.path,
            table.versions.len()
        );
        Ok(table)
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest snapshot taken at or before `timestamp`
    ///
    /// Returns an empty version if no such snapshot exists.
    #[must_use]
    pub fn latest_version_before(&self, timestamp: u64) -> Version {
        self.versions
            .range(..=timestamp)
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Record a snapshot, replacing any entry with the same timestamp
    pub fn add_version(&mut self, timestamp: u64, object_versions: Vec<u64>, file_size: u64) {
        self.versions.insert(
            timestamp,
            Version {
                object_versions,
                file_size,
            },
        );
    }

    /// Drop the snapshot recorded at `timestamp`
    pub fn remove_version(&mut self, timestamp: u64) -> Option<Version> {
        self.versions.remove(&timestamp)
    }

    /// Whether any snapshot references `version` of `object_number`
    #[must_use]
    pub fn is_contained(&self, object_number: u64, version: u64) -> bool {
        version != 0
            && self
                .versions
                .values()
                .any(|v| v.object_version(object_number) == version)
    }

    /// Snapshot timestamps in ascending order
    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.versions.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Persist the table to its backing file
    pub fn save(&self) -> Result<()> {
        let buf = self.encode()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("saved version table {:?} ({} entries)", self.path, self.versions.len());
        Ok(())
    }

    /// Remove the backing file
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        for (timestamp, version) in &self.versions {
            buf.put_u64(*timestamp);
            buf.put_u64(version.file_size);
            buf.put_u64(version.object_count());
            for &v in &version.object_versions {
                let v = u32::try_from(v).map_err(|_| {
                    Error::invalid_params(format!(
                        "object version {v} does not fit the version table format"
                    ))
                })?;
                buf.put_u32(v);
            }
        }
        Ok(buf)
    }

    fn decode(mut data: &[u8]) -> Result<BTreeMap<u64, Version>> {
        let mut versions = BTreeMap::new();
        while data.has_remaining() {
            if data.remaining() < RECORD_HEADER_SIZE {
                return Err(Error::corrupt("truncated version table record header"));
            }
            let timestamp = data.get_u64();
            let file_size = data.get_u64();
            let count = data.get_u64();
            let needed = count
                .checked_mul(4)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::corrupt("version table object count overflow"))?;
            if data.remaining() < needed {
                return Err(Error::corrupt("truncated version table record"));
            }
            let object_versions = (0..count).map(|_| u64::from(data.get_u32())).collect();
            versions.insert(
                timestamp,
                Version {
                    object_versions,
                    file_size,
                },
            );
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_latest_version_before() {
        let dir = tempdir().unwrap();
        let mut table = VersionTable::new(dir.path().join(".vtable"));

        assert!(table.latest_version_before(100).is_empty());

        table.add_version(100, vec![1, 1], 2048);
        table.add_version(200, vec![2, 1, 1], 3000);

        assert!(table.latest_version_before(99).is_empty());
        assert_eq!(table.latest_version_before(100).object_versions, vec![1, 1]);
        assert_eq!(table.latest_version_before(150).file_size, 2048);
        assert_eq!(table.latest_version_before(u64::MAX).file_size, 3000);
    }

    #[test]
    fn test_add_version_overwrites_same_timestamp() {
        let dir = tempdir().unwrap();
        let mut table = VersionTable::new(dir.path().join(".vtable"));
        table.add_version(100, vec![1], 10);
        table.add_version(100, vec![2], 20);
        assert_eq!(table.len(), 1);
        assert_eq!(table.latest_version_before(100).object_versions, vec![2]);

        assert!(table.remove_version(100).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_is_contained() {
        let dir = tempdir().unwrap();
        let mut table = VersionTable::new(dir.path().join(".vtable"));
        table.add_version(100, vec![1, 0, 3], 5000);

        assert!(table.is_contained(0, 1));
        assert!(table.is_contained(2, 3));
        assert!(!table.is_contained(0, 2));
        assert!(!table.is_contained(1, 0));
        assert!(!table.is_contained(9, 1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".vtable");

        let mut table = VersionTable::new(&path);
        table.add_version(300, vec![4, 4, 2], 9000);
        table.add_version(100, vec![1], 512);
        table.save().unwrap();

        // 2 records: 24 + 12 and 24 + 4 bytes
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);
        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[..8], &100u64.to_be_bytes());

        let loaded = VersionTable::load(&path).unwrap();
        assert_eq!(loaded.timestamps().collect::<Vec<_>>(), vec![100, 300]);
        assert_eq!(loaded.latest_version_before(300), table.latest_version_before(300));
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".vtable");
        assert!(VersionTable::load(&path).unwrap().is_empty());

        fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(VersionTable::load(&path), Err(Error::Corrupt(_))));

        let mut record = Vec::new();
        record.extend_from_slice(&1u64.to_be_bytes());
        record.extend_from_slice(&0u64.to_be_bytes());
        record.extend_from_slice(&5u64.to_be_bytes());
        record.extend_from_slice(&[0u8; 8]);
        fs::write(&path, record).unwrap();
        assert!(matches!(VersionTable::load(&path), Err(Error::Corrupt(_))));
    }
}
