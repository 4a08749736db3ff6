//! In-memory bookkeeping of one open file

use crate::version_table::VersionTable;
use std::collections::HashMap;
use stripestore_common::StripingPolicy;

/// Version, checksum and size state of a file held by this OSD
///
/// Two version maps are kept. `latest` is the current file version used by
/// reads and overwrites; `largest` is the highest version ever observed for
/// each object and drives new version numbers. They only differ while old
/// versions are retained for snapshots, and `largest[o] >= latest[o]` holds
/// for every object.
#[derive(Debug)]
pub struct FileMetadata {
    striping_policy: StripingPolicy,
    latest_versions: HashMap<u64, u64>,
    largest_versions: HashMap<u64, u64>,
    checksums: HashMap<(u64, u64), u64>,
    file_size: u64,
    last_object_number: Option<u64>,
    global_last_object_number: Option<u64>,
    truncate_epoch: u64,
    tracks_current_versions: bool,
    version_table: VersionTable,
}

impl FileMetadata {
    /// Metadata of a file without any stored objects
    #[must_use]
    pub fn new(striping_policy: StripingPolicy, version_table: VersionTable) -> Self {
        Self {
            striping_policy,
            latest_versions: HashMap::new(),
            largest_versions: HashMap::new(),
            checksums: HashMap::new(),
            file_size: 0,
            last_object_number: None,
            global_last_object_number: None,
            truncate_epoch: 0,
            tracks_current_versions: false,
            version_table,
        }
    }

    #[must_use]
    pub const fn striping_policy(&self) -> &StripingPolicy {
        &self.striping_policy
    }

    #[must_use]
    pub const fn stripe_size(&self) -> u32 {
        self.striping_policy.stripe_size
    }

    /// Current version of an object, 0 if it does not exist
    #[must_use]
    pub fn latest_version(&self, object_number: u64) -> u64 {
        self.latest_versions.get(&object_number).copied().unwrap_or(0)
    }

    /// Largest version ever observed for an object, 0 if none
    #[must_use]
    pub fn largest_version(&self, object_number: u64) -> u64 {
        self.largest_versions.get(&object_number).copied().unwrap_or(0)
    }

    /// Make `version` the current version of an object after a successful write
    pub fn update_object_version(&mut self, object_number: u64, version: u64) {
        self.latest_versions.insert(object_number, version);
        let largest = self.largest_versions.entry(object_number).or_insert(0);
        *largest = (*largest).max(version);
    }

    /// Set only the current version (used when rebuilding from a version index)
    pub fn set_latest_version(&mut self, object_number: u64, version: u64) {
        self.latest_versions.insert(object_number, version);
    }

    /// Raise the largest observed version of an object
    pub fn observe_version(&mut self, object_number: u64, version: u64) {
        let largest = self.largest_versions.entry(object_number).or_insert(0);
        *largest = (*largest).max(version);
    }

    /// Drop an object from the current file version
    ///
    /// With `retain_largest` the largest observed version is kept so that
    /// new versions never collide with retained snapshot versions.
    pub fn remove_object(&mut self, object_number: u64, retain_largest: bool) {
        self.latest_versions.remove(&object_number);
        if !retain_largest {
            self.largest_versions.remove(&object_number);
        }
    }

    /// Checksum of an object version, 0 if unknown or disabled
    #[must_use]
    pub fn checksum(&self, object_number: u64, version: u64) -> u64 {
        self.checksums
            .get(&(object_number, version))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_checksum(&mut self, object_number: u64, version: u64, checksum: u64) {
        self.checksums.insert((object_number, version), checksum);
    }

    pub fn remove_checksum(&mut self, object_number: u64, version: u64) {
        self.checksums.remove(&(object_number, version));
    }

    /// Current object versions, unordered
    pub fn latest_versions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.latest_versions.iter().map(|(&o, &v)| (o, v))
    }

    /// Largest observed object versions, unordered
    pub fn largest_versions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.largest_versions.iter().map(|(&o, &v)| (o, v))
    }

    /// Highest current version of any object
    #[must_use]
    pub fn max_object_version(&self) -> u64 {
        self.latest_versions.values().copied().max().unwrap_or(0)
    }

    /// Current versions as a dense vector indexed `0..=last_object_number`
    ///
    /// Slots of objects without a current version are 0.
    #[must_use]
    pub fn dense_object_versions(&self) -> Vec<u64> {
        let len = self
            .latest_versions
            .keys()
            .copied()
            .max()
            .map_or(0, |max| max as usize + 1);
        let mut versions = vec![0u64; len];
        for (&object_number, &version) in &self.latest_versions {
            versions[object_number as usize] = version;
        }
        versions
    }

    /// Check `largest[o] >= latest[o]` for every current object
    #[must_use]
    pub fn versions_consistent(&self) -> bool {
        self.latest_versions
            .iter()
            .all(|(o, &v)| self.largest_versions.get(o).is_some_and(|&l| l >= v))
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn set_file_size(&mut self, file_size: u64) {
        self.file_size = file_size;
    }

    /// Highest object number stored locally, `None` for an empty file
    #[must_use]
    pub const fn last_object_number(&self) -> Option<u64> {
        self.last_object_number
    }

    pub fn set_last_object_number(&mut self, last_object_number: Option<u64>) {
        self.last_object_number = last_object_number;
    }

    /// Number of objects implied by the last local object number
    #[must_use]
    pub fn object_count(&self) -> u64 {
        self.last_object_number.map_or(0, |n| n + 1)
    }

    /// Highest object number learned from any replica
    #[must_use]
    pub const fn global_last_object_number(&self) -> Option<u64> {
        self.global_last_object_number
    }

    pub fn set_global_last_object_number(&mut self, global_last_object_number: Option<u64>) {
        self.global_last_object_number = global_last_object_number;
    }

    /// Apply a GMAX hint from another OSD
    ///
    /// The hint is accepted if it is for the current truncate epoch and
    /// raises the known maximum, or if it is for a later epoch. Returns
    /// whether the hint was applied.
    pub fn apply_gmax(&mut self, truncate_epoch: u64, last_object: u64) -> bool {
        let newer_max = truncate_epoch == self.truncate_epoch
            && self.global_last_object_number.is_none_or(|g| last_object > g);
        if newer_max || truncate_epoch > self.truncate_epoch {
            self.global_last_object_number = Some(last_object);
            true
        } else {
            false
        }
    }

    /// Largest of the local and the global last object number
    #[must_use]
    pub fn known_last_object(&self) -> Option<u64> {
        self.last_object_number.max(self.global_last_object_number)
    }

    #[must_use]
    pub const fn truncate_epoch(&self) -> u64 {
        self.truncate_epoch
    }

    pub fn set_truncate_epoch(&mut self, truncate_epoch: u64) {
        self.truncate_epoch = truncate_epoch;
    }

    /// Whether the file keeps a current-version index on disk
    ///
    /// Once started, the index must follow every change of the current
    /// view, otherwise a reload would lose objects.
    #[must_use]
    pub const fn tracks_current_versions(&self) -> bool {
        self.tracks_current_versions
    }

    pub fn set_tracks_current_versions(&mut self, tracks: bool) {
        self.tracks_current_versions = tracks;
    }

    /// Whether the current version of an object belongs to a snapshot
    #[must_use]
    pub fn is_snapshot_referenced(&self, object_number: u64) -> bool {
        self.version_table
            .is_contained(object_number, self.latest_version(object_number))
    }

    #[must_use]
    pub const fn version_table(&self) -> &VersionTable {
        &self.version_table
    }

    pub fn version_table_mut(&mut self) -> &mut VersionTable {
        &mut self.version_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FileMetadata {
        FileMetadata::new(
            StripingPolicy::single(1024),
            VersionTable::new("/nonexistent/.vtable"),
        )
    }

    #[test]
    fn test_latest_and_largest_track_together() {
        let mut md = metadata();
        md.update_object_version(0, 1);
        md.update_object_version(0, 2);
        assert_eq!(md.latest_version(0), 2);
        assert_eq!(md.largest_version(0), 2);
        assert!(md.versions_consistent());
    }

    #[test]
    fn test_largest_never_decreases() {
        let mut md = metadata();
        md.observe_version(3, 7);
        md.set_latest_version(3, 5);
        assert_eq!(md.latest_version(3), 5);
        assert_eq!(md.largest_version(3), 7);

        md.update_object_version(3, 6);
        assert_eq!(md.largest_version(3), 7);
        assert!(md.versions_consistent());
    }

    #[test]
    fn test_remove_object() {
        let mut md = metadata();
        md.update_object_version(1, 4);
        md.remove_object(1, true);
        assert_eq!(md.latest_version(1), 0);
        assert_eq!(md.largest_version(1), 4);

        md.update_object_version(2, 4);
        md.remove_object(2, false);
        assert_eq!(md.largest_version(2), 0);
    }

    #[test]
    fn test_dense_object_versions() {
        let mut md = metadata();
        assert!(md.dense_object_versions().is_empty());
        md.update_object_version(0, 2);
        md.update_object_version(3, 1);
        assert_eq!(md.dense_object_versions(), vec![2, 0, 0, 1]);
        assert_eq!(md.max_object_version(), 2);
    }

    #[test]
    fn test_gmax_filtering() {
        let mut md = metadata();
        md.set_last_object_number(Some(3));
        md.set_global_last_object_number(Some(3));

        assert!(md.apply_gmax(0, 5));
        assert_eq!(md.global_last_object_number(), Some(5));

        // smaller maximum in the same epoch is stale
        assert!(!md.apply_gmax(0, 4));
        assert_eq!(md.global_last_object_number(), Some(5));

        md.set_truncate_epoch(2);
        assert!(!md.apply_gmax(1, 100));
        // a later epoch may lower the maximum after a shrink
        assert!(md.apply_gmax(3, 1));
        assert_eq!(md.global_last_object_number(), Some(1));
        assert_eq!(md.known_last_object(), Some(3));
    }

    #[test]
    fn test_checksums() {
        let mut md = metadata();
        md.set_checksum(0, 1, 0xabc);
        assert_eq!(md.checksum(0, 1), 0xabc);
        assert_eq!(md.checksum(0, 2), 0);
        md.remove_checksum(0, 1);
        assert_eq!(md.checksum(0, 1), 0);
    }
}
