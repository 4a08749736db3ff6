//! Hashed directory storage layout
//!
//! Layout on the local file system:
//! ```text
//! <root>/.version                       layout format tag (ASCII integer)
//! <root>/A3/0F/7C/11/<file_id>/         hash prefix directories + file directory
//!     .tepoch                           truncate epoch (8B big-endian)
//!     .vtable                           snapshot version table
//!     .curr_file_ver                    current-version index (8B per object)
//!     <object><version><checksum>       one file per stored object version
//! ```
//!
//! The file id is hashed with xxh64 and the hex digest is cut into
//! `prefix_len` character segments, one per directory level, which bounds
//! both fan-out and depth regardless of the number of files.

use crate::bitmap::ObjectBitmap;
use crate::layout::{
    FileEntry, FileListCursor, ObjectInformation, ObjectVersionEntry, StorageLayout,
};
use crate::metadata::FileMetadata;
use crate::naming::ObjectFileName;
use crate::version_table::VersionTable;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stripestore_common::config::StorageConfig;
use stripestore_common::{
    ChecksumAlgorithm, ChecksumProvider, Error, FileId, Result, StripingPolicy,
    checksum_provider,
};
use tracing::{debug, info, warn};

/// Current layout format tag
pub const LAYOUT_VERSION: u32 = 2;

/// Older format tags that are upgraded in place
///
/// Version 1 stored object names in the 32 character legacy form, which
/// is still readable.
pub const UPGRADABLE_VERSIONS: &[u32] = &[1];

pub const VERSION_FILENAME: &str = ".version";
pub const TEPOCH_FILENAME: &str = ".tepoch";
pub const VTABLE_FILENAME: &str = ".vtable";
pub const CURRENT_VER_FILENAME: &str = ".curr_file_ver";

/// Settings of a hashed storage layout
#[derive(Clone, Debug)]
pub struct HashLayoutConfig {
    pub root: PathBuf,
    pub checksums_enabled: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub max_subdirs_per_level: u32,
    pub max_dir_depth: u32,
}

impl HashLayoutConfig {
    /// Default settings rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            checksums_enabled: false,
            checksum_algorithm: ChecksumAlgorithm::default(),
            max_subdirs_per_level: 256,
            max_dir_depth: 4,
        }
    }

    #[must_use]
    pub fn with_checksums(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksums_enabled = true;
        self.checksum_algorithm = algorithm;
        self
    }
}

impl From<&StorageConfig> for HashLayoutConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            checksums_enabled: config.checksums_enabled,
            checksum_algorithm: config.checksum_algorithm,
            max_subdirs_per_level: config.max_subdirs_per_level,
            max_dir_depth: config.max_dir_depth,
        }
    }
}

/// Layout statistics
#[derive(Debug, Default)]
pub struct LayoutStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub truncates: AtomicU64,
    pub deletes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub checksum_errors: AtomicU64,
}

/// Storage layout placing each file in a hashed directory tree
pub struct HashStorageLayout {
    root: PathBuf,
    prefix_len: usize,
    depth: usize,
    checksums: Option<Arc<dyn ChecksumProvider>>,
    stats: LayoutStats,
}

/// Current version of an object as found on disk
struct StoredVersion {
    version: u64,
    path: PathBuf,
}

impl HashStorageLayout {
    /// Open (or initialize) a layout and check its format tag
    pub fn open(config: HashLayoutConfig) -> Result<Self> {
        if config.max_subdirs_per_level < 2 {
            return Err(Error::Configuration(
                "max_subdirs_per_level must be at least 2".into(),
            ));
        }
        fs::create_dir_all(&config.root)?;

        // smallest number of hex digits addressing max_subdirs_per_level
        let mut prefix_len = 1usize;
        while prefix_len < 16 && 16u64.pow(prefix_len as u32) < u64::from(config.max_subdirs_per_level)
        {
            prefix_len += 1;
        }
        let depth = (config.max_dir_depth as usize).min(16 / prefix_len);

        let checksums = config
            .checksums_enabled
            .then(|| checksum_provider(config.checksum_algorithm));

        let layout = Self {
            root: config.root,
            prefix_len,
            depth,
            checksums,
            stats: LayoutStats::default(),
        };
        layout.check_and_convert_version()?;

        info!(
            "opened hash storage layout at {:?} (prefix {} x {}, checksums {})",
            layout.root,
            layout.prefix_len,
            layout.depth,
            layout
                .checksums
                .as_ref()
                .map_or("disabled", |c| c.name())
        );
        Ok(layout)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn stats(&self) -> &LayoutStats {
        &self.stats
    }

    /// Directory holding all files of `file_id`
    #[must_use]
    pub fn file_dir(&self, file_id: &FileId) -> PathBuf {
        let hash = format!("{:016X}", file_id.placement_hash());
        let mut path = self.root.clone();
        for level in 0..self.depth {
            let start = level * self.prefix_len;
            path.push(&hash[start..start + self.prefix_len]);
        }
        path.push(file_id.as_str());
        path
    }

    fn check_and_convert_version(&self) -> Result<()> {
        let path = self.root.join(VERSION_FILENAME);
        let found = match fs::read_to_string(&path) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::write_version_tag(&path)?;
                debug!("initialized layout version tag at {:?}", path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match found.parse::<u32>() {
            Ok(LAYOUT_VERSION) => Ok(()),
            Ok(old) if UPGRADABLE_VERSIONS.contains(&old) => {
                info!("upgrading storage layout from version {} to {}", old, LAYOUT_VERSION);
                Self::write_version_tag(&path)
            }
            _ => Err(Error::IncompatibleFormat {
                found,
                expected: LAYOUT_VERSION,
            }),
        }
    }

    fn write_version_tag(path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "{LAYOUT_VERSION}")?;
        file.sync_all()?;
        Ok(())
    }

    fn compute_checksum(&self, data: &[u8]) -> u64 {
        self.checksums.as_ref().map_or(0, |c| c.checksum(data))
    }

    /// Path of an object version, trying the current then the legacy name
    fn locate_object(
        dir: &Path,
        object_number: u64,
        version: u64,
        checksum: u64,
    ) -> Option<PathBuf> {
        let name = ObjectFileName::new(object_number, version, checksum);
        let path = dir.join(name.encode());
        if path.exists() {
            return Some(path);
        }
        name.encode_legacy()
            .map(|legacy| dir.join(legacy))
            .filter(|p| p.exists())
    }

    fn current_version(
        dir: &Path,
        md: &FileMetadata,
        object_number: u64,
    ) -> Option<StoredVersion> {
        let version = md.latest_version(object_number);
        if version == 0 {
            return None;
        }
        let checksum = md.checksum(object_number, version);
        Self::locate_object(dir, object_number, version, checksum)
            .map(|path| StoredVersion { version, path })
    }

    fn write_file(path: &Path, data: &[u8], sync: bool) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(data)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Write a complete object version and retire the previous one
    #[allow(clippy::too_many_arguments)]
    fn complete_write(
        &self,
        dir: &Path,
        md: &mut FileMetadata,
        object_number: u64,
        data: &[u8],
        new_version: u64,
        sync: bool,
        old: Option<StoredVersion>,
        delete_old_version: bool,
    ) -> Result<()> {
        let checksum = self.compute_checksum(data);
        let new_path = dir.join(ObjectFileName::new(object_number, new_version, checksum).encode());
        Self::write_file(&new_path, data, sync)?;
        self.retire_old_version(md, object_number, old, &new_path, new_version, delete_old_version)?;
        md.set_checksum(object_number, new_version, checksum);
        Ok(())
    }

    /// Remove the superseded version file after a new one was written
    ///
    /// A file with the same version but another checksum is always removed.
    fn retire_old_version(
        &self,
        md: &mut FileMetadata,
        object_number: u64,
        old: Option<StoredVersion>,
        new_path: &Path,
        new_version: u64,
        delete_old_version: bool,
    ) -> Result<()> {
        let Some(old) = old else {
            return Ok(());
        };
        if old.path == new_path {
            return Ok(());
        }
        if old.version == new_version {
            fs::remove_file(&old.path)?;
            return Ok(());
        }
        if delete_old_version {
            match fs::remove_file(&old.path) {
                Ok(()) => md.remove_checksum(object_number, old.version),
                Err(e) => warn!("failed to remove superseded version {:?}: {}", old.path, e),
            }
        }
        Ok(())
    }

    /// Rebuild a full object from its current version with `data` at `offset`
    fn cow(old: Option<&StoredVersion>, data: &[u8], offset: usize) -> Result<Vec<u8>> {
        let mut buf = match old {
            Some(old) => fs::read(&old.path)?,
            None => Vec::new(),
        };
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(buf)
    }

    #[allow(clippy::too_many_arguments)]
    fn partial_write_cow(
        &self,
        dir: &Path,
        md: &mut FileMetadata,
        object_number: u64,
        data: &[u8],
        offset: u32,
        new_version: u64,
        sync: bool,
        old: Option<StoredVersion>,
        delete_old_version: bool,
    ) -> Result<()> {
        let buf = Self::cow(old.as_ref(), data, offset as usize)?;
        self.complete_write(dir, md, object_number, &buf, new_version, sync, old, delete_old_version)
    }

    #[allow(clippy::too_many_arguments)]
    fn partial_write_no_cow(
        dir: &Path,
        md: &mut FileMetadata,
        object_number: u64,
        data: &[u8],
        offset: u32,
        new_version: u64,
        sync: bool,
        old: Option<StoredVersion>,
    ) -> Result<()> {
        let new_path = dir.join(ObjectFileName::new(object_number, new_version, 0).encode());
        let path = old.as_ref().map_or_else(|| new_path.clone(), |o| o.path.clone());

        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(&path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        file.write_all(data)?;
        if sync {
            file.sync_data()?;
        }
        drop(file);

        if path != new_path {
            fs::rename(&path, &new_path)?;
        }
        if let Some(old) = old {
            md.remove_checksum(object_number, old.version);
        }
        md.set_checksum(object_number, new_version, 0);
        Ok(())
    }

    fn read_truncate_epoch(dir: &Path) -> Result<u64> {
        match fs::read(dir.join(TEPOCH_FILENAME)) {
            Ok(data) => {
                let raw: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corrupt(format!("{TEPOCH_FILENAME} must be 8 bytes")))?;
                Ok(i64::from_be_bytes(raw).max(0) as u64)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read_current_versions(dir: &Path) -> Result<Option<Vec<u64>>> {
        let data = match fs::read(dir.join(CURRENT_VER_FILENAME)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() % 8 != 0 {
            warn!(
                "ignoring {} trailing bytes of {:?}",
                data.len() % 8,
                dir.join(CURRENT_VER_FILENAME)
            );
        }
        Ok(Some(
            data.chunks_exact(8)
                .map(|c| u64::from_be_bytes(c.try_into().unwrap_or_default()))
                .collect(),
        ))
    }

    /// Parsed object files of a directory with their sizes
    fn list_object_files(dir: &Path) -> Result<Vec<(ObjectFileName, u64)>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut objects = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                // concurrent deletes are expected during scans
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match ObjectFileName::parse(name) {
                Some(parsed) => {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    objects.push((parsed, size));
                }
                None => warn!("ignoring unexpected file {:?} in {:?}", name, dir),
            }
        }
        Ok(objects)
    }

    fn summarize_file_dir(dir: &Path) -> Result<Option<FileEntry>> {
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let objects = Self::list_object_files(dir)?;
        let present: ObjectBitmap = objects.iter().map(|(o, _)| o.object_number).collect();
        Ok(Some(FileEntry {
            file_id: FileId::new(name),
            object_count: present.count_ones(),
            last_object: present.last_one(),
            bytes_on_disk: objects.iter().map(|(_, size)| size).sum(),
        }))
    }

    fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.path())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Remove empty hash directories above a deleted file directory
    fn prune_empty_parents(&self, dir: &Path) {
        let mut current = dir.parent();
        while let Some(parent) = current {
            if parent == self.root || !parent.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(parent).is_err() {
                break;
            }
            current = parent.parent();
        }
    }
}

impl StorageLayout for HashStorageLayout {
    fn check_compatibility(&self) -> Result<()> {
        self.check_and_convert_version()
    }

    fn checksums_enabled(&self) -> bool {
        self.checksums.is_some()
    }

    fn load_file_metadata(
        &self,
        file_id: &FileId,
        policy: &StripingPolicy,
    ) -> Result<FileMetadata> {
        let dir = self.file_dir(file_id);
        let version_table = VersionTable::load(dir.join(VTABLE_FILENAME))?;
        let mut md = FileMetadata::new(*policy, version_table);
        if !dir.is_dir() {
            return Ok(md);
        }

        md.set_truncate_epoch(Self::read_truncate_epoch(&dir)?);

        let mut sizes: BTreeMap<(u64, u64), u64> = BTreeMap::new();
        for (name, size) in Self::list_object_files(&dir)? {
            let key = (name.object_number, name.version);
            if sizes.insert(key, size).is_some() {
                warn!(
                    "{}: object {} version {} stored with several checksums",
                    file_id, name.object_number, name.version
                );
            }
            md.observe_version(name.object_number, name.version);
            md.set_checksum(name.object_number, name.version, name.checksum);
        }

        match Self::read_current_versions(&dir)? {
            Some(current) => {
                md.set_tracks_current_versions(true);
                for (object_number, version) in current.into_iter().enumerate() {
                    if version == 0 {
                        continue;
                    }
                    let object_number = object_number as u64;
                    if sizes.contains_key(&(object_number, version)) {
                        md.set_latest_version(object_number, version);
                    } else {
                        warn!(
                            "{}: current version {} of object {} missing on disk",
                            file_id, version, object_number
                        );
                    }
                }
            }
            None => {
                let largest: Vec<(u64, u64)> = md.largest_versions().collect();
                for (object_number, version) in largest {
                    md.set_latest_version(object_number, version);
                }
            }
        }

        let last_object = md.latest_versions().map(|(o, _)| o).max();
        md.set_last_object_number(last_object);
        md.set_global_last_object_number(last_object);
        if let Some(last) = last_object {
            let version = md.latest_version(last);
            let length = sizes.get(&(last, version)).copied().unwrap_or(0);
            md.set_file_size(policy.file_size_after(last, length));
        }

        debug!(
            "{}: loaded metadata, last object {:?}, size {}, epoch {}",
            file_id,
            md.last_object_number(),
            md.file_size(),
            md.truncate_epoch()
        );
        Ok(md)
    }

    fn read_object(
        &self,
        file_id: &FileId,
        md: &FileMetadata,
        object_number: u64,
        version: u64,
        offset: u32,
        length: Option<u32>,
    ) -> Result<ObjectInformation> {
        let stripe_size = md.stripe_size();
        let end = u64::from(offset) + u64::from(length.unwrap_or(0));
        if u64::from(offset) > u64::from(stripe_size) || end > u64::from(stripe_size) {
            return Err(Error::invalid_params(format!(
                "read range {offset}+{length:?} exceeds stripe size {stripe_size}"
            )));
        }
        if version == 0 {
            return Ok(ObjectInformation::does_not_exist(stripe_size));
        }

        let checksum = md.checksum(object_number, version);
        let dir = self.file_dir(file_id);
        let Some(path) = Self::locate_object(&dir, object_number, version, checksum) else {
            return Ok(ObjectInformation::does_not_exist(stripe_size));
        };

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ObjectInformation::does_not_exist(stripe_size));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let start = u64::from(offset).min(file_len);
        let stop = match length {
            Some(len) => (u64::from(offset) + u64::from(len)).min(file_len),
            None => file_len,
        };

        let mut data = vec![0u8; (stop - start) as usize];
        if !data.is_empty() {
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut data)?;
        }

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(ObjectInformation::exists(
            Bytes::from(data),
            stripe_size,
            version,
            checksum,
        ))
    }

    fn write_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        data: &[u8],
        object_number: u64,
        offset: u32,
        new_version: u64,
        sync: bool,
        cow: bool,
    ) -> Result<()> {
        let stripe_size = u64::from(md.stripe_size());
        if u64::from(offset) + data.len() as u64 > stripe_size {
            return Err(Error::invalid_params(format!(
                "write of {} bytes at offset {} exceeds stripe size {}",
                data.len(),
                offset,
                stripe_size
            )));
        }

        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let old = Self::current_version(&dir, md, object_number);

        let range_write = offset > 0 || (data.len() as u64) < stripe_size;
        if range_write {
            if cow || self.checksums_enabled() {
                self.partial_write_cow(
                    &dir, md, object_number, data, offset, new_version, sync, old, !cow,
                )?;
            } else {
                Self::partial_write_no_cow(&dir, md, object_number, data, offset, new_version, sync, old)?;
            }
        } else {
            self.complete_write(&dir, md, object_number, data, new_version, sync, old, !cow)?;
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(
            "{}: wrote object {} version {} ({} bytes at {}, cow={})",
            file_id,
            object_number,
            new_version,
            data.len(),
            offset,
            cow
        );
        Ok(())
    }

    fn truncate_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        new_length: u64,
        new_version: u64,
        cow: bool,
    ) -> Result<()> {
        if new_length > u64::from(md.stripe_size()) {
            return Err(Error::invalid_params(format!(
                "object length {} exceeds stripe size {}",
                new_length,
                md.stripe_size()
            )));
        }

        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let old = Self::current_version(&dir, md, object_number);

        if cow || self.checksums_enabled() {
            let mut buf = match &old {
                Some(old) => fs::read(&old.path)?,
                None => Vec::new(),
            };
            buf.resize(new_length as usize, 0);
            self.complete_write(&dir, md, object_number, &buf, new_version, false, old, !cow)?;
        } else {
            let new_path = dir.join(ObjectFileName::new(object_number, new_version, 0).encode());
            let path = old.as_ref().map_or_else(|| new_path.clone(), |o| o.path.clone());
            let file = OpenOptions::new().write(true).create(true).truncate(false).open(&path)?;
            file.set_len(new_length)?;
            drop(file);
            if path != new_path {
                fs::rename(&path, &new_path)?;
            }
            if let Some(old) = old {
                md.remove_checksum(object_number, old.version);
            }
            md.set_checksum(object_number, new_version, 0);
        }

        self.stats.truncates.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{}: truncated object {} to {} bytes as version {}",
            file_id, object_number, new_length, new_version
        );
        Ok(())
    }

    fn create_padding_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        version: u64,
        size: u64,
    ) -> Result<()> {
        if size > u64::from(md.stripe_size()) {
            return Err(Error::invalid_params(format!(
                "padding object of {} bytes exceeds stripe size {}",
                size,
                md.stripe_size()
            )));
        }
        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let old = Self::current_version(&dir, md, object_number);

        let zeros = vec![0u8; size as usize];
        self.complete_write(&dir, md, object_number, &zeros, version, false, old, false)?;
        debug!(
            "{}: created padding object {} version {} ({} bytes)",
            file_id, object_number, version, size
        );
        Ok(())
    }

    fn delete_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        version: u64,
    ) -> Result<()> {
        let dir = self.file_dir(file_id);
        let checksum = md.checksum(object_number, version);
        if let Some(path) = Self::locate_object(&dir, object_number, version, checksum) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        md.remove_checksum(object_number, version);
        debug!("{}: deleted object {} version {}", file_id, object_number, version);
        Ok(())
    }

    fn delete_file(&self, file_id: &FileId, delete_metadata: bool) -> Result<()> {
        let dir = self.file_dir(file_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let is_metadata = name.to_str().is_some_and(|n| n.starts_with('.'));
            if is_metadata && !delete_metadata {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if delete_metadata {
            fs::remove_dir(&dir)?;
            self.prune_empty_parents(&dir);
        }
        info!("{}: deleted file (metadata: {})", file_id, delete_metadata);
        Ok(())
    }

    fn update_current_obj_version(
        &self,
        file_id: &FileId,
        object_number: u64,
        version: u64,
    ) -> Result<()> {
        let slot = object_number.checked_mul(8).ok_or_else(|| {
            Error::invalid_params(format!("object {object_number} has no version index slot"))
        })?;
        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(CURRENT_VER_FILENAME))?;
        file.seek(SeekFrom::Start(slot))?;
        file.write_all(&version.to_be_bytes())?;
        Ok(())
    }

    fn update_current_version_size(
        &self,
        file_id: &FileId,
        new_last_object: Option<u64>,
    ) -> Result<()> {
        let len = match new_last_object {
            Some(last) => last
                .checked_add(1)
                .and_then(|n| n.checked_mul(8))
                .ok_or_else(|| {
                    Error::invalid_params(format!("object {last} has no version index slot"))
                })?,
            None => 0,
        };
        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(CURRENT_VER_FILENAME))?;
        file.set_len(len)?;
        Ok(())
    }

    fn set_truncate_epoch(&self, file_id: &FileId, epoch: u64) -> Result<()> {
        let dir = self.file_dir(file_id);
        fs::create_dir_all(&dir)?;
        let epoch = i64::try_from(epoch)
            .map_err(|_| Error::invalid_params(format!("truncate epoch {epoch} out of range")))?;
        let mut file = File::create(dir.join(TEPOCH_FILENAME))?;
        file.write_all(&epoch.to_be_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn file_exists(&self, file_id: &FileId) -> bool {
        self.file_dir(file_id).is_dir()
    }

    fn object_set(&self, file_id: &FileId) -> Result<ObjectBitmap> {
        let objects = Self::list_object_files(&self.file_dir(file_id))?;
        Ok(objects.iter().map(|(o, _)| o.object_number).collect())
    }

    fn object_versions(&self, file_id: &FileId) -> Result<Vec<ObjectVersionEntry>> {
        let mut versions: Vec<ObjectVersionEntry> =
            Self::list_object_files(&self.file_dir(file_id))?
                .into_iter()
                .map(|(name, size)| ObjectVersionEntry {
                    object_number: name.object_number,
                    version: name.version,
                    checksum: name.checksum,
                    size,
                })
                .collect();
        versions.sort_by_key(|v| (v.object_number, v.version));
        Ok(versions)
    }

    fn file_list(
        &self,
        cursor: &mut FileListCursor,
        max_entries: usize,
    ) -> Result<Vec<FileEntry>> {
        if !cursor.started {
            cursor.started = true;
            cursor.pending.push((self.root.clone(), 0));
        }

        let mut files = Vec::new();
        while files.len() < max_entries {
            let Some((dir, level)) = cursor.pending.pop() else {
                break;
            };
            if level > self.depth {
                if let Some(entry) = Self::summarize_file_dir(&dir)? {
                    files.push(entry);
                }
                continue;
            }
            // push in reverse so the smallest name is visited first
            for sub in Self::sorted_subdirs(&dir)?.into_iter().rev() {
                cursor.pending.push((sub, level + 1));
            }
        }
        Ok(files)
    }

    fn verify_object(
        &self,
        file_id: &FileId,
        md: &FileMetadata,
        object_number: u64,
        version: u64,
    ) -> Result<()> {
        let Some(provider) = &self.checksums else {
            return Ok(());
        };
        let expected = md.checksum(object_number, version);
        let dir = self.file_dir(file_id);
        let path = Self::locate_object(&dir, object_number, version, expected).ok_or_else(|| {
            Error::not_found(format!(
                "{file_id}: object {object_number} version {version}"
            ))
        })?;
        let data = fs::read(path)?;
        let actual = provider.checksum(&data);
        if actual != expected {
            self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: checksum mismatch on object {} version {}",
                file_id, object_number, version
            );
            return Err(Error::ChecksumMismatch {
                object_number,
                version,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ObjectStatus;
    use rand::RngCore;
    use tempfile::tempdir;

    const STRIPE: u32 = 1024;

    fn layout(root: &Path) -> HashStorageLayout {
        HashStorageLayout::open(HashLayoutConfig::new(root)).unwrap()
    }

    fn checksum_layout(root: &Path) -> HashStorageLayout {
        HashStorageLayout::open(
            HashLayoutConfig::new(root).with_checksums(ChecksumAlgorithm::Crc32c),
        )
        .unwrap()
    }

    fn open(layout: &HashStorageLayout, id: &FileId) -> FileMetadata {
        layout
            .load_file_metadata(id, &StripingPolicy::single(STRIPE))
            .unwrap()
    }

    fn write(
        layout: &HashStorageLayout,
        id: &FileId,
        md: &mut FileMetadata,
        object: u64,
        offset: u32,
        data: &[u8],
        version: u64,
        cow: bool,
    ) {
        layout
            .write_object(id, md, data, object, offset, version, false, cow)
            .unwrap();
        md.update_object_version(object, version);
    }

    #[test]
    fn test_file_dir_placement() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:1");
        let path = layout.file_dir(&id);

        let rel = path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_str().unwrap().to_string()).collect();
        assert_eq!(parts.len(), 5);
        assert!(parts[..4].iter().all(|p| p.len() == 2));
        assert_eq!(parts[4], "vol:1");
        assert_eq!(layout.file_dir(&id), path);
    }

    #[test]
    fn test_prefix_length_follows_subdir_limit() {
        let dir = tempdir().unwrap();
        let mut config = HashLayoutConfig::new(dir.path());
        config.max_subdirs_per_level = 4096;
        config.max_dir_depth = 2;
        let layout = HashStorageLayout::open(config).unwrap();
        let rel = layout.file_dir(&FileId::new("f")).strip_prefix(dir.path()).unwrap().to_path_buf();
        let parts: Vec<_> = rel.iter().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 3);
    }

    #[test]
    fn test_version_tag() {
        let dir = tempdir().unwrap();
        let _ = layout(dir.path());
        let tag = fs::read_to_string(dir.path().join(VERSION_FILENAME)).unwrap();
        assert_eq!(tag.trim(), LAYOUT_VERSION.to_string());

        fs::write(dir.path().join(VERSION_FILENAME), "1\n").unwrap();
        let _ = layout(dir.path());
        let tag = fs::read_to_string(dir.path().join(VERSION_FILENAME)).unwrap();
        assert_eq!(tag.trim(), LAYOUT_VERSION.to_string());

        fs::write(dir.path().join(VERSION_FILENAME), "99\n").unwrap();
        let result = HashStorageLayout::open(HashLayoutConfig::new(dir.path()));
        assert!(matches!(result, Err(Error::IncompatibleFormat { .. })));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:roundtrip");
        let mut md = open(&layout, &id);

        let mut data = vec![0u8; STRIPE as usize];
        rand::thread_rng().fill_bytes(&mut data);
        write(&layout, &id, &mut md, 0, 0, &data, 1, false);

        let info = layout.read_object(&id, &md, 0, 1, 0, None).unwrap();
        assert_eq!(info.status, ObjectStatus::Exists);
        assert_eq!(&info.data[..], &data[..]);

        let info = layout.read_object(&id, &md, 0, 1, 100, Some(10)).unwrap();
        assert_eq!(&info.data[..], &data[100..110]);
    }

    #[test]
    fn test_read_absent_object() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:absent");
        let md = open(&layout, &id);

        let info = layout.read_object(&id, &md, 3, 1, 0, None).unwrap();
        assert_eq!(info.status, ObjectStatus::DoesNotExist);
        let info = layout.read_object(&id, &md, 3, 0, 0, None).unwrap();
        assert_eq!(info.status, ObjectStatus::DoesNotExist);
    }

    #[test]
    fn test_write_rejects_overflowing_range() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:overflow");
        let mut md = open(&layout, &id);

        let result = layout.write_object(&id, &mut md, &[1u8; 10], 0, STRIPE - 5, 1, false, false);
        assert!(matches!(result, Err(Error::InvalidParams(_))));
        assert!(!layout.file_dir(&id).join(ObjectFileName::new(0, 1, 0).encode()).exists());
    }

    #[test]
    fn test_partial_write_in_place_renames_version() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:inplace");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"hello", 1, false);
        write(&layout, &id, &mut md, 0, 3, b"p!", 2, false);

        let versions = layout.object_versions(&id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 2);

        let info = layout.read_object(&id, &md, 0, 2, 0, None).unwrap();
        assert_eq!(&info.data[..], b"help!");
    }

    #[test]
    fn test_cow_keeps_previous_version() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:cow");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"original", 1, true);
        write(&layout, &id, &mut md, 0, 2, b"XX", 2, true);

        let old = layout.read_object(&id, &md, 0, 1, 0, None).unwrap();
        assert_eq!(&old.data[..], b"original");
        let new = layout.read_object(&id, &md, 0, 2, 0, None).unwrap();
        assert_eq!(&new.data[..], b"orXXinal");
        assert_eq!(layout.object_versions(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_cow_zero_pads_gap() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:gap");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"ab", 1, true);
        write(&layout, &id, &mut md, 0, 5, b"cd", 2, true);
        let info = layout.read_object(&id, &md, 0, 2, 0, None).unwrap();
        assert_eq!(&info.data[..], b"ab\0\0\0cd");
    }

    #[test]
    fn test_checksums_cover_full_object() {
        let dir = tempdir().unwrap();
        let layout = checksum_layout(dir.path());
        let id = FileId::new("vol:sums");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"0123456789", 1, false);
        write(&layout, &id, &mut md, 0, 4, b"ab", 2, false);

        let expected = checksum_provider(ChecksumAlgorithm::Crc32c).checksum(b"0123ab6789");
        assert_eq!(md.checksum(0, 2), expected);
        assert_eq!(md.checksum(0, 1), 0);
        layout.verify_object(&id, &md, 0, 2).unwrap();

        let versions = layout.object_versions(&id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].checksum, expected);
    }

    #[test]
    fn test_corruption_is_detected() {
        let dir = tempdir().unwrap();
        let layout = checksum_layout(dir.path());
        let id = FileId::new("vol:corrupt");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"payload", 1, false);
        let name = ObjectFileName::new(0, 1, md.checksum(0, 1)).encode();
        fs::write(layout.file_dir(&id).join(name), b"pAyload").unwrap();

        let result = layout.verify_object(&id, &md, 0, 1);
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert_eq!(layout.stats().checksum_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_truncate_object_in_place() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:trunc");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, &[7u8; 100], 1, false);
        layout.truncate_object(&id, &mut md, 0, 40, 1, false).unwrap();
        let info = layout.read_object(&id, &md, 0, 1, 0, None).unwrap();
        assert_eq!(info.data.len(), 40);

        layout.truncate_object(&id, &mut md, 0, 60, 2, false).unwrap();
        md.update_object_version(0, 2);
        let info = layout.read_object(&id, &md, 0, 2, 0, None).unwrap();
        assert_eq!(info.data.len(), 60);
        assert!(info.data[40..].iter().all(|&b| b == 0));
        assert_eq!(layout.object_versions(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_padding_object() {
        let dir = tempdir().unwrap();
        let layout = checksum_layout(dir.path());
        let id = FileId::new("vol:pad");
        let mut md = open(&layout, &id);

        layout.create_padding_object(&id, &mut md, 2, 1, u64::from(STRIPE)).unwrap();
        md.update_object_version(2, 1);
        let info = layout.read_object(&id, &md, 2, 1, 0, None).unwrap();
        assert_eq!(info.data.len(), STRIPE as usize);
        assert!(info.data.iter().all(|&b| b == 0));
        layout.verify_object(&id, &md, 2, 1).unwrap();
    }

    #[test]
    fn test_load_metadata_from_disk() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:reload");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, &[1u8; STRIPE as usize], 1, false);
        write(&layout, &id, &mut md, 2, 0, &[2u8; 100], 1, false);
        layout.set_truncate_epoch(&id, 3).unwrap();

        let reloaded = open(&layout, &id);
        assert_eq!(reloaded.last_object_number(), Some(2));
        assert_eq!(reloaded.global_last_object_number(), Some(2));
        assert_eq!(reloaded.file_size(), 2 * u64::from(STRIPE) + 100);
        assert_eq!(reloaded.truncate_epoch(), 3);
        assert_eq!(reloaded.latest_version(0), 1);
        assert_eq!(reloaded.latest_version(1), 0);

        let raw = fs::read(layout.file_dir(&id).join(TEPOCH_FILENAME)).unwrap();
        assert_eq!(raw, 3i64.to_be_bytes());
    }

    #[test]
    fn test_current_version_index() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:curr");
        let mut md = open(&layout, &id);

        write(&layout, &id, &mut md, 0, 0, b"v1", 1, true);
        write(&layout, &id, &mut md, 0, 0, b"v2", 2, true);
        write(&layout, &id, &mut md, 1, 0, b"other", 1, true);
        layout.update_current_obj_version(&id, 0, 1).unwrap();
        layout.update_current_obj_version(&id, 1, 1).unwrap();

        let index = fs::read(layout.file_dir(&id).join(CURRENT_VER_FILENAME)).unwrap();
        assert_eq!(index.len(), 16);

        let reloaded = open(&layout, &id);
        assert!(reloaded.tracks_current_versions());
        assert_eq!(reloaded.latest_version(0), 1);
        assert_eq!(reloaded.largest_version(0), 2);
        assert!(reloaded.versions_consistent());

        layout.update_current_version_size(&id, Some(0)).unwrap();
        let reloaded = open(&layout, &id);
        assert_eq!(reloaded.latest_version(1), 0);
        assert_eq!(reloaded.last_object_number(), Some(0));

        // an empty index hides every object
        layout.update_current_version_size(&id, None).unwrap();
        let reloaded = open(&layout, &id);
        assert!(reloaded.tracks_current_versions());
        assert_eq!(reloaded.last_object_number(), None);
        assert_eq!(reloaded.largest_version(0), 2);
    }

    #[test]
    fn test_version_index_slot_out_of_range() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:slots");
        let result = layout.update_current_obj_version(&id, u64::MAX / 4, 1);
        assert!(matches!(result, Err(Error::InvalidParams(_))));
        let result = layout.update_current_version_size(&id, Some(u64::MAX));
        assert!(matches!(result, Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_legacy_file_names_are_readable() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:legacy");
        let file_dir = layout.file_dir(&id);
        fs::create_dir_all(&file_dir).unwrap();
        let legacy = ObjectFileName::new(0, 5, 0).encode_legacy().unwrap();
        fs::write(file_dir.join(legacy), b"old data").unwrap();

        let mut md = open(&layout, &id);
        assert_eq!(md.latest_version(0), 5);
        let info = layout.read_object(&id, &md, 0, 5, 0, None).unwrap();
        assert_eq!(&info.data[..], b"old data");

        // an overwrite replaces the legacy file with a current-format name
        write(&layout, &id, &mut md, 0, 0, b"new", 6, false);
        let names: Vec<_> = fs::read_dir(&file_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![ObjectFileName::new(0, 6, 0).encode()]);
    }

    #[test]
    fn test_delete_file() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:delete");
        let mut md = open(&layout, &id);
        write(&layout, &id, &mut md, 0, 0, b"x", 1, false);
        layout.set_truncate_epoch(&id, 1).unwrap();

        layout.delete_file(&id, false).unwrap();
        assert!(layout.file_exists(&id));
        assert_eq!(layout.object_set(&id).unwrap().count_ones(), 0);
        assert_eq!(open(&layout, &id).truncate_epoch(), 1);

        layout.delete_file(&id, true).unwrap();
        assert!(!layout.file_exists(&id));
        // only the version tag remains under the root
        let remaining: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn test_object_set_and_delete_object() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let id = FileId::new("vol:set");
        let mut md = open(&layout, &id);
        for object in [0u64, 2, 5] {
            write(&layout, &id, &mut md, object, 0, b"data", 1, false);
        }
        let set = layout.object_set(&id).unwrap();
        assert_eq!(set.iter_ones().collect::<Vec<_>>(), vec![0, 2, 5]);

        layout.delete_object(&id, &mut md, 2, 1).unwrap();
        let set = layout.object_set(&id).unwrap();
        assert_eq!(set.iter_ones().collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn test_file_list_pagination() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        for i in 0..7 {
            let id = FileId::new(format!("vol:{i}"));
            let mut md = open(&layout, &id);
            write(&layout, &id, &mut md, 0, 0, b"abc", 1, false);
            write(&layout, &id, &mut md, 1, 0, b"de", 1, false);
        }

        let mut cursor = FileListCursor::new();
        let mut seen = Vec::new();
        loop {
            let page = layout.file_list(&mut cursor, 3).unwrap();
            assert!(page.len() <= 3);
            if page.is_empty() {
                break;
            }
            seen.extend(page);
        }
        assert!(cursor.is_finished());
        assert_eq!(seen.len(), 7);
        for entry in &seen {
            assert_eq!(entry.object_count, 2);
            assert_eq!(entry.last_object, Some(1));
            assert_eq!(entry.bytes_on_disk, 5);
        }
        let mut ids: Vec<_> = seen.iter().map(|e| e.file_id.to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 7);
    }
}
