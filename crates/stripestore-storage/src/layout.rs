//! Storage layout contract
//!
//! A storage layout maps object operations of a file onto durable local
//! state. Callers update the in-memory version maps of `FileMetadata` only
//! after a layout call returns successfully; layouts maintain the checksum
//! map because checksums are part of the on-disk object identity.

use crate::bitmap::ObjectBitmap;
use crate::metadata::FileMetadata;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use stripestore_common::{Error, FileId, Result, StripingPolicy};

/// Outcome of reading an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectStatus {
    /// The object version is stored locally
    Exists,
    /// No such object version is stored locally
    DoesNotExist,
    /// The object is a hole within the file and reads as zeros
    PaddingObject,
}

/// Data and identity of a read object
#[derive(Clone, Debug)]
pub struct ObjectInformation {
    pub status: ObjectStatus,
    /// Bytes starting at the requested offset
    pub data: Bytes,
    pub stripe_size: u32,
    pub version: u64,
    pub checksum: u64,
}

impl ObjectInformation {
    #[must_use]
    pub fn exists(data: Bytes, stripe_size: u32, version: u64, checksum: u64) -> Self {
        Self {
            status: ObjectStatus::Exists,
            data,
            stripe_size,
            version,
            checksum,
        }
    }

    #[must_use]
    pub fn does_not_exist(stripe_size: u32) -> Self {
        Self {
            status: ObjectStatus::DoesNotExist,
            data: Bytes::new(),
            stripe_size,
            version: 0,
            checksum: 0,
        }
    }

    /// A hole of `length` zero bytes
    #[must_use]
    pub fn padding(stripe_size: u32, length: usize) -> Self {
        Self {
            status: ObjectStatus::PaddingObject,
            data: BytesMut::zeroed(length).freeze(),
            stripe_size,
            version: 0,
            checksum: 0,
        }
    }

    /// Zero-fill a short read of an object that is not the file's last
    ///
    /// Objects before the last one are logically full; bytes missing on
    /// disk read as zeros up to the requested length (or the rest of the
    /// stripe for whole-object reads).
    #[must_use]
    pub fn padded(mut self, offset: u32, length: Option<u32>) -> Self {
        let wanted = length.unwrap_or(self.stripe_size.saturating_sub(offset)) as usize;
        if self.data.len() < wanted {
            let mut buf = BytesMut::with_capacity(wanted);
            buf.extend_from_slice(&self.data);
            buf.resize(wanted, 0);
            self.data = buf.freeze();
        }
        self
    }
}

/// One stored object version, as listed for scrubbing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectVersionEntry {
    pub object_number: u64,
    pub version: u64,
    pub checksum: u64,
    pub size: u64,
}

/// Summary of one stored file, as listed for auditing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub file_id: FileId,
    /// Number of distinct object numbers present
    pub object_count: u64,
    pub last_object: Option<u64>,
    /// Bytes used by all object versions
    pub bytes_on_disk: u64,
}

/// Resume position of a paginated file listing
#[derive(Clone, Debug, Default)]
pub struct FileListCursor {
    pub(crate) pending: Vec<(PathBuf, usize)>,
    pub(crate) started: bool,
}

impl FileListCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the listing has visited every directory
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.started && self.pending.is_empty()
    }
}

/// Reject file ids that cannot be used as a directory name
pub fn validate_file_id(file_id: &FileId) -> Result<()> {
    let id = file_id.as_str();
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(Error::invalid_params(format!("invalid file id: {id:?}")));
    }
    Ok(())
}

/// Contract of a per-OSD object storage layout
pub trait StorageLayout: Send + Sync {
    /// Verify the on-disk format tag of the storage root
    fn check_compatibility(&self) -> Result<()>;

    /// Whether object checksums are computed and stored
    fn checksums_enabled(&self) -> bool;

    /// Rebuild the metadata of a file from on-disk state
    fn load_file_metadata(&self, file_id: &FileId, policy: &StripingPolicy)
    -> Result<FileMetadata>;

    /// Read `length` bytes (`None` = to the end) of an object version
    ///
    /// An absent object is reported as `DoesNotExist`, never as an error.
    fn read_object(
        &self,
        file_id: &FileId,
        md: &FileMetadata,
        object_number: u64,
        version: u64,
        offset: u32,
        length: Option<u32>,
    ) -> Result<ObjectInformation>;

    /// Write `data` at `offset` of an object as `new_version`
    ///
    /// With `cow` the current version stays intact on disk.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Shrink or zero-extend an object to `new_length` as `new_version`
    fn truncate_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        new_length: u64,
        new_version: u64,
        cow: bool,
    ) -> Result<()>;

    /// Create a zero-filled object of exactly `size` bytes
    fn create_padding_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        version: u64,
        size: u64,
    ) -> Result<()>;

    /// Delete one object version
    fn delete_object(
        &self,
        file_id: &FileId,
        md: &mut FileMetadata,
        object_number: u64,
        version: u64,
    ) -> Result<()>;

    /// Delete all objects of a file, and its metadata files if requested
    fn delete_file(&self, file_id: &FileId, delete_metadata: bool) -> Result<()>;

    /// Record the current version of an object in the current-version index
    fn update_current_obj_version(
        &self,
        file_id: &FileId,
        object_number: u64,
        version: u64,
    ) -> Result<()>;

    /// Size the current-version index to end at `new_last_object`, creating it if absent
    fn update_current_version_size(
        &self,
        file_id: &FileId,
        new_last_object: Option<u64>,
    ) -> Result<()>;

    /// Persist the truncate epoch of a file
    fn set_truncate_epoch(&self, file_id: &FileId, epoch: u64) -> Result<()>;

    fn file_exists(&self, file_id: &FileId) -> bool;

    /// Object numbers with at least one stored version
    fn object_set(&self, file_id: &FileId) -> Result<ObjectBitmap>;

    /// Every stored object version of a file
    fn object_versions(&self, file_id: &FileId) -> Result<Vec<ObjectVersionEntry>>;

    /// Next page of stored files
    fn file_list(&self, cursor: &mut FileListCursor, max_entries: usize)
    -> Result<Vec<FileEntry>>;

    /// Recompute the checksum of a stored object version
    fn verify_object(
        &self,
        file_id: &FileId,
        md: &FileMetadata,
        object_number: u64,
        version: u64,
    ) -> Result<()>;
}
