//! StripeStore Storage Engine - per-OSD object storage
//!
//! This crate implements the storage engine of an object storage device:
//! - Hashed on-disk directory layout with version-suffixed object files
//! - Copy-on-write policies and snapshot version tables
//! - Per-file in-memory version/checksum bookkeeping
//! - Truncate and padding-object handling for striped files

pub mod bitmap;
pub mod cow;
pub mod hash_layout;
pub mod layout;
pub mod metadata;
pub mod naming;
pub mod version_table;

// Re-exports
pub use bitmap::ObjectBitmap;
pub use cow::{CowMode, CowPolicy};
pub use hash_layout::{HashLayoutConfig, HashStorageLayout};
pub use layout::{
    FileEntry, FileListCursor, ObjectInformation, ObjectStatus, ObjectVersionEntry, StorageLayout,
};
pub use metadata::{FileMetadata, MetadataCache};
pub use naming::ObjectFileName;
pub use version_table::{Version, VersionTable};
