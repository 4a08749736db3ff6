//! Per-file metadata of open files
//!
//! Every storage thread owns one `MetadataCache` holding the `FileMetadata`
//! of the files routed to it. Because a file id is always routed to the
//! same thread, the cache and its records are never shared and need no
//! locking; the process-wide view is the union of all thread caches.

mod cache;
mod file_metadata;

pub use cache::MetadataCache;
pub use file_metadata::FileMetadata;
