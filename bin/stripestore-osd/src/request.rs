//! Requests accepted by the storage stage
//!
//! Every request carries a completion callback that is invoked exactly
//! once, with the result or with the error that ended processing.

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use stripestore_common::{Error, FileId, Result, StripingPolicy};
use stripestore_storage::{CowPolicy, ObjectBitmap, ObjectInformation};

/// One-shot completion of a request
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Copy-on-write state of one open file handle, shared by its requests
pub type SharedCowPolicy = Arc<Mutex<CowPolicy>>;

/// Callback that forwards the result into a channel
///
/// Convenient for synchronous callers that block on the receiver.
#[must_use]
pub fn completion<T: Send + 'static>() -> (Callback<T>, Receiver<Result<T>>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let callback: Callback<T> = Box::new(move |result| {
        // the caller may have stopped waiting
        let _ = tx.send(result);
    });
    (callback, rx)
}

/// Data of a read object plus the thread's view of the file's extent
#[derive(Clone, Debug)]
pub struct ReadResult {
    pub object: ObjectInformation,
    pub last_local_object: Option<u64>,
    pub global_last_object: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// Version the object was written as
    pub version: u64,
    pub file_size: u64,
    pub last_object: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncateResult {
    /// Whether the truncate changed anything (stale and same-size requests do not)
    pub applied: bool,
    pub file_size: u64,
    pub truncate_epoch: u64,
    pub last_object: Option<u64>,
}

/// Local view of the GMAX state of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GmaxInfo {
    pub truncate_epoch: u64,
    pub last_object: Option<u64>,
    pub file_size: u64,
}

/// State a replica needs to resynchronize a file from this OSD
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaState {
    pub truncate_epoch: u64,
    pub file_size: u64,
    pub max_obj_version: u64,
    /// Current `(object_number, version)` pairs in object order
    pub object_versions: Vec<(u64, u64)>,
}

/// Write of one object range
pub struct WriteRequest {
    pub file_id: FileId,
    pub policy: StripingPolicy,
    pub object_number: u64,
    pub offset: u32,
    pub data: Bytes,
    /// Version forced by the caller, as during replica resynchronization
    pub explicit_version: Option<u64>,
    /// Leave file size and GMAX untouched
    pub size_neutral: bool,
    pub cow: SharedCowPolicy,
    /// Other OSDs holding a replica of the file
    pub gmax_peers: Vec<SocketAddr>,
}

/// Operation submitted to a storage thread
pub enum StorageRequest {
    Read {
        file_id: FileId,
        policy: StripingPolicy,
        object_number: u64,
        offset: u32,
        /// `None` reads to the end of the object
        length: Option<u32>,
        /// Read the version current at this snapshot timestamp
        snapshot: Option<u64>,
        callback: Callback<ReadResult>,
    },
    Write {
        request: WriteRequest,
        callback: Callback<WriteResult>,
    },
    Truncate {
        file_id: FileId,
        policy: StripingPolicy,
        new_size: u64,
        epoch: u64,
        cow: SharedCowPolicy,
        callback: Callback<TruncateResult>,
    },
    CreatePaddingObject {
        file_id: FileId,
        policy: StripingPolicy,
        object_number: u64,
        size: u64,
        callback: Callback<u64>,
    },
    FlushCaches {
        file_id: FileId,
        callback: Callback<()>,
    },
    GetFileSize {
        file_id: FileId,
        policy: StripingPolicy,
        callback: Callback<u64>,
    },
    GetObjectSet {
        file_id: FileId,
        callback: Callback<ObjectBitmap>,
    },
    GetGmax {
        file_id: FileId,
        policy: StripingPolicy,
        callback: Callback<GmaxInfo>,
    },
    /// GMAX hint from another OSD; completes without a callback
    GmaxReceived {
        file_id: FileId,
        truncate_epoch: u64,
        last_object: u64,
    },
    GetMaxObjectNumber {
        file_id: FileId,
        policy: StripingPolicy,
        callback: Callback<Option<u64>>,
    },
    /// Capture a snapshot, returning its timestamp
    CreateFileVersion {
        file_id: FileId,
        policy: StripingPolicy,
        /// Defaults to the current global time
        timestamp: Option<u64>,
        callback: Callback<u64>,
    },
    GetReplicaState {
        file_id: FileId,
        policy: StripingPolicy,
        callback: Callback<ReplicaState>,
    },
    DeleteFile {
        file_id: FileId,
        delete_metadata: bool,
        callback: Callback<()>,
    },
    /// Recompute the checksum of an object version (`None` = current)
    VerifyObject {
        file_id: FileId,
        policy: StripingPolicy,
        object_number: u64,
        version: Option<u64>,
        callback: Callback<()>,
    },
}

impl StorageRequest {
    /// File the request operates on; requests are routed by it
    #[must_use]
    pub fn file_id(&self) -> &FileId {
        match self {
            Self::Write { request, .. } => &request.file_id,
            Self::Read { file_id, .. }
            | Self::Truncate { file_id, .. }
            | Self::CreatePaddingObject { file_id, .. }
            | Self::FlushCaches { file_id, .. }
            | Self::GetFileSize { file_id, .. }
            | Self::GetObjectSet { file_id, .. }
            | Self::GetGmax { file_id, .. }
            | Self::GmaxReceived { file_id, .. }
            | Self::GetMaxObjectNumber { file_id, .. }
            | Self::CreateFileVersion { file_id, .. }
            | Self::GetReplicaState { file_id, .. }
            | Self::DeleteFile { file_id, .. }
            | Self::VerifyObject { file_id, .. } => file_id,
        }
    }

    /// Request name for logs and statistics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Truncate { .. } => "truncate",
            Self::CreatePaddingObject { .. } => "create_padding_object",
            Self::FlushCaches { .. } => "flush_caches",
            Self::GetFileSize { .. } => "get_file_size",
            Self::GetObjectSet { .. } => "get_object_set",
            Self::GetGmax { .. } => "get_gmax",
            Self::GmaxReceived { .. } => "gmax_received",
            Self::GetMaxObjectNumber { .. } => "get_max_object_number",
            Self::CreateFileVersion { .. } => "create_file_version",
            Self::GetReplicaState { .. } => "get_replica_state",
            Self::DeleteFile { .. } => "delete_file",
            Self::VerifyObject { .. } => "verify_object",
        }
    }

    /// Complete the request with an error without processing it
    pub fn fail(self, error: Error) {
        match self {
            Self::Read { callback, .. } => callback(Err(error)),
            Self::Write { callback, .. } => callback(Err(error)),
            Self::Truncate { callback, .. } => callback(Err(error)),
            Self::CreatePaddingObject { callback, .. }
            | Self::GetFileSize { callback, .. }
            | Self::CreateFileVersion { callback, .. } => callback(Err(error)),
            Self::FlushCaches { callback, .. }
            | Self::DeleteFile { callback, .. }
            | Self::VerifyObject { callback, .. } => callback(Err(error)),
            Self::GetObjectSet { callback, .. } => callback(Err(error)),
            Self::GetGmax { callback, .. } => callback(Err(error)),
            Self::GmaxReceived { .. } => {}
            Self::GetMaxObjectNumber { callback, .. } => callback(Err(error)),
            Self::GetReplicaState { callback, .. } => callback(Err(error)),
        }
    }
}
