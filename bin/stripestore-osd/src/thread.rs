//! Storage thread
//!
//! A storage thread owns the metadata of every file routed to it and
//! processes one request at a time, start to finish. No other thread ever
//! touches those `FileMetadata` records, so they are mutated without locks.
//!
//! In-memory version and size state is advanced only after the layout call
//! that makes it true on disk has returned successfully.

use crate::gmax::{GmaxHint, GmaxSender};
use crate::request::{
    Callback, GmaxInfo, ReadResult, ReplicaState, SharedCowPolicy, StorageRequest,
    TruncateResult, WriteRequest, WriteResult,
};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stripestore_common::{Error, FileId, Result, StripingPolicy, global_time_millis};
use stripestore_storage::layout::validate_file_id;
use stripestore_storage::{
    CowPolicy, FileMetadata, MetadataCache, ObjectInformation, ObjectStatus, StorageLayout,
};
use tracing::{debug, error, info, trace};

/// Request counters of one storage thread
#[derive(Debug, Default)]
pub struct ThreadStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub gmax_sent: AtomicU64,
    pub gmax_received: AtomicU64,
}

impl ThreadStats {
    #[must_use]
    pub fn snapshot(&self) -> ThreadStatsSnapshot {
        ThreadStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            gmax_sent: self.gmax_sent.load(Ordering::Relaxed),
            gmax_received: self.gmax_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `ThreadStats`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadStatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub gmax_sent: u64,
    pub gmax_received: u64,
}

/// Single-threaded storage request processor
pub struct StorageThread {
    id: usize,
    layout: Arc<dyn StorageLayout>,
    cache: MetadataCache,
    gmax: Arc<dyn GmaxSender>,
    stats: Arc<ThreadStats>,
    sync_writes: bool,
}

impl StorageThread {
    #[must_use]
    pub fn new(
        id: usize,
        layout: Arc<dyn StorageLayout>,
        gmax: Arc<dyn GmaxSender>,
        sync_writes: bool,
    ) -> Self {
        Self {
            id,
            layout,
            cache: MetadataCache::new(),
            gmax,
            stats: Arc::new(ThreadStats::default()),
            sync_writes,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ThreadStats> {
        Arc::clone(&self.stats)
    }

    /// Metadata of the files currently open on this thread
    #[must_use]
    pub const fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Process requests until every sender of `queue` is gone
    pub fn run(mut self, queue: &Receiver<StorageRequest>) {
        info!("storage thread {} started", self.id);
        for request in queue {
            self.process(request);
        }
        info!(
            "storage thread {} stopped with {} open files",
            self.id,
            self.cache.len()
        );
    }

    /// Process one request and invoke its callback
    pub fn process(&mut self, request: StorageRequest) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let name = request.name();
        trace!("storage thread {}: {} {}", self.id, name, request.file_id());

        match request {
            StorageRequest::Read {
                file_id,
                policy,
                object_number,
                offset,
                length,
                snapshot,
                callback,
            } => {
                let result =
                    self.read(&file_id, &policy, object_number, offset, length, snapshot);
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::Write { request, callback } => {
                let file_id = request.file_id.clone();
                let result = self.write(request);
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::Truncate {
                file_id,
                policy,
                new_size,
                epoch,
                cow,
                callback,
            } => {
                let result = self.truncate(&file_id, &policy, new_size, epoch, &cow);
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::CreatePaddingObject {
                file_id,
                policy,
                object_number,
                size,
                callback,
            } => {
                let result = self.create_padding_object(&file_id, &policy, object_number, size);
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::FlushCaches { file_id, callback } => {
                if self.cache.remove(&file_id).is_some() {
                    debug!("{}: flushed from storage thread {}", file_id, self.id);
                }
                self.complete(name, &file_id, callback, Ok(()));
            }
            StorageRequest::GetFileSize {
                file_id,
                policy,
                callback,
            } => {
                let result = self.metadata(&file_id, &policy).map(|md| md.file_size());
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::GetObjectSet { file_id, callback } => {
                let result = validate_file_id(&file_id).and_then(|()| self.layout.object_set(&file_id));
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::GetGmax {
                file_id,
                policy,
                callback,
            } => {
                let result = self.metadata(&file_id, &policy).map(|md| GmaxInfo {
                    truncate_epoch: md.truncate_epoch(),
                    last_object: md.known_last_object(),
                    file_size: md.file_size(),
                });
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::GmaxReceived {
                file_id,
                truncate_epoch,
                last_object,
            } => self.gmax_received(&file_id, truncate_epoch, last_object),
            StorageRequest::GetMaxObjectNumber {
                file_id,
                policy,
                callback,
            } => {
                let result = self
                    .metadata(&file_id, &policy)
                    .map(|md| md.known_last_object());
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::CreateFileVersion {
                file_id,
                policy,
                timestamp,
                callback,
            } => {
                let result = self.create_file_version(&file_id, &policy, timestamp);
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::GetReplicaState {
                file_id,
                policy,
                callback,
            } => {
                let result = self.metadata(&file_id, &policy).map(|md| {
                    let mut object_versions: Vec<(u64, u64)> = md.latest_versions().collect();
                    object_versions.sort_unstable();
                    ReplicaState {
                        truncate_epoch: md.truncate_epoch(),
                        file_size: md.file_size(),
                        max_obj_version: md.max_object_version(),
                        object_versions,
                    }
                });
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::DeleteFile {
                file_id,
                delete_metadata,
                callback,
            } => {
                let result = validate_file_id(&file_id).and_then(|()| {
                    self.cache.remove(&file_id);
                    self.layout.delete_file(&file_id, delete_metadata)
                });
                self.complete(name, &file_id, callback, result);
            }
            StorageRequest::VerifyObject {
                file_id,
                policy,
                object_number,
                version,
                callback,
            } => {
                let result = self.verify_object(&file_id, &policy, object_number, version);
                self.complete(name, &file_id, callback, result);
            }
        }
    }

    fn complete<T>(&self, name: &str, file_id: &FileId, callback: Callback<T>, result: Result<T>) {
        if let Err(e) = &result {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            if e.is_not_found() || matches!(e, Error::InvalidParams(_)) {
                debug!("{} {} failed: {}", name, file_id, e);
            } else {
                error!("{} {} failed: {}", name, file_id, e);
            }
        }
        callback(result);
    }

    /// Cached metadata of a file, loaded from the layout on first access
    fn metadata(&mut self, file_id: &FileId, policy: &StripingPolicy) -> Result<&mut FileMetadata> {
        validate_file_id(file_id)?;
        policy.validate()?;
        let layout = &self.layout;
        let md = self
            .cache
            .get_or_load(file_id, || layout.load_file_metadata(file_id, policy))?;
        if md.striping_policy() != policy {
            return Err(Error::invalid_params(format!(
                "{file_id}: striping policy {policy:?} differs from open policy {:?}",
                md.striping_policy()
            )));
        }
        Ok(md)
    }

    fn read(
        &mut self,
        file_id: &FileId,
        policy: &StripingPolicy,
        object_number: u64,
        offset: u32,
        length: Option<u32>,
        snapshot: Option<u64>,
    ) -> Result<ReadResult> {
        let layout = Arc::clone(&self.layout);
        let md = self.metadata(file_id, policy)?;
        let stripe_size = md.stripe_size();

        // version to read and the file extent it belongs to
        let (version, last_object, file_size) = match snapshot {
            Some(timestamp) => {
                let snapshot = md.version_table().latest_version_before(timestamp);
                (
                    snapshot.object_version(object_number),
                    policy.last_object_for_size(snapshot.file_size),
                    snapshot.file_size,
                )
            }
            None => (
                md.latest_version(object_number),
                md.known_last_object(),
                md.file_size(),
            ),
        };

        let mut object = layout.read_object(file_id, md, object_number, version, offset, length)?;
        object = match (object.status, last_object) {
            (ObjectStatus::Exists, Some(last)) if object_number < last => {
                object.padded(offset, length)
            }
            (ObjectStatus::DoesNotExist, Some(last)) if object_number < last => {
                let len = length.unwrap_or_else(|| stripe_size.saturating_sub(offset));
                ObjectInformation::padding(stripe_size, len as usize)
            }
            (ObjectStatus::DoesNotExist, Some(last)) if object_number == last => {
                let start = policy.object_start_offset(object_number) + u64::from(offset);
                let available = file_size.saturating_sub(start);
                let wanted = u64::from(length.unwrap_or_else(|| stripe_size.saturating_sub(offset)));
                match available.min(wanted) {
                    0 => object,
                    len => ObjectInformation::padding(stripe_size, len as usize),
                }
            }
            _ => object,
        };

        self.stats
            .bytes_read
            .fetch_add(object.data.len() as u64, Ordering::Relaxed);
        let md = self.metadata(file_id, policy)?;
        Ok(ReadResult {
            object,
            last_local_object: md.last_object_number(),
            global_last_object: md.global_last_object_number(),
        })
    }

    fn write(&mut self, request: WriteRequest) -> Result<WriteResult> {
        let WriteRequest {
            file_id,
            policy,
            object_number,
            offset,
            data,
            explicit_version,
            size_neutral,
            cow,
            gmax_peers,
        } = request;

        if u64::from(offset) + data.len() as u64 > policy.stripe_size_u64() {
            return Err(Error::invalid_params(format!(
                "write of {} bytes at offset {} exceeds stripe size {}",
                data.len(),
                offset,
                policy.stripe_size
            )));
        }
        if !policy.is_local_object(object_number) {
            return Err(Error::invalid_params(format!(
                "object {object_number} is not stored at stripe position {}",
                policy.relative_position
            )));
        }
        policy.check_object_number(object_number)?;

        let layout = Arc::clone(&self.layout);
        let checksums = layout.checksums_enabled();
        let sync = self.sync_writes;
        let md = self.metadata(&file_id, &policy)?;

        let mut cow = cow.lock();
        if !cow.is_initialized() {
            cow.init_cow_flags(md.object_count());
        }
        let handle_cow = cow.is_cow(object_number);
        // snapshot versions are never overwritten in place
        let is_cow = handle_cow || md.is_snapshot_referenced(object_number);
        let version = explicit_version
            .unwrap_or_else(|| next_version(md, object_number, is_cow || checksums));

        layout.write_object(
            &file_id,
            md,
            &data,
            object_number,
            offset,
            version,
            sync,
            is_cow,
        )?;
        if handle_cow {
            cow.object_changed(object_number);
        }
        let cow_enabled = cow.cow_enabled();
        drop(cow);

        md.update_object_version(object_number, version);
        if md.last_object_number().is_none_or(|last| object_number > last) {
            md.set_last_object_number(Some(object_number));
        }

        let mut hint = None;
        if !size_neutral && md.known_last_object().is_none_or(|last| object_number >= last) {
            let end = policy.file_size_after(object_number, u64::from(offset) + data.len() as u64);
            md.set_file_size(md.file_size().max(end));

            if md
                .global_last_object_number()
                .is_none_or(|global| object_number > global)
            {
                md.set_global_last_object_number(Some(object_number));
                hint = Some(GmaxHint {
                    file_id: file_id.clone(),
                    truncate_epoch: md.truncate_epoch(),
                    last_object: object_number,
                });
            }
        }

        record_current_version(layout.as_ref(), &file_id, md, object_number, cow_enabled)?;

        let result = WriteResult {
            version,
            file_size: md.file_size(),
            last_object: md.last_object_number(),
        };

        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(hint) = hint
            && !gmax_peers.is_empty()
        {
            self.gmax.send(&hint, &gmax_peers);
            self.stats.gmax_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    fn truncate(
        &mut self,
        file_id: &FileId,
        policy: &StripingPolicy,
        new_size: u64,
        epoch: u64,
        cow: &SharedCowPolicy,
    ) -> Result<TruncateResult> {
        let layout = Arc::clone(&self.layout);
        let checksums = layout.checksums_enabled();
        let md = self.metadata(file_id, policy)?;

        let unchanged = |md: &FileMetadata| TruncateResult {
            applied: false,
            file_size: md.file_size(),
            truncate_epoch: md.truncate_epoch(),
            last_object: md.last_object_number(),
        };
        if epoch <= md.truncate_epoch() {
            let stale = Error::StaleEpoch {
                received: epoch,
                current: md.truncate_epoch(),
            };
            debug!("{}: ignoring truncate: {}", file_id, stale);
            return Ok(unchanged(&*md));
        }
        if new_size == md.file_size() {
            debug!("{}: truncate to current size {} is a no-op", file_id, new_size);
            return Ok(unchanged(&*md));
        }

        let new_last = policy.last_object_for_size(new_size);
        if let Some(last) = new_last {
            policy.check_object_number(last)?;
        }

        let mut cow = cow.lock();
        if !cow.is_initialized() {
            cow.init_cow_flags(md.object_count());
        }
        let cow_enabled = cow.cow_enabled();
        let mut resizer = ObjectResizer {
            layout: layout.as_ref(),
            file_id,
            cow: &mut *cow,
            checksums,
        };

        let retained = if new_size < md.file_size() {
            resizer.shrink(md, new_size, new_last)?
        } else {
            resizer.extend(md, new_size, new_last)?;
            false
        };
        drop(cow);

        let last_local = new_last.and_then(|last| policy.last_local_object(last));
        // retained snapshot objects must stay out of the current view on reload
        if (cow_enabled || retained) && !md.tracks_current_versions() {
            start_version_index(layout.as_ref(), file_id, md)?;
        }
        if md.tracks_current_versions() {
            layout.update_current_version_size(file_id, last_local)?;
        }
        layout.set_truncate_epoch(file_id, epoch)?;

        md.set_truncate_epoch(epoch);
        md.set_file_size(new_size);
        md.set_last_object_number(last_local);
        md.set_global_last_object_number(new_last);

        info!(
            "{}: truncated to {} bytes (epoch {}, last object {:?})",
            file_id, new_size, epoch, new_last
        );
        Ok(TruncateResult {
            applied: true,
            file_size: new_size,
            truncate_epoch: epoch,
            last_object: last_local,
        })
    }

    fn create_padding_object(
        &mut self,
        file_id: &FileId,
        policy: &StripingPolicy,
        object_number: u64,
        size: u64,
    ) -> Result<u64> {
        if size > policy.stripe_size_u64() {
            return Err(Error::invalid_params(format!(
                "padding object of {size} bytes exceeds stripe size {}",
                policy.stripe_size
            )));
        }
        policy.check_object_number(object_number)?;
        let layout = Arc::clone(&self.layout);
        let md = self.metadata(file_id, policy)?;
        let new_version = layout.checksums_enabled() || md.is_snapshot_referenced(object_number);
        let version = next_version(md, object_number, new_version);

        layout.create_padding_object(file_id, md, object_number, version, size)?;
        md.update_object_version(object_number, version);
        if md.last_object_number().is_none_or(|last| object_number > last) {
            md.set_last_object_number(Some(object_number));
            let end = policy.file_size_after(object_number, size);
            md.set_file_size(md.file_size().max(end));
        }
        record_current_version(layout.as_ref(), file_id, md, object_number, false)?;
        Ok(version)
    }

    fn gmax_received(&mut self, file_id: &FileId, truncate_epoch: u64, last_object: u64) {
        self.stats.gmax_received.fetch_add(1, Ordering::Relaxed);
        // files that are not open load their extent from disk when opened
        let Some(md) = self.cache.get_mut(file_id) else {
            debug!("{}: GMAX hint for file that is not open", file_id);
            return;
        };
        if md.apply_gmax(truncate_epoch, last_object) {
            debug!(
                "{}: global last object is now {} (epoch {})",
                file_id, last_object, truncate_epoch
            );
        } else {
            debug!(
                "{}: ignoring stale GMAX hint (epoch {}, last object {})",
                file_id, truncate_epoch, last_object
            );
        }
    }

    fn create_file_version(
        &mut self,
        file_id: &FileId,
        policy: &StripingPolicy,
        timestamp: Option<u64>,
    ) -> Result<u64> {
        let md = self.metadata(file_id, policy)?;
        let timestamp = timestamp.unwrap_or_else(global_time_millis);
        let versions = md.dense_object_versions();
        let file_size = md.file_size();

        let table = md.version_table_mut();
        table.add_version(timestamp, versions, file_size);
        if let Err(e) = table.save() {
            table.remove_version(timestamp);
            return Err(e);
        }
        info!("{}: captured file version at {}", file_id, timestamp);
        Ok(timestamp)
    }

    fn verify_object(
        &mut self,
        file_id: &FileId,
        policy: &StripingPolicy,
        object_number: u64,
        version: Option<u64>,
    ) -> Result<()> {
        let layout = Arc::clone(&self.layout);
        let md = self.metadata(file_id, policy)?;
        let version = version.unwrap_or_else(|| md.latest_version(object_number));
        if version == 0 {
            return Err(Error::not_found(format!("{file_id}: object {object_number}")));
        }
        layout.verify_object(file_id, md, object_number, version)
    }
}

/// Version for the next write of an object
///
/// A fresh version is needed whenever the old file must survive (COW) or
/// the checksum changes the file name. The current one is reused only while
/// it is the largest; a larger version on disk is held by a snapshot.
fn next_version(md: &FileMetadata, object_number: u64, new_version: bool) -> u64 {
    let largest = md.largest_version(object_number);
    if new_version || md.latest_version(object_number) != largest {
        largest + 1
    } else {
        largest.max(1)
    }
}

/// Write the whole current view into a fresh current-version index
fn start_version_index(
    layout: &dyn StorageLayout,
    file_id: &FileId,
    md: &mut FileMetadata,
) -> Result<()> {
    let versions = md.dense_object_versions();
    for (object_number, &version) in versions.iter().enumerate() {
        layout.update_current_obj_version(file_id, object_number as u64, version)?;
    }
    let last = versions.len().checked_sub(1).map(|n| n as u64);
    layout.update_current_version_size(file_id, last)?;
    md.set_tracks_current_versions(true);
    debug!("{}: started current-version index", file_id);
    Ok(())
}

/// Mirror a current version change into the current-version index
///
/// The index is started by the first copy-on-write handle and then kept up
/// to date by every handle.
fn record_current_version(
    layout: &dyn StorageLayout,
    file_id: &FileId,
    md: &mut FileMetadata,
    object_number: u64,
    cow_enabled: bool,
) -> Result<()> {
    if md.tracks_current_versions() {
        layout.update_current_obj_version(file_id, object_number, md.latest_version(object_number))
    } else if cow_enabled {
        start_version_index(layout, file_id, md)
    } else {
        Ok(())
    }
}

/// Physical part of a truncate, one object at a time
struct ObjectResizer<'a> {
    layout: &'a dyn StorageLayout,
    file_id: &'a FileId,
    cow: &'a mut CowPolicy,
    checksums: bool,
}

impl ObjectResizer<'_> {
    /// Give a local object exactly `length` bytes, creating it if absent
    fn resize(&mut self, md: &mut FileMetadata, object_number: u64, length: u64) -> Result<()> {
        let handle_cow = self.cow.is_cow(object_number);
        let is_cow = handle_cow || md.is_snapshot_referenced(object_number);
        let version = next_version(md, object_number, is_cow || self.checksums);

        if md.latest_version(object_number) == 0 {
            self.layout
                .create_padding_object(self.file_id, md, object_number, version, length)?;
        } else {
            self.layout
                .truncate_object(self.file_id, md, object_number, length, version, is_cow)?;
            if handle_cow {
                self.cow.object_changed(object_number);
            }
        }
        md.update_object_version(object_number, version);
        record_current_version(
            self.layout,
            self.file_id,
            md,
            object_number,
            self.cow.cow_enabled(),
        )
    }

    /// Delete local objects past the new end and cut the new last object
    ///
    /// Returns whether any removed object was kept on disk for a snapshot.
    fn shrink(
        &mut self,
        md: &mut FileMetadata,
        new_size: u64,
        new_last: Option<u64>,
    ) -> Result<bool> {
        let policy = *md.striping_policy();
        let first_removed = new_last.map_or(0, |last| last + 1);
        let end = md
            .latest_versions()
            .map(|(object_number, _)| object_number + 1)
            .max()
            .unwrap_or(0);

        // version numbers of retained snapshot files must not be reused
        let keep_largest = self.cow.cow_enabled() || !md.version_table().is_empty();
        let mut retained = false;
        for object_number in policy.local_objects_in(first_removed, end) {
            let version = md.latest_version(object_number);
            if version == 0 {
                continue;
            }
            let referenced = md.is_snapshot_referenced(object_number);
            if referenced {
                debug!(
                    "{}: keeping object {} version {} referenced by a snapshot",
                    self.file_id, object_number, version
                );
                retained = true;
            } else {
                self.layout.delete_object(self.file_id, md, object_number, version)?;
            }
            md.remove_object(object_number, keep_largest);
        }

        if let Some(last) = new_last
            && policy.is_local_object(last)
        {
            let length = new_size - policy.object_start_offset(last);
            self.resize(md, last, length)?;
        }
        Ok(retained)
    }

    /// Pad the old last object and create every local object up to the new end
    fn extend(&mut self, md: &mut FileMetadata, new_size: u64, new_last: Option<u64>) -> Result<()> {
        let policy = *md.striping_policy();
        let Some(new_last) = new_last else {
            return Ok(());
        };
        let stripe_size = policy.stripe_size_u64();
        let old_last = md.last_object_number();

        if let Some(old_last) = old_last
            && old_last < new_last
            && policy.is_local_object(old_last)
        {
            self.resize(md, old_last, stripe_size)?;
        }

        let first_new = old_last.map_or(0, |last| last + 1);
        for object_number in policy.local_objects_in(first_new, new_last) {
            self.resize(md, object_number, stripe_size)?;
        }

        if policy.is_local_object(new_last) {
            let length = new_size - policy.object_start_offset(new_last);
            self.resize(md, new_last, length)?;
        }
        Ok(())
    }
}
