//! Storage stage
//!
//! A fixed pool of storage threads, each fed by its own bounded queue.
//! Requests are routed by the placement hash of their file id, so every
//! request for a file is processed by the same thread for as long as the
//! stage runs.

use crate::gmax::GmaxSender;
use crate::request::StorageRequest;
use crate::thread::{StorageThread, ThreadStats, ThreadStatsSnapshot};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use stripestore_common::config::StageConfig;
use stripestore_common::{Error, FileId, Result};
use stripestore_storage::StorageLayout;
use tracing::{debug, info, warn};

/// Pool of storage threads with per-file request routing
pub struct StorageStage {
    queues: RwLock<Vec<Sender<StorageRequest>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Vec<Arc<ThreadStats>>,
}

impl StorageStage {
    /// Spawn `config.threads` storage threads over a shared layout
    pub fn start(
        config: &StageConfig,
        layout: Arc<dyn StorageLayout>,
        gmax: Arc<dyn GmaxSender>,
        sync_writes: bool,
    ) -> Result<Self> {
        if config.threads == 0 || config.queue_depth == 0 {
            return Err(Error::Configuration(
                "storage stage needs at least one thread and a non-empty queue".into(),
            ));
        }

        let mut queues = Vec::with_capacity(config.threads);
        let mut handles = Vec::with_capacity(config.threads);
        let mut stats = Vec::with_capacity(config.threads);

        for id in 0..config.threads {
            let (tx, rx) = crossbeam_channel::bounded(config.queue_depth);
            let worker = StorageThread::new(id, Arc::clone(&layout), Arc::clone(&gmax), sync_writes);
            stats.push(worker.stats());
            let handle = thread::Builder::new()
                .name(format!("storage-{id}"))
                .spawn(move || worker.run(&rx))?;
            queues.push(tx);
            handles.push(handle);
        }

        info!(
            "storage stage started with {} threads (queue depth {})",
            config.threads, config.queue_depth
        );
        Ok(Self {
            queues: RwLock::new(queues),
            handles: Mutex::new(handles),
            stats,
        })
    }

    /// Number of storage threads
    #[must_use]
    pub fn threads(&self) -> usize {
        self.stats.len()
    }

    /// Index of the storage thread that owns `file_id`
    #[must_use]
    pub fn route(&self, file_id: &FileId) -> usize {
        (file_id.placement_hash() % self.stats.len() as u64) as usize
    }

    /// Submit a request to the thread owning its file
    ///
    /// Blocks while that thread's queue is full. After shutdown the
    /// request completes with `Error::ShuttingDown`.
    pub fn enqueue(&self, request: StorageRequest) {
        let index = self.route(request.file_id());
        let queues = self.queues.read();
        let Some(queue) = queues.get(index) else {
            drop(queues);
            request.fail(Error::ShuttingDown);
            return;
        };

        let request = match queue.try_send(request) {
            Ok(()) => return,
            Err(TrySendError::Full(request)) => {
                debug!("storage thread {} queue full, waiting", index);
                request
            }
            Err(TrySendError::Disconnected(request)) => {
                drop(queues);
                request.fail(Error::ShuttingDown);
                return;
            }
        };
        // a blocked send holds the read lock, shutdown waits for it
        if let Err(e) = queue.send(request) {
            drop(queues);
            e.into_inner().fail(Error::ShuttingDown);
        }
    }

    /// Counters of every storage thread, in thread order
    #[must_use]
    pub fn stats(&self) -> Vec<ThreadStatsSnapshot> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    /// Stop accepting requests and wait for queued requests to finish
    pub fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.write());
        if queues.is_empty() {
            return;
        }
        drop(queues);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("storage thread panicked during shutdown");
            }
        }
        info!("storage stage stopped");
    }
}

impl Drop for StorageStage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmax::NoopGmaxSender;
    use crate::request::completion;
    use stripestore_common::StripingPolicy;
    use stripestore_storage::{HashLayoutConfig, HashStorageLayout};
    use tempfile::tempdir;

    fn stage(threads: usize) -> (tempfile::TempDir, StorageStage) {
        let dir = tempdir().unwrap();
        let layout = HashStorageLayout::open(HashLayoutConfig::new(dir.path())).unwrap();
        let config = StageConfig {
            threads,
            queue_depth: 4,
        };
        let stage =
            StorageStage::start(&config, Arc::new(layout), Arc::new(NoopGmaxSender), false)
                .unwrap();
        (dir, stage)
    }

    #[test]
    fn test_routing_is_stable() {
        let (_dir, stage) = stage(4);
        let id = FileId::new("vol:route");
        let index = stage.route(&id);
        assert!(index < 4);
        for _ in 0..10 {
            assert_eq!(stage.route(&id), index);
        }
    }

    #[test]
    fn test_requests_after_shutdown_fail() {
        let (_dir, stage) = stage(2);
        stage.shutdown();

        let (callback, rx) = completion();
        stage.enqueue(StorageRequest::GetFileSize {
            file_id: FileId::new("vol:late"),
            policy: StripingPolicy::single(1024),
            callback,
        });
        assert!(matches!(rx.recv().unwrap(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_stats_count_requests() {
        let (_dir, stage) = stage(2);
        for i in 0..6 {
            let (callback, rx) = completion();
            stage.enqueue(StorageRequest::GetFileSize {
                file_id: FileId::new(format!("vol:{i}")),
                policy: StripingPolicy::single(1024),
                callback,
            });
            assert_eq!(rx.recv().unwrap().unwrap(), 0);
        }
        let total: u64 = stage.stats().iter().map(|s| s.requests).sum();
        assert_eq!(total, 6);
    }
}
