//! End-to-end tests of the storage stage over a real hashed layout

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stripestore_common::config::StageConfig;
use stripestore_common::{FileId, Result, StripingPolicy};
use stripestore_osd::{
    GmaxListener, NoopGmaxSender, ReadResult, SharedCowPolicy, StorageRequest, StorageStage,
    TruncateResult, UdpGmaxSender, WriteRequest, WriteResult, completion,
};
use stripestore_storage::{
    CowMode, CowPolicy, HashLayoutConfig, HashStorageLayout, ObjectStatus, StorageLayout,
};
use tempfile::{TempDir, tempdir};

const STRIPE: u32 = 1024;

struct Osd {
    stage: Arc<StorageStage>,
    layout: Arc<HashStorageLayout>,
    _dir: TempDir,
}

fn osd_with(gmax: Arc<dyn stripestore_osd::GmaxSender>) -> Osd {
    let dir = tempdir().unwrap();
    let layout = Arc::new(HashStorageLayout::open(HashLayoutConfig::new(dir.path())).unwrap());
    let config = StageConfig {
        threads: 3,
        queue_depth: 16,
    };
    let stage = StorageStage::start(&config, layout.clone(), gmax, false).unwrap();
    Osd {
        stage: Arc::new(stage),
        layout,
        _dir: dir,
    }
}

fn osd() -> Osd {
    osd_with(Arc::new(NoopGmaxSender))
}

fn policy() -> StripingPolicy {
    StripingPolicy::single(STRIPE)
}

fn handle(mode: CowMode) -> SharedCowPolicy {
    Arc::new(Mutex::new(CowPolicy::new(mode)))
}

fn write(
    stage: &StorageStage,
    id: &FileId,
    object_number: u64,
    data: &[u8],
    cow: &SharedCowPolicy,
    gmax_peers: Vec<SocketAddr>,
) -> Result<WriteResult> {
    let (callback, rx) = completion();
    stage.enqueue(StorageRequest::Write {
        request: WriteRequest {
            file_id: id.clone(),
            policy: policy(),
            object_number,
            offset: 0,
            data: Bytes::copy_from_slice(data),
            explicit_version: None,
            size_neutral: false,
            cow: Arc::clone(cow),
            gmax_peers,
        },
        callback,
    });
    rx.recv().unwrap()
}

fn read(stage: &StorageStage, id: &FileId, object_number: u64) -> ReadResult {
    let (callback, rx) = completion();
    stage.enqueue(StorageRequest::Read {
        file_id: id.clone(),
        policy: policy(),
        object_number,
        offset: 0,
        length: None,
        snapshot: None,
        callback,
    });
    rx.recv().unwrap().unwrap()
}

fn truncate(stage: &StorageStage, id: &FileId, new_size: u64, epoch: u64) -> TruncateResult {
    let (callback, rx) = completion();
    stage.enqueue(StorageRequest::Truncate {
        file_id: id.clone(),
        policy: policy(),
        new_size,
        epoch,
        cow: handle(CowMode::NoCow),
        callback,
    });
    rx.recv().unwrap().unwrap()
}

fn global_last_object(stage: &StorageStage, id: &FileId) -> Option<u64> {
    let (callback, rx) = completion();
    stage.enqueue(StorageRequest::GetGmax {
        file_id: id.clone(),
        policy: policy(),
        callback,
    });
    rx.recv().unwrap().unwrap().last_object
}

#[test]
fn write_read_truncate_scenario() {
    let osd = osd();
    let id = FileId::new("vol:scenario");
    let cow = handle(CowMode::NoCow);

    let payload: Vec<u8> = (0..STRIPE).map(|i| (i % 256) as u8).collect();
    let written = write(&osd.stage, &id, 0, &payload, &cow, Vec::new()).unwrap();
    assert_eq!(written.version, 1);
    assert_eq!(written.file_size, u64::from(STRIPE));

    let object = read(&osd.stage, &id, 0).object;
    assert_eq!(object.status, ObjectStatus::Exists);
    assert_eq!(&object.data[..], &payload[..]);

    let result = truncate(&osd.stage, &id, 512, 1);
    assert!(result.applied);
    let object = read(&osd.stage, &id, 0).object;
    assert_eq!(&object.data[..], &payload[..512]);
    assert!(object.version >= 1);
    let tepoch = fs::read(osd.layout.file_dir(&id).join(".tepoch")).unwrap();
    assert_eq!(tepoch, 1i64.to_be_bytes());

    let result = truncate(&osd.stage, &id, 0, 2);
    assert!(result.applied);
    assert_eq!(result.last_object, None);
    assert_eq!(osd.layout.object_set(&id).unwrap().count_ones(), 0);

    // a stale epoch changes nothing
    let result = truncate(&osd.stage, &id, 4096, 2);
    assert!(!result.applied);
    assert_eq!(result.file_size, 0);
}

#[test]
fn gmax_hint_raises_global_last_object() {
    let osd = osd();
    let id = FileId::new("vol:gmax");
    let cow = handle(CowMode::NoCow);
    for object_number in 0..=3 {
        write(&osd.stage, &id, object_number, &[7u8; STRIPE as usize], &cow, Vec::new()).unwrap();
    }

    osd.stage.enqueue(StorageRequest::GmaxReceived {
        file_id: id.clone(),
        truncate_epoch: 0,
        last_object: 5,
    });
    assert_eq!(global_last_object(&osd.stage, &id), Some(5));
}

#[test]
fn gmax_hint_travels_between_osds() {
    let receiver = osd();
    let mut listener =
        GmaxListener::start("127.0.0.1:0".parse().unwrap(), Arc::clone(&receiver.stage)).unwrap();
    let sender =
        osd_with(Arc::new(UdpGmaxSender::bind("127.0.0.1:0".parse().unwrap()).unwrap()));

    let id = FileId::new("vol:replicated");
    let cow = handle(CowMode::NoCow);
    // the receiving replica has the file open
    write(&receiver.stage, &id, 0, b"replica", &cow, Vec::new()).unwrap();

    let peers = vec![listener.local_addr()];
    write(&sender.stage, &id, 0, b"primary", &cow, peers.clone()).unwrap();
    write(&sender.stage, &id, 6, b"extends", &cow, peers).unwrap();
    assert_eq!(sender.stage.stats().iter().map(|s| s.gmax_sent).sum::<u64>(), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while global_last_object(&receiver.stage, &id) != Some(6) {
        assert!(Instant::now() < deadline, "GMAX hint was not applied");
        thread::sleep(Duration::from_millis(20));
    }
    listener.stop();
}

#[test]
fn files_are_processed_concurrently() {
    let osd = osd();
    let workers: Vec<_> = (0..6)
        .map(|i| {
            let stage = Arc::clone(&osd.stage);
            thread::spawn(move || {
                let id = FileId::new(format!("vol:parallel-{i}"));
                let cow = handle(CowMode::NoCow);
                for object_number in 0..8u64 {
                    let data = vec![i as u8; STRIPE as usize];
                    write(&stage, &id, object_number, &data, &cow, Vec::new()).unwrap();
                }
                id
            })
        })
        .collect();

    for worker in workers {
        let id = worker.join().unwrap();
        let (callback, rx) = completion();
        osd.stage.enqueue(StorageRequest::GetFileSize {
            file_id: id.clone(),
            policy: policy(),
            callback,
        });
        assert_eq!(rx.recv().unwrap().unwrap(), 8 * u64::from(STRIPE));
        assert_eq!(osd.layout.object_set(&id).unwrap().count_ones(), 8);
    }
}

#[test]
fn snapshot_survives_overwrite_and_shrink() {
    let osd = osd();
    let id = FileId::new("vol:snap");
    let cow = handle(CowMode::AlwaysCow);
    write(&osd.stage, &id, 0, &[1u8; STRIPE as usize], &cow, Vec::new()).unwrap();
    write(&osd.stage, &id, 1, &[2u8; 100], &cow, Vec::new()).unwrap();

    let (callback, rx) = completion();
    osd.stage.enqueue(StorageRequest::CreateFileVersion {
        file_id: id.clone(),
        policy: policy(),
        timestamp: Some(5_000),
        callback,
    });
    assert_eq!(rx.recv().unwrap().unwrap(), 5_000);

    write(&osd.stage, &id, 0, &[9u8; STRIPE as usize], &cow, Vec::new()).unwrap();
    let (callback, rx) = completion();
    osd.stage.enqueue(StorageRequest::Truncate {
        file_id: id.clone(),
        policy: policy(),
        new_size: 10,
        epoch: 1,
        cow: Arc::clone(&cow),
        callback,
    });
    assert!(rx.recv().unwrap().unwrap().applied);

    let (callback, rx) = completion();
    osd.stage.enqueue(StorageRequest::Read {
        file_id: id.clone(),
        policy: policy(),
        object_number: 1,
        offset: 0,
        length: None,
        snapshot: Some(5_001),
        callback,
    });
    let snapshot = rx.recv().unwrap().unwrap().object;
    assert_eq!(snapshot.status, ObjectStatus::Exists);
    assert_eq!(&snapshot.data[..], &[2u8; 100]);

    let current = read(&osd.stage, &id, 0).object;
    assert_eq!(&current.data[..], &[9u8; 10]);
}
