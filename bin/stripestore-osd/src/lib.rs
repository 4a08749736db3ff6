//! StripeStore OSD - request pipeline of the object storage daemon
//!
//! Storage requests are routed to a fixed pool of storage threads by file
//! id. Each thread owns the metadata of its files and drives the storage
//! layout; writes that extend a file announce the new last object to the
//! other replica holders through GMAX datagrams.

pub mod gmax;
pub mod request;
pub mod stage;
pub mod thread;

pub use gmax::{GmaxHint, GmaxListener, GmaxSender, NoopGmaxSender, UdpGmaxSender};
pub use request::{
    Callback, GmaxInfo, ReadResult, ReplicaState, SharedCowPolicy, StorageRequest,
    TruncateResult, WriteRequest, WriteResult, completion,
};
pub use stage::StorageStage;
pub use thread::{StorageThread, ThreadStats, ThreadStatsSnapshot};
