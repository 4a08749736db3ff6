//! GMAX hint transport
//!
//! When a write extends a file, the owning storage thread tells the other
//! replica holders about the new last object number with one UDP datagram
//! per peer. Delivery is not guaranteed and receivers treat the hint as
//! advisory; the authoritative file size lives on the metadata node.

use crate::request::StorageRequest;
use crate::stage::StorageStage;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use stripestore_common::{Error, FileId, Result};
use tracing::{debug, info, warn};

/// Largest datagram accepted by the listener
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// How often the listener checks for shutdown while idle
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Best-effort announcement of a file's last object number
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmaxHint {
    pub file_id: FileId,
    pub truncate_epoch: u64,
    pub last_object: u64,
}

impl GmaxHint {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Sends GMAX hints to replica peers
///
/// Implementations never report failures to the caller.
pub trait GmaxSender: Send + Sync {
    fn send(&self, hint: &GmaxHint, peers: &[SocketAddr]);
}

/// Sender for single-node setups
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGmaxSender;

impl GmaxSender for NoopGmaxSender {
    fn send(&self, _hint: &GmaxHint, _peers: &[SocketAddr]) {}
}

/// Sends each hint as one UDP datagram per peer
pub struct UdpGmaxSender {
    socket: UdpSocket,
}

impl UdpGmaxSender {
    /// Bind a sending socket to `addr` (port 0 picks an ephemeral port)
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket })
    }
}

impl GmaxSender for UdpGmaxSender {
    fn send(&self, hint: &GmaxHint, peers: &[SocketAddr]) {
        let payload = match hint.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode GMAX hint for {}: {}", hint.file_id, e);
                return;
            }
        };
        for peer in peers {
            if let Err(e) = self.socket.send_to(&payload, peer) {
                warn!("failed to send GMAX hint for {} to {}: {}", hint.file_id, peer, e);
            }
        }
    }
}

/// Background thread feeding received GMAX hints into the storage stage
pub struct GmaxListener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GmaxListener {
    /// Bind to `addr` and start receiving hints
    pub fn start(addr: SocketAddr, stage: Arc<StorageStage>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("gmax-listener".into())
            .spawn(move || receive_loop(&socket, &stage, &flag))?;

        info!("GMAX listener bound to {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop receiving and wait for the listener thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("GMAX listener thread panicked");
        }
    }
}

impl Drop for GmaxListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: &UdpSocket, stage: &StorageStage, running: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while running.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                warn!("GMAX listener receive error: {}", e);
                continue;
            }
        };

        let hint = match GmaxHint::decode(&buf[..len]) {
            Ok(hint) => hint,
            Err(e) => {
                debug!("dropping malformed GMAX datagram from {}: {}", from, e);
                continue;
            }
        };
        debug!(
            "GMAX hint from {}: {} epoch {} last object {}",
            from, hint.file_id, hint.truncate_epoch, hint.last_object
        );
        stage.enqueue(StorageRequest::GmaxReceived {
            file_id: hint.file_id,
            truncate_epoch: hint.truncate_epoch,
            last_object: hint.last_object,
        });
    }
    debug!("GMAX listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_encoding() {
        let hint = GmaxHint {
            file_id: FileId::new("vol:42"),
            truncate_epoch: 3,
            last_object: 17,
        };
        let encoded = hint.encode().unwrap();
        assert_eq!(GmaxHint::decode(&encoded).unwrap(), hint);
        assert!(GmaxHint::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn test_udp_sender_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let sender = UdpGmaxSender::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let hint = GmaxHint {
            file_id: FileId::new("vol:udp"),
            truncate_epoch: 0,
            last_object: 5,
        };
        sender.send(&hint, &[receiver.local_addr().unwrap()]);

        let mut buf = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(GmaxHint::decode(&buf[..len]).unwrap(), hint);
    }
}
