//! Peer network seam.
//!
//! Signaling, ICE and NAT traversal belong to whatever implements
//! [`PeerNetwork`]; the mesh only needs reliable, ordered, bidirectional
//! byte links addressed by peer id. [`MemoryNetwork`] provides them inside
//! one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SyncError;

/// One open data channel to a remote peer.
///
/// Dropping `sender` closes the link; the far side's `receiver` then
/// yields `None` after draining what was already sent.
pub struct PeerLink {
    pub remote: String,
    /// Peer id of the side that opened the link.
    pub initiator: String,
    pub sender: mpsc::Sender<Vec<u8>>,
    pub receiver: mpsc::Receiver<Vec<u8>>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("initiator", &self.initiator)
            .finish()
    }
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Register `peer_id` with signaling. Inbound links arrive on the
    /// returned channel, which closes when signaling drops this peer.
    async fn listen(&self, peer_id: &str) -> Result<mpsc::Receiver<PeerLink>, SyncError>;

    /// Open a link from `from` to `to`.
    async fn connect(&self, from: &str, to: &str) -> Result<PeerLink, SyncError>;

    /// Deregister `peer_id`. Open links are unaffected.
    async fn unlisten(&self, peer_id: &str);
}

/// In-process network: every listener is a channel in a shared map.
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, mpsc::Sender<PeerLink>>>,
    online: AtomicBool,
    link_capacity: usize,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Network whose links buffer `link_capacity` messages per direction.
    pub fn with_capacity(link_capacity: usize) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            link_capacity,
        }
    }

    /// Take signaling down (dropping every listener) or bring it back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.listeners.lock().clear();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Forget one listener, as if signaling dropped that peer.
    pub fn drop_listener(&self, peer_id: &str) -> bool {
        self.listeners.lock().remove(peer_id).is_some()
    }

    pub fn is_listening(&self, peer_id: &str) -> bool {
        self.listeners.lock().contains_key(peer_id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::Signaling("network".into()))
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    async fn listen(&self, peer_id: &str) -> Result<mpsc::Receiver<PeerLink>, SyncError> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(64);
        self.listeners.lock().insert(peer_id.to_string(), tx);
        log::debug!("{peer_id} listening");
        Ok(rx)
    }

    async fn connect(&self, from: &str, to: &str) -> Result<PeerLink, SyncError> {
        self.check_online()?;
        let listener = self
            .listeners
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| SyncError::PeerUnavailable(to.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel(self.link_capacity);
        let (in_tx, in_rx) = mpsc::channel(self.link_capacity);
        let remote_end = PeerLink {
            remote: from.to_string(),
            initiator: from.to_string(),
            sender: in_tx,
            receiver: out_rx,
        };
        listener
            .send(remote_end)
            .await
            .map_err(|_| SyncError::PeerUnavailable(to.to_string()))?;

        Ok(PeerLink {
            remote: to.to_string(),
            initiator: from.to_string(),
            sender: out_tx,
            receiver: in_rx,
        })
    }

    async fn unlisten(&self, peer_id: &str) {
        self.listeners.lock().remove(peer_id);
    }
}
