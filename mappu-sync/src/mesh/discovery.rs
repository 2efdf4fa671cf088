//! Room-scoped peer discovery state.
//!
//! Two records per room live in a [`DiscoveryStore`]:
//!
//! ```text
//! directory:    { "<peer id>": { "timestamp": <ms>, "pub": "<key>" }, … }
//!               refreshed by its owner every 30s, pruned by any reader > 60s
//! known peers:  [ "<peer id>", … ]   bounded (20), oldest evicted first
//! ```
//!
//! Updates go through closures so a store can apply them atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Stored value of one directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Last registration, epoch ms.
    pub timestamp: u64,
    /// Identity public key of the owner.
    #[serde(rename = "pub")]
    pub public_key: String,
}

/// Peer id → record.
pub type DirectoryMap = BTreeMap<String, DirectoryRecord>;

/// A live directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDirectoryEntry {
    pub peer_id: String,
    pub identity_public_key: String,
    pub last_seen_ms: u64,
}

/// Backing storage shared by every participant that can see it.
pub trait DiscoveryStore: Send + Sync {
    /// Apply `f` to the room directory and return the result.
    fn update_directory(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut DirectoryMap),
    ) -> Result<DirectoryMap, SyncError>;

    /// Apply `f` to the room's known-peers list and return the result.
    fn update_known_peers(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut Vec<String>),
    ) -> Result<Vec<String>, SyncError>;
}

// ─── Memory store ───────────────────────────────────────────────────

/// In-process store; every manager holding the same `Arc` sees the same rooms.
#[derive(Default)]
pub struct MemoryDiscoveryStore {
    directories: Mutex<BTreeMap<String, DirectoryMap>>,
    known: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MemoryDiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiscoveryStore for MemoryDiscoveryStore {
    fn update_directory(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut DirectoryMap),
    ) -> Result<DirectoryMap, SyncError> {
        let mut dirs = self.directories.lock();
        let dir = dirs.entry(room.to_string()).or_default();
        f(dir);
        Ok(dir.clone())
    }

    fn update_known_peers(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut Vec<String>),
    ) -> Result<Vec<String>, SyncError> {
        let mut known = self.known.lock();
        let list = known.entry(room.to_string()).or_default();
        f(list);
        Ok(list.clone())
    }
}

// ─── File store ─────────────────────────────────────────────────────

/// JSON files in a directory, shared by processes on one host.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never sees half a record.
pub struct FileDiscoveryStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileDiscoveryStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, kind: &str, room: &str) -> PathBuf {
        self.dir
            .join(format!("mappu-{kind}-{}.json", URL_SAFE_NO_PAD.encode(room)))
    }

    fn update<T>(&self, path: PathBuf, f: &mut dyn FnMut(&mut T)) -> Result<T, SyncError>
    where
        T: Default + Clone + Serialize + for<'de> Deserialize<'de>,
    {
        let _guard = self.lock.lock();
        let mut value: T = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("Discarding unreadable {}: {e}", path.display());
                T::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => return Err(e.into()),
        };
        f(&mut value);

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(value)
    }
}

impl DiscoveryStore for FileDiscoveryStore {
    fn update_directory(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut DirectoryMap),
    ) -> Result<DirectoryMap, SyncError> {
        self.update(self.path("room-peers", room), f)
    }

    fn update_known_peers(
        &self,
        room: &str,
        f: &mut dyn FnMut(&mut Vec<String>),
    ) -> Result<Vec<String>, SyncError> {
        self.update(self.path("known-peers", room), f)
    }
}

// ─── Directory ──────────────────────────────────────────────────────

/// Room directory: who is (probably) online right now.
#[derive(Clone)]
pub struct PeerDirectory {
    store: Arc<dyn DiscoveryStore>,
    room: String,
    ttl: Duration,
}

impl PeerDirectory {
    pub fn new(store: Arc<dyn DiscoveryStore>, room: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            room: room.into(),
            ttl,
        }
    }

    /// Insert or refresh an entry, pruning expired ones.
    pub fn register(&self, peer_id: &str, public_key: &str, now_ms: u64) -> Result<(), SyncError> {
        let cutoff = now_ms.saturating_sub(self.ttl.as_millis() as u64);
        self.store.update_directory(&self.room, &mut |dir| {
            dir.insert(
                peer_id.to_string(),
                DirectoryRecord {
                    timestamp: now_ms,
                    public_key: public_key.to_string(),
                },
            );
            dir.retain(|_, rec| rec.timestamp >= cutoff);
        })?;
        Ok(())
    }

    /// Entries refreshed within the TTL. Expired ones are removed.
    pub fn live_peers(&self, now_ms: u64) -> Result<Vec<PeerDirectoryEntry>, SyncError> {
        let cutoff = now_ms.saturating_sub(self.ttl.as_millis() as u64);
        let dir = self.store.update_directory(&self.room, &mut |dir| {
            dir.retain(|_, rec| rec.timestamp >= cutoff);
        })?;
        Ok(dir
            .into_iter()
            .map(|(peer_id, rec)| PeerDirectoryEntry {
                peer_id,
                identity_public_key: rec.public_key,
                last_seen_ms: rec.timestamp,
            })
            .collect())
    }

    pub fn unregister(&self, peer_id: &str) -> Result<(), SyncError> {
        self.store.update_directory(&self.room, &mut |dir| {
            dir.remove(peer_id);
        })?;
        Ok(())
    }
}

// ─── Known peers ────────────────────────────────────────────────────

/// Peers this room has dialed before, for reconnection hints.
#[derive(Clone)]
pub struct KnownPeers {
    store: Arc<dyn DiscoveryStore>,
    room: String,
    capacity: usize,
}

impl KnownPeers {
    pub fn new(store: Arc<dyn DiscoveryStore>, room: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            room: room.into(),
            capacity,
        }
    }

    /// Append `peer_id` if absent, evicting the oldest beyond capacity.
    pub fn remember(&self, peer_id: &str) -> Result<(), SyncError> {
        let capacity = self.capacity;
        self.store.update_known_peers(&self.room, &mut |list| {
            if !list.iter().any(|p| p == peer_id) {
                list.push(peer_id.to_string());
            }
            if list.len() > capacity {
                let excess = list.len() - capacity;
                list.drain(..excess);
            }
        })?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, SyncError> {
        self.store.update_known_peers(&self.room, &mut |_| {})
    }
}
