//! Room registry: membership, fan-out and TTL eviction.
//!
//! ```text
//!            ┌──────────────── RoomRegistry ────────────────┐
//!  conn 1 ──►│ "board-a" ─ Room { connections, last_activity,│──► broadcast ─► conn 2, conn 3
//!  conn 2 ──►│              snapshot cache, awareness cache } │
//!  conn 3 ──►│ "board-b" ─ Room { … }                         │
//!            └───────────────────────────────────────────────┘
//!                     ▲ sweep(now, ttl): drop empty + idle
//! ```
//!
//! One coarse lock guards the whole map; it is shared by connection tasks
//! and the sweeper. Frames are relayed as the exact text received, so the
//! relay never re-encodes client payloads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use crate::awareness::AwarenessTable;
use crate::engine::{DocumentEngine, Origin, YrsEngine};
use crate::protocol::RelayFrame;

/// Server-assigned id of one accepted WebSocket.
pub type ConnectionId = u64;

/// Builds the per-room snapshot cache.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn DocumentEngine> + Send + Sync>;

/// The default factory: a yrs document per room.
pub fn yrs_engine_factory() -> EngineFactory {
    Arc::new(|| Box::new(YrsEngine::new()) as Box<dyn DocumentEngine>)
}

const RELAY_CLIENT_ID: &str = "relay";

/// One frame on a room's broadcast channel.
#[derive(Debug, Clone)]
pub struct RelayPacket {
    pub sender: ConnectionId,
    pub frame: Arc<str>,
}

/// Result of a join: frames to send back, and the room's feed.
pub struct JoinReply {
    /// Snapshot `u` frame, then an `a` frame when any state is known.
    pub frames: Vec<String>,
    pub receiver: broadcast::Receiver<RelayPacket>,
}

struct Room {
    connections: HashSet<ConnectionId>,
    last_activity: Instant,
    snapshot: Box<dyn DocumentEngine>,
    awareness: AwarenessTable,
    sender: broadcast::Sender<RelayPacket>,
}

impl Room {
    fn new(snapshot: Box<dyn DocumentEngine>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            connections: HashSet::new(),
            last_activity: Instant::now(),
            snapshot,
            awareness: AwarenessTable::new(RELAY_CLIENT_ID),
            sender,
        }
    }
}

/// Lock-free registry counters.
#[derive(Debug, Default)]
struct RoomCounters {
    rooms_created: AtomicU64,
    rooms_evicted: AtomicU64,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Point-in-time copy of the registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_evicted: u64,
    pub frames_relayed: u64,
    /// Frames from connections that had not joined a room.
    pub frames_dropped: u64,
}

/// All rooms of one relay.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    engine_factory: EngineFactory,
    broadcast_capacity: usize,
    awareness_timeout: Duration,
    counters: RoomCounters,
}

impl RoomRegistry {
    pub fn new(engine_factory: EngineFactory, broadcast_capacity: usize, awareness_timeout: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            engine_factory,
            broadcast_capacity,
            awareness_timeout,
            counters: RoomCounters::default(),
        }
    }

    /// Bind `conn` to `room_id`, creating the room if needed.
    ///
    /// Re-joining the same room is harmless and yields a fresh snapshot.
    pub async fn join(&self, conn: ConnectionId, room_id: &str) -> JoinReply {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            self.counters.rooms_created.fetch_add(1, Ordering::Relaxed);
            log::info!("Room {room_id} created");
            Room::new((self.engine_factory)(), self.broadcast_capacity)
        });
        room.connections.insert(conn);
        room.last_activity = Instant::now();

        let mut frames = vec![RelayFrame::update(&room.snapshot.snapshot()).to_text()];
        if room.awareness.fresh_len(self.awareness_timeout) > 0 {
            match room.awareness.encode_fresh(self.awareness_timeout) {
                Ok(bytes) => frames.push(RelayFrame::awareness(&bytes).to_text()),
                Err(e) => log::warn!("Room {room_id}: cannot encode awareness: {e}"),
            }
        }
        log::debug!(
            "Connection {conn} joined room {room_id} ({} connections)",
            room.connections.len()
        );

        JoinReply {
            frames,
            receiver: room.sender.subscribe(),
        }
    }

    /// Remove `conn` from `room_id`. The room itself is left for the sweeper.
    pub async fn leave(&self, conn: ConnectionId, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(room_id) {
            if room.connections.remove(&conn) {
                room.last_activity = Instant::now();
                log::debug!(
                    "Connection {conn} left room {room_id} ({} remaining)",
                    room.connections.len()
                );
            }
        }
    }

    /// Fold an update or awareness frame into the room caches and fan the
    /// raw text out to every other member. Returns the receiver count.
    pub async fn relay(&self, conn: ConnectionId, room_id: &str, frame: &RelayFrame, raw: Arc<str>) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id).filter(|r| r.connections.contains(&conn)) else {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        room.last_activity = Instant::now();

        match frame.payload() {
            Ok(bytes) => {
                let folded = match frame {
                    RelayFrame::Update { .. } => room.snapshot.apply_update(&bytes, Origin::Relay).map(|_| ()),
                    RelayFrame::Awareness { .. } => room.awareness.apply_update(&bytes, Origin::Relay).map(|_| ()),
                    RelayFrame::Join { .. } => Ok(()),
                };
                if let Err(e) = folded {
                    log::debug!("Room {room_id}: cache not updated: {e}");
                }
            }
            Err(e) => log::debug!("Room {room_id}: {e}"),
        }

        self.counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
        room.sender
            .send(RelayPacket { sender: conn, frame: raw })
            .unwrap_or(0)
    }

    /// Count a frame from a connection that has not joined.
    pub fn record_dropped(&self) {
        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete every room with no connections and no activity for longer
    /// than `ttl`. Returns the evicted room ids.
    pub async fn sweep(&self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let expired: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| {
                room.connections.is_empty() && now.saturating_duration_since(room.last_activity) > ttl
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            rooms.remove(id);
            log::info!("Room {id} evicted after {}s idle", ttl.as_secs());
        }
        for (id, room) in rooms.iter() {
            let forgotten = room.awareness.compact(self.awareness_timeout);
            if forgotten > 0 {
                log::debug!("Room {id}: forgot {forgotten} departed awareness entries");
            }
        }
        self.counters
            .rooms_evicted
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn connection_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, |r| r.connections.len())
    }

    /// Awareness entries cached for `room_id`, cleared ones included.
    pub async fn awareness_entries(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, |r| r.awareness.tracked_len())
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            active_rooms: self.room_count().await,
            rooms_created: self.counters.rooms_created.load(Ordering::Relaxed),
            rooms_evicted: self.counters.rooms_evicted.load(Ordering::Relaxed),
            frames_relayed: self.counters.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
