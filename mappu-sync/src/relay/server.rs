//! WebSocket relay server with room multiplexing and TTL eviction.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── snapshot cache (u on join)
//!             ├── Room ("board-1") ────┼── awareness cache (a on join)
//! Client B ──┘        │               └── broadcast channel
//!                     │                        │
//!                     │             ┌──────────┴──────────┐
//!                     ▼             ▼                     ▼
//!               sweeper (60s)   Client A (skipped     Client B
//!               drops empty     when sender)
//!               idle rooms
//! ```
//!
//! The relay keeps nothing on disk. A room evicted by the sweeper is
//! recreated empty by the next join; clients re-supply state on reconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use super::room::{yrs_engine_factory, ConnectionId, EngineFactory, RelayPacket, RoomRegistry};
use crate::error::SyncError;
use crate::protocol::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Idle time after which an empty room is deleted
    pub room_ttl: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Awareness entries older than this are left out of join replies
    pub awareness_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            room_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            broadcast_capacity: 256,
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT` and `TTL_MIN`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.bind_addr = format!("0.0.0.0:{port}"),
                Err(e) => log::warn!("Ignoring invalid PORT={raw:?}: {e}"),
            }
        }
        if let Some(raw) = lookup("TTL_MIN") {
            match raw.trim().parse::<u64>() {
                Ok(minutes) => config.room_ttl = Duration::from_secs(minutes.saturating_mul(60)),
                Err(e) => log::warn!("Ignoring invalid TTL_MIN={raw:?}: {e}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub frames_relayed: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
    pub rooms_evicted: u64,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    frames: AtomicU64,
    malformed: AtomicU64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    counters: Arc<ConnectionCounters>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    /// Relay whose rooms cache state in a yrs document.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_engine_factory(config, yrs_engine_factory())
    }

    pub fn with_engine_factory(config: ServerConfig, engine_factory: EngineFactory) -> Self {
        let registry = RoomRegistry::new(
            engine_factory,
            config.broadcast_capacity,
            config.awareness_timeout,
        );
        Self {
            config,
            registry: Arc::new(registry),
            counters: Arc::new(ConnectionCounters::default()),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let sweeper = self.spawn_sweeper();
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), SyncError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let registry = self.registry.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, conn_id, registry, counters).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let ttl = self.config.room_ttl;
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let evicted = registry.sweep(Instant::now(), ttl).await;
                if !evicted.is_empty() {
                    log::info!("Sweep evicted {} idle rooms", evicted.len());
                }
            }
        })
    }

    /// Handle a single WebSocket connection. Membership is released however
    /// the connection ends.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: ConnectionId,
        registry: Arc<RoomRegistry>,
        counters: Arc<ConnectionCounters>,
    ) -> Result<(), SyncError> {
        counters.total.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        let mut joined: Option<String> = None;
        let result = Self::connection_loop(stream, addr, conn_id, &registry, &counters, &mut joined).await;

        if let Some(room) = joined {
            registry.leave(conn_id, &room).await;
        }
        counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} closed");
        result
    }

    async fn connection_loop(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: ConnectionId,
        registry: &RoomRegistry,
        counters: &ConnectionCounters,
        joined: &mut Option<String>,
    ) -> Result<(), SyncError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection {conn_id} established from {addr}");

        let mut feed: Option<broadcast::Receiver<RelayPacket>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counters.frames.fetch_add(1, Ordering::Relaxed);
                            let raw: Arc<str> = Arc::from(text.as_str());
                            match RelayFrame::parse(&raw) {
                                Ok(RelayFrame::Join { room }) => {
                                    if let Some(previous) = joined.take() {
                                        if previous != room {
                                            registry.leave(conn_id, &previous).await;
                                        }
                                    }
                                    let reply = registry.join(conn_id, &room).await;
                                    feed = Some(reply.receiver);
                                    *joined = Some(room);
                                    for frame in reply.frames {
                                        ws_sender.send(Message::Text(frame.into())).await?;
                                    }
                                }
                                Ok(frame) => match joined.as_deref() {
                                    Some(room) => {
                                        registry.relay(conn_id, room, &frame, raw).await;
                                    }
                                    None => {
                                        registry.record_dropped();
                                        log::debug!("Dropping frame from unjoined connection {conn_id}");
                                    }
                                },
                                Err(e) => {
                                    counters.malformed.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Malformed frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            counters.malformed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Unexpected binary frame from {addr}");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room traffic
                packet = async {
                    match feed.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match packet {
                        Ok(packet) => {
                            // No echo to the sender
                            if packet.sender != conn_id {
                                ws_sender.send(Message::Text(packet.frame.to_string().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn_id} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => feed = None,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let rooms = self.registry.stats().await;
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            frames_received: self.counters.frames.load(Ordering::Relaxed),
            malformed_frames: self.counters.malformed.load(Ordering::Relaxed),
            frames_relayed: rooms.frames_relayed,
            frames_dropped: rooms.frames_dropped,
            active_rooms: rooms.active_rooms,
            rooms_evicted: rooms.rooms_evicted,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
