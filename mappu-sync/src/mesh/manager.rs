//! Peer mesh provider.
//!
//! One event loop owns every link to the room's peers:
//!
//! ```text
//!  commands ─┐        ┌─ register tick (30s): directory + announce
//!  listener ─┤        ├─ discovery tick (30s): directory, invite, known peers
//!  link I/O ─┼─ loop ─┼─ heartbeat tick (4s): `ping` awareness field
//!  engine ───┤        └─ re-listen timer (signaling backoff)
//!  awareness ┘
//! ```
//!
//! Links are handshaken with announce, snapshot and full awareness. After
//! that every document and awareness update is flooded to all links except
//! the one it arrived on; repeats die out because applying a known update is
//! a no-op. A newly attached peer is announced to the other links, and an
//! announcement naming an unknown peer is dialed and passed on, which grows
//! the mesh transitively.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::awareness::AwarenessTable;
use crate::engine::Origin;
use crate::error::SyncError;
use crate::identity::{peer_hint_from_fragment, share_fragment, USER_FIELD};
use crate::presence::touch_heartbeat;
use crate::protocol::MeshMessage;
use crate::provider::{Provider, ProviderContext, ProviderKind, TransportStatus};
use crate::retry::{RetryDecision, RetryPolicy};

use super::discovery::{DiscoveryStore, KnownPeers, PeerDirectory};
use super::network::{PeerLink, PeerNetwork};

const DESTROY_GRACE: Duration = Duration::from_secs(2);

/// Mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Directory re-registration (and self-announcement) period
    pub register_interval: Duration,
    /// Period of the discovery sweep
    pub discovery_interval: Duration,
    /// Directory entries older than this are ignored and pruned
    pub peer_ttl: Duration,
    /// How often the `ping` awareness field is refreshed
    pub heartbeat_interval: Duration,
    /// Remote awareness entries silent for longer are pruned
    pub presence_timeout: Duration,
    /// Bound of the known-peers cache
    pub known_peers_capacity: usize,
    /// Give up on a dial after this long
    pub connect_timeout: Duration,
    /// Whether discovery reads the room directory
    pub read_directory: bool,
    /// Peer to dial from an invite link
    pub invite_peer: Option<String>,
    /// Signaling re-listen policy
    pub retry: RetryPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            register_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(30),
            peer_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(4),
            presence_timeout: Duration::from_secs(30),
            known_peers_capacity: 20,
            connect_timeout: Duration::from_secs(10),
            read_directory: true,
            invite_peer: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl MeshConfig {
    /// Take the invite hint from a share-link fragment, if it has one.
    pub fn with_invite_fragment(mut self, fragment: &str) -> Self {
        if let Some(peer) = peer_hint_from_fragment(fragment) {
            self.invite_peer = Some(peer);
        }
        self
    }
}

enum Command {
    Connect(String),
    Shutdown,
}

/// A provider that syncs directly with the room's peers.
pub struct MeshManager {
    peer_id: String,
    awareness: Arc<AwarenessTable>,
    status: watch::Receiver<TransportStatus>,
    peers: watch::Receiver<Vec<String>>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshManager {
    /// Derive a peer id and start the event loop. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: MeshConfig,
        ctx: ProviderContext,
        network: Arc<dyn PeerNetwork>,
        store: Arc<dyn DiscoveryStore>,
    ) -> Self {
        let peer_id = ctx.identity.peer_id();
        let awareness = Arc::new(AwarenessTable::new(peer_id.clone()));
        awareness.set_local_field(USER_FIELD, ctx.identity.user_field());

        let (status_tx, status_rx) = watch::channel(TransportStatus::Connecting);
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let directory = PeerDirectory::new(store.clone(), ctx.room.clone(), config.peer_ttl);
        let known = KnownPeers::new(store, ctx.room.clone(), config.known_peers_capacity);

        log::info!("Mesh peer {peer_id} starting in room {}", ctx.room);
        let mesh = MeshLoop {
            config,
            ctx,
            peer_id: peer_id.clone(),
            awareness: awareness.clone(),
            network,
            directory,
            known,
            links: HashMap::new(),
            dialing: HashSet::new(),
            next_generation: 0,
            events: events_tx,
            status: status_tx,
            peers: peers_tx,
            listen_attempt: 0,
            relisten_at: None,
        };
        let task = tokio::spawn(mesh.run(cmd_rx, events_rx));

        Self {
            peer_id,
            awareness,
            status: status_rx,
            peers: peers_rx,
            commands: cmd_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Ids of peers with an open link, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers.borrow().clone()
    }

    /// Watch the connected peer set.
    pub fn peers(&self) -> watch::Receiver<Vec<String>> {
        self.peers.clone()
    }

    /// Dial a specific peer.
    pub fn connect_to(&self, peer_id: impl Into<String>) {
        let _ = self.commands.send(Command::Connect(peer_id.into()));
    }

    /// A share-link fragment that lets others dial this peer directly.
    pub fn share_fragment(&self, fragment: &str) -> String {
        share_fragment(fragment, &self.peer_id)
    }
}

#[async_trait]
impl Provider for MeshManager {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mesh
    }

    fn awareness(&self) -> Arc<AwarenessTable> {
        self.awareness.clone()
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    async fn destroy(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DESTROY_GRACE, &mut task).await.is_err() {
                log::warn!("Mesh {} did not stop in time, aborting", self.peer_id);
                task.abort();
            }
        }
    }
}

impl Drop for MeshManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ─── Event loop ─────────────────────────────────────────────────────

enum LinkEvent {
    Listened(Result<mpsc::Receiver<PeerLink>, SyncError>),
    Dialed {
        peer: String,
        result: Result<PeerLink, SyncError>,
    },
    Frame {
        peer: String,
        generation: u64,
        bytes: Vec<u8>,
    },
    Closed {
        peer: String,
        generation: u64,
    },
}

struct LinkState {
    /// Distinguishes a replaced link's leftovers from the current one.
    generation: u64,
    initiator: String,
    sender: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct MeshLoop {
    config: MeshConfig,
    ctx: ProviderContext,
    peer_id: String,
    awareness: Arc<AwarenessTable>,
    network: Arc<dyn PeerNetwork>,
    directory: PeerDirectory,
    known: KnownPeers,
    links: HashMap<String, LinkState>,
    dialing: HashSet<String>,
    next_generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    status: watch::Sender<TransportStatus>,
    peers: watch::Sender<Vec<String>>,
    listen_attempt: u32,
    relisten_at: Option<Instant>,
}

impl MeshLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let mut doc_rx = self.ctx.engine.subscribe();
        let mut aw_rx = self.awareness.subscribe();
        let mut incoming: Option<mpsc::Receiver<PeerLink>> = None;

        let start = Instant::now();
        let mut register = tokio::time::interval_at(
            start + self.config.register_interval,
            self.config.register_interval,
        );
        let mut discovery = tokio::time::interval_at(
            start + self.config.discovery_interval,
            self.config.discovery_interval,
        );
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        self.spawn_listen();

        loop {
            let relisten_at = self.relisten_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Connect(peer)) => self.dial(peer),
                    Some(Command::Shutdown) | None => break,
                },

                link = async {
                    match incoming.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match link {
                    Some(link) => self.attach(link),
                    None => {
                        incoming = None;
                        self.signaling_lost(SyncError::Signaling("listener closed".into()));
                    }
                },

                Some(event) = events.recv() => match event {
                    LinkEvent::Listened(Ok(rx)) => {
                        incoming = Some(rx);
                        self.on_listening();
                    }
                    LinkEvent::Listened(Err(e)) => self.signaling_lost(e),
                    LinkEvent::Dialed { peer, result } => self.on_dialed(peer, result),
                    LinkEvent::Frame { peer, generation, bytes } => self.on_frame(peer, generation, &bytes),
                    LinkEvent::Closed { peer, generation } => self.on_closed(&peer, generation),
                },

                update = doc_rx.recv() => match update {
                    Ok(update) => {
                        let except = match &update.origin {
                            Origin::Peer(from) => Some(from.as_str()),
                            _ => None,
                        };
                        self.flood(&MeshMessage::Update(update.update.to_vec()), except);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Mesh lagged {n} document updates, resending snapshot");
                        self.flood(&MeshMessage::Update(self.ctx.engine.snapshot()), None);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                event = aw_rx.recv() => match event {
                    Ok(event) => match self.awareness.encode_update(&event.changed()) {
                        Ok(bytes) => {
                            let except = match &event.origin {
                                Origin::Peer(from) => Some(from.as_str()),
                                _ => None,
                            };
                            self.flood(&MeshMessage::Awareness(bytes), except);
                        }
                        Err(e) => log::warn!("Awareness encode failed: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => match self.awareness.encode_full() {
                        Ok(bytes) => self.flood(&MeshMessage::Awareness(bytes), None),
                        Err(e) => log::warn!("Awareness encode failed: {e}"),
                    },
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                _ = register.tick(), if incoming.is_some() => self.register(),

                _ = discovery.tick(), if incoming.is_some() => self.discover(),

                _ = heartbeat.tick() => {
                    touch_heartbeat(&self.awareness);
                    let pruned = self.awareness.prune_stale(self.config.presence_timeout);
                    if !pruned.is_empty() {
                        log::debug!("Pruned {} silent awareness entries", pruned.len());
                    }
                }

                _ = async {
                    match relisten_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.relisten_at = None;
                    self.spawn_listen();
                }
            }
        }

        self.teardown().await;
    }

    // ─── Signaling ──────────────────────────────────────────────────

    fn spawn_listen(&self) {
        let network = self.network.clone();
        let peer_id = self.peer_id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = network.listen(&peer_id).await;
            let _ = events.send(LinkEvent::Listened(result));
        });
    }

    fn on_listening(&mut self) {
        self.listen_attempt = 0;
        self.status.send_replace(TransportStatus::Online);
        log::info!("Mesh peer {} online", self.peer_id);
        self.register();
        self.discover();
    }

    /// Schedule a re-listen, or surface the error once the policy gives up.
    /// Open links keep working either way.
    fn signaling_lost(&mut self, error: SyncError) {
        self.listen_attempt += 1;
        let attempt = self.listen_attempt;
        match self.config.retry.decide(&error, attempt) {
            RetryDecision::RetryAfter(delay) => {
                log::warn!("Mesh signaling: {error}; retry {attempt} in {delay:?}");
                self.status.send_replace(TransportStatus::Reconnecting { attempt });
                self.relisten_at = Some(Instant::now() + delay);
            }
            RetryDecision::GiveUp => {
                log::warn!("Mesh signaling: giving up after {attempt} attempts: {error}");
                self.status.send_replace(TransportStatus::Failed(error.to_string()));
            }
        }
    }

    // ─── Discovery ──────────────────────────────────────────────────

    /// Refresh our directory entry and remind every link who we are.
    fn register(&mut self) {
        let now = crate::unix_millis();
        if let Err(e) = self
            .directory
            .register(&self.peer_id, &self.ctx.identity.public_key, now)
        {
            log::warn!("Directory register failed: {e}");
        }
        self.flood(&MeshMessage::Announce(self.peer_id.clone()), None);
    }

    fn discover(&mut self) {
        let mut candidates = Vec::new();
        if self.config.read_directory {
            match self.directory.live_peers(crate::unix_millis()) {
                Ok(entries) => candidates.extend(entries.into_iter().map(|e| e.peer_id)),
                Err(e) => log::warn!("Directory read failed: {e}"),
            }
        }
        if let Some(peer) = &self.config.invite_peer {
            candidates.push(peer.clone());
        }
        match self.known.list() {
            Ok(list) => candidates.extend(list),
            Err(e) => log::warn!("Known peers read failed: {e}"),
        }
        for peer in candidates {
            self.dial(peer);
        }
    }

    fn dial(&mut self, peer: String) {
        if peer == self.peer_id || self.links.contains_key(&peer) || self.dialing.contains(&peer) {
            return;
        }
        self.dialing.insert(peer.clone());

        let network = self.network.clone();
        let from = self.peer_id.clone();
        let events = self.events.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, network.connect(&from, &peer)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout),
            };
            let _ = events.send(LinkEvent::Dialed { peer, result });
        });
    }

    fn on_dialed(&mut self, peer: String, result: Result<PeerLink, SyncError>) {
        self.dialing.remove(&peer);
        match result {
            Ok(link) => self.attach(link),
            Err(e) => log::debug!("Dial {peer} failed: {e}"),
        }
    }

    // ─── Links ──────────────────────────────────────────────────────

    fn attach(&mut self, link: PeerLink) {
        let PeerLink {
            remote,
            initiator,
            sender,
            mut receiver,
        } = link;
        if remote == self.peer_id {
            return;
        }

        // Both ends keep the link opened by the smaller peer id.
        if let Some(existing) = self.links.get(&remote) {
            let preferred = std::cmp::min(self.peer_id.as_str(), remote.as_str());
            if existing.initiator == preferred && initiator != preferred {
                log::debug!("Dropping duplicate link to {remote}");
                return;
            }
            self.remove_link(&remote);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let peer = remote.clone();
        let reader = tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                let frame = LinkEvent::Frame {
                    peer: peer.clone(),
                    generation,
                    bytes,
                };
                if events.send(frame).is_err() {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed { peer, generation });
        });

        self.handshake(&remote, &sender);
        self.links.insert(
            remote.clone(),
            LinkState {
                generation,
                initiator,
                sender,
                reader,
            },
        );
        self.publish_peers();
        log::info!("Mesh {} linked to {remote}", self.peer_id);

        if let Err(e) = self.known.remember(&remote) {
            log::warn!("Known peers write failed: {e}");
        }
        self.flood(&MeshMessage::Announce(remote.clone()), Some(&remote));
    }

    fn handshake(&self, remote: &str, sender: &mpsc::Sender<Vec<u8>>) {
        let mut messages = vec![
            MeshMessage::Announce(self.peer_id.clone()),
            MeshMessage::Update(self.ctx.engine.snapshot()),
        ];
        match self.awareness.encode_full() {
            Ok(bytes) => messages.push(MeshMessage::Awareness(bytes)),
            Err(e) => log::warn!("Awareness encode failed: {e}"),
        }
        for msg in messages {
            match msg.encode() {
                Ok(bytes) => {
                    if sender.try_send(bytes).is_err() {
                        log::warn!("Handshake to {remote} dropped `{}`", msg.tag());
                    }
                }
                Err(e) => log::warn!("Encode `{}` failed: {e}", msg.tag()),
            }
        }
    }

    fn on_frame(&mut self, peer: String, generation: u64, bytes: &[u8]) {
        if self.links.get(&peer).map(|l| l.generation) != Some(generation) {
            return;
        }
        let msg = match MeshMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring malformed message from {peer}: {e}");
                return;
            }
        };
        log::trace!("{} <- {peer}: {}", self.peer_id, msg.tag());
        match msg {
            MeshMessage::Update(update) => {
                if let Err(e) = self.ctx.engine.apply_update(&update, Origin::Peer(peer.clone())) {
                    log::warn!("Rejected update from {peer}: {e}");
                }
            }
            MeshMessage::Awareness(update) => {
                if let Err(e) = self.awareness.apply_update(&update, Origin::Peer(peer.clone())) {
                    log::warn!("Rejected awareness from {peer}: {e}");
                }
            }
            MeshMessage::Announce(id) => self.on_announce(&peer, id),
        }
    }

    /// Dial a peer we just heard of and pass the news on.
    fn on_announce(&mut self, from: &str, id: String) {
        if id == self.peer_id || self.links.contains_key(&id) || self.dialing.contains(&id) {
            return;
        }
        log::debug!("{} learned of {id} from {from}", self.peer_id);
        self.dial(id.clone());
        self.flood(&MeshMessage::Announce(id), Some(from));
    }

    fn on_closed(&mut self, peer: &str, generation: u64) {
        if self.links.get(peer).map(|l| l.generation) == Some(generation) {
            log::debug!("Link to {peer} closed");
            self.remove_link(peer);
        }
    }

    fn remove_link(&mut self, peer: &str) {
        if let Some(link) = self.links.remove(peer) {
            link.reader.abort();
            self.publish_peers();
        }
    }

    fn publish_peers(&self) {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        self.peers.send_replace(ids);
    }

    /// Send to every link except `except`. Full links drop the message,
    /// closed ones are removed.
    fn flood(&mut self, msg: &MeshMessage, except: Option<&str>) {
        if self.links.is_empty() {
            return;
        }
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Encode `{}` failed: {e}", msg.tag());
                return;
            }
        };
        let mut broken = Vec::new();
        for (peer, link) in &self.links {
            if except == Some(peer.as_str()) {
                continue;
            }
            match link.sender.try_send(bytes.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Link to {peer} is full, dropping `{}`", msg.tag());
                }
                Err(TrySendError::Closed(_)) => broken.push(peer.clone()),
            }
        }
        for peer in broken {
            self.remove_link(&peer);
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────

    async fn teardown(&mut self) {
        self.awareness.clear_local();
        match self.awareness.encode_update(&[self.peer_id.clone()]) {
            Ok(bytes) => self.flood(&MeshMessage::Awareness(bytes), None),
            Err(e) => log::warn!("Awareness encode failed: {e}"),
        }
        if let Err(e) = self.directory.unregister(&self.peer_id) {
            log::warn!("Directory unregister failed: {e}");
        }

        // Dropping the senders closes the links once the removal drains.
        for (_, link) in self.links.drain() {
            link.reader.abort();
        }
        self.publish_peers();
        self.network.unlisten(&self.peer_id).await;
        self.status.send_replace(TransportStatus::Closed);
        log::info!("Mesh peer {} left room {}", self.peer_id, self.ctx.room);
    }
}
