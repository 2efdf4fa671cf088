//! Per-room session: picks a transport and fails over.
//!
//! ```text
//!                    relay url?
//!  Unattempted ──yes──► RelayPending ──doc update──► RelayActive
//!       │                   │
//!       no          timer / relay error
//!       │                   │
//!       └──────────────► FallbackMesh
//!
//!  any state ──teardown──► Closed
//! ```
//!
//! [`FailoverController`] is the transition function and never touches a
//! provider. [`Session`] runs it on a driver task that performs the
//! actions, so "is the timer still armed?" is answered in one place.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::awareness::AwarenessTable;
use crate::engine::DocumentEngine;
use crate::identity::Identity;
use crate::provider::{Provider, ProviderContext, ProviderFactory};

/// How long the relay has to produce a document update.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment variable holding the relay endpoint.
pub const RELAY_URL_ENV: &str = "MAPPU_RELAY_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Unattempted,
    RelayPending,
    RelayActive,
    FallbackMesh,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverEvent {
    Start { has_relay: bool },
    /// Any document update, local or remote.
    DocumentUpdated,
    TimerElapsed,
    /// The relay provider could not be constructed.
    RelayFailed,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    AttachRelay,
    AttachMesh,
    ArmTimer,
    DisarmTimer,
    /// Destroy the attached provider, whichever it is.
    DestroyActive,
}

/// Pure failover state machine.
#[derive(Debug, Clone)]
pub struct FailoverController {
    state: FailoverState,
}

impl FailoverController {
    pub fn new() -> Self {
        Self {
            state: FailoverState::Unattempted,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    /// Apply `event` and return the actions to perform, in order.
    /// Events that do not apply to the current state yield nothing.
    pub fn handle(&mut self, event: FailoverEvent) -> Vec<FailoverAction> {
        use FailoverAction::*;
        use FailoverState::*;

        let (next, actions) = match (self.state, event) {
            (Unattempted, FailoverEvent::Start { has_relay: true }) => {
                (RelayPending, vec![AttachRelay, ArmTimer])
            }
            (Unattempted, FailoverEvent::Start { has_relay: false }) => (FallbackMesh, vec![AttachMesh]),
            (RelayPending, FailoverEvent::DocumentUpdated) => (RelayActive, vec![DisarmTimer]),
            (RelayPending, FailoverEvent::TimerElapsed) => {
                (FallbackMesh, vec![DisarmTimer, DestroyActive, AttachMesh])
            }
            (RelayPending, FailoverEvent::RelayFailed) => (FallbackMesh, vec![DisarmTimer, AttachMesh]),
            (Unattempted, FailoverEvent::Teardown) => (Closed, vec![]),
            (RelayPending, FailoverEvent::Teardown) => (Closed, vec![DisarmTimer, DestroyActive]),
            (RelayActive | FallbackMesh, FailoverEvent::Teardown) => (Closed, vec![DestroyActive]),
            (state, _) => (state, vec![]),
        };
        if next != self.state {
            log::debug!("Failover {:?} -> {next:?} on {event:?}", self.state);
        }
        self.state = next;
        actions
    }
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Session ────────────────────────────────────────────────────────

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: String,
    /// Relay endpoint; `None` goes straight to the mesh
    pub relay_url: Option<String>,
    pub failover_timeout: Duration,
    pub identity: Identity,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room: String::new(),
            relay_url: None,
            failover_timeout: DEFAULT_FAILOVER_TIMEOUT,
            identity: Identity::anonymous(),
        }
    }
}

impl SessionConfig {
    pub fn new(room: impl Into<String>, identity: Identity) -> Self {
        Self {
            room: room.into(),
            identity,
            ..Self::default()
        }
    }

    /// Like [`SessionConfig::new`], with the relay endpoint from
    /// `MAPPU_RELAY_URL`.
    pub fn from_env(room: impl Into<String>, identity: Identity) -> Self {
        Self::from_lookup(room, identity, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(room: impl Into<String>, identity: Identity, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let relay_url = lookup(RELAY_URL_ENV)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Self {
            relay_url,
            ..Self::new(room, identity)
        }
    }
}

/// An open room: exactly one attached provider until closed.
pub struct Session {
    room: String,
    state: watch::Receiver<FailoverState>,
    provider: watch::Receiver<Option<Arc<dyn Provider>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start the driver. Must be called inside a tokio runtime.
    pub fn open(
        config: SessionConfig,
        engine: Arc<dyn DocumentEngine>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let room = config.room.clone();
        let (state_tx, state_rx) = watch::channel(FailoverState::Unattempted);
        let (provider_tx, provider_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            config,
            engine,
            factory,
            controller: FailoverController::new(),
            active: None,
            deadline: None,
            state: state_tx,
            provider: provider_tx,
        };
        let task = tokio::spawn(driver.run(shutdown_rx));
        log::info!("Session opened for room {room}");

        Self {
            room,
            state: state_rx,
            provider: provider_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn state(&self) -> FailoverState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FailoverState> {
        self.state.clone()
    }

    /// The attached provider, if any.
    pub fn provider(&self) -> Option<Arc<dyn Provider>> {
        self.provider.borrow().clone()
    }

    /// Awareness of the attached provider.
    pub fn awareness(&self) -> Option<Arc<AwarenessTable>> {
        self.provider().map(|p| p.awareness())
    }

    /// Destroy the attached provider and stop the driver. Idempotent.
    pub async fn close(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Session driver for {} ended abnormally: {e}", self.room);
            }
        }
    }
}

struct Driver {
    config: SessionConfig,
    engine: Arc<dyn DocumentEngine>,
    factory: Arc<dyn ProviderFactory>,
    controller: FailoverController,
    active: Option<Arc<dyn Provider>>,
    deadline: Option<Instant>,
    state: watch::Sender<FailoverState>,
    provider: watch::Sender<Option<Arc<dyn Provider>>>,
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        // Subscribed before the relay exists so its first sync is seen.
        let mut doc_rx = self.engine.subscribe();
        let has_relay = self.config.relay_url.is_some();
        self.dispatch(FailoverEvent::Start { has_relay }).await;

        loop {
            let pending = self.controller.state() == FailoverState::RelayPending;
            let deadline = self.deadline;
            tokio::select! {
                _ = &mut shutdown => break,

                _ = doc_rx.recv(), if pending => {
                    self.dispatch(FailoverEvent::DocumentUpdated).await;
                }

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if pending => {
                    self.dispatch(FailoverEvent::TimerElapsed).await;
                }
            }
        }

        self.dispatch(FailoverEvent::Teardown).await;
        log::info!("Session for room {} closed", self.config.room);
    }

    async fn dispatch(&mut self, event: FailoverEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for action in self.controller.handle(event) {
                match action {
                    FailoverAction::AttachRelay => {
                        let url = self.config.relay_url.clone().unwrap_or_default();
                        match self.factory.relay(&url, self.context()) {
                            Ok(provider) => self.attach(provider),
                            Err(e) => {
                                log::warn!("Relay {url} unusable, falling back to mesh: {e}");
                                queue.push_back(FailoverEvent::RelayFailed);
                            }
                        }
                    }
                    FailoverAction::AttachMesh => match self.factory.mesh(self.context()) {
                        Ok(provider) => self.attach(provider),
                        Err(e) => log::warn!("Mesh unavailable for room {}: {e}", self.config.room),
                    },
                    FailoverAction::ArmTimer => {
                        self.deadline = Some(Instant::now() + self.config.failover_timeout);
                    }
                    FailoverAction::DisarmTimer => self.deadline = None,
                    FailoverAction::DestroyActive => {
                        if let Some(provider) = self.active.take() {
                            self.provider.send_replace(None);
                            provider.destroy().await;
                        }
                    }
                }
            }
            let state = self.controller.state();
            if state != FailoverState::RelayPending {
                self.deadline = None;
            }
            self.state.send_replace(state);
        }
    }

    fn attach(&mut self, provider: Arc<dyn Provider>) {
        log::info!("Room {} attached {:?} provider", self.config.room, provider.kind());
        self.active = Some(provider.clone());
        self.provider.send_replace(Some(provider));
    }

    fn context(&self) -> ProviderContext {
        ProviderContext::new(
            self.config.room.clone(),
            self.engine.clone(),
            self.config.identity.clone(),
        )
    }
}

// ─── Host ───────────────────────────────────────────────────────────

/// Owns the session of whichever room is open and replaces it wholesale on
/// a room switch.
pub struct SessionHost {
    template: SessionConfig,
    factory: Arc<dyn ProviderFactory>,
    current: Option<Session>,
}

impl SessionHost {
    /// `template` supplies everything but the room.
    pub fn new(template: SessionConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            template,
            factory,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Close the current session, then open `room` over `engine`.
    pub async fn switch_room(&mut self, room: impl Into<String>, engine: Arc<dyn DocumentEngine>) -> &Session {
        self.close().await;
        let config = SessionConfig {
            room: room.into(),
            ..self.template.clone()
        };
        self.current.insert(Session::open(config, engine, self.factory.clone()))
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            session.close().await;
        }
    }
}
