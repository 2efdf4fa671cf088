//! Relay client provider.
//!
//! Provides:
//! - Connection lifecycle (connect, join, reconnect with backoff)
//! - Document and awareness bridging in both directions
//! - Heartbeat field refresh
//! - Awareness removal on destroy
//!
//! On every (re)connect the client joins, then re-supplies its own full
//! state and awareness, so a room the relay evicted is rebuilt from the
//! clients that still hold it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::awareness::{AwarenessEvent, AwarenessTable};
use crate::engine::{DocUpdate, Origin};
use crate::error::SyncError;
use crate::identity::USER_FIELD;
use crate::presence::touch_heartbeat;
use crate::protocol::RelayFrame;
use crate::provider::{Provider, ProviderContext, ProviderKind, TransportStatus};
use crate::retry::{RetryDecision, RetryPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Longest a destroy waits for the goodbye frame before aborting the task.
const DESTROY_GRACE: Duration = Duration::from_secs(2);

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// How often the `ping` awareness field is refreshed
    pub heartbeat_interval: Duration,
    /// Remote awareness entries silent for longer are pruned
    pub presence_timeout: Duration,
    /// Reconnect policy
    pub retry: RetryPolicy,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval: Duration::from_secs(4),
            presence_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Check that `url` is a usable WebSocket endpoint.
pub fn validate_endpoint(url: &str) -> Result<(), SyncError> {
    let invalid = |reason: String| SyncError::InvalidEndpoint {
        url: url.to_string(),
        reason,
    };
    let request = url.into_client_request().map_err(|e| invalid(e.to_string()))?;
    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => {}
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    }
    if request.uri().host().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(())
}

/// A provider speaking the relay protocol.
pub struct RelayProvider {
    awareness: Arc<AwarenessTable>,
    status: watch::Receiver<TransportStatus>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayProvider {
    /// Validate the endpoint and start connecting in the background.
    ///
    /// Only a malformed endpoint fails here; network errors surface through
    /// [`Provider::status`].
    pub fn connect(config: RelayClientConfig, ctx: ProviderContext) -> Result<Self, SyncError> {
        validate_endpoint(&config.url)?;

        let awareness = Arc::new(AwarenessTable::new(ctx.identity.peer_id()));
        awareness.set_local_field(USER_FIELD, ctx.identity.user_field());

        let (status_tx, status_rx) = watch::channel(TransportStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let client = ClientTask {
            config,
            ctx,
            awareness: awareness.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(client.run(shutdown_rx));

        Ok(Self {
            awareness,
            status: status_rx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl Provider for RelayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Relay
    }

    fn awareness(&self) -> Arc<AwarenessTable> {
        self.awareness.clone()
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    async fn destroy(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DESTROY_GRACE, &mut task).await.is_err() {
                log::warn!("Relay client did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for RelayProvider {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ─── Background task ────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Lost(SyncError),
}

struct ClientTask {
    config: RelayClientConfig,
    ctx: ProviderContext,
    awareness: Arc<AwarenessTable>,
    status: watch::Sender<TransportStatus>,
}

impl ClientTask {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        // Subscribe before the first snapshot so no edit falls in between.
        let mut doc_rx = self.ctx.engine.subscribe();
        let mut aw_rx = self.awareness.subscribe();
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = &mut shutdown => break,
                result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result,
            };

            let error = match connected {
                Ok((ws, _)) => {
                    attempt = 0;
                    self.status.send_replace(TransportStatus::Online);
                    log::info!("Relay connected: {} (room {})", self.config.url, self.ctx.room);
                    match self.session(ws, &mut shutdown, &mut doc_rx, &mut aw_rx).await {
                        SessionEnd::Shutdown => {
                            self.status.send_replace(TransportStatus::Closed);
                            return;
                        }
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => SyncError::from(e),
            };

            attempt += 1;
            match self.config.retry.decide(&error, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    log::warn!("Relay {}: {error}; retry {attempt} in {delay:?}", self.config.url);
                    self.status.send_replace(TransportStatus::Reconnecting { attempt });
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    log::warn!("Relay {}: giving up after {attempt} attempts: {error}", self.config.url);
                    self.status.send_replace(TransportStatus::Failed(error.to_string()));
                    let _ = (&mut shutdown).await;
                    break;
                }
            }
        }

        // Not connected: the removal stays local.
        self.awareness.clear_local();
        self.status.send_replace(TransportStatus::Closed);
    }

    async fn session(
        &self,
        ws: WsStream,
        shutdown: &mut oneshot::Receiver<()>,
        doc_rx: &mut broadcast::Receiver<DocUpdate>,
        aw_rx: &mut broadcast::Receiver<AwarenessEvent>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        if let Err(e) = self.handshake(&mut sink).await {
            return SessionEnd::Lost(e);
        }
        match self.pump(&mut sink, &mut stream, shutdown, doc_rx, aw_rx).await {
            Ok(end) => end,
            Err(e) => SessionEnd::Lost(e),
        }
    }

    /// Join, then re-supply local state.
    async fn handshake(&self, sink: &mut WsSink) -> Result<(), SyncError> {
        send_frame(sink, &RelayFrame::join(&self.ctx.room)).await?;
        send_frame(sink, &RelayFrame::update(&self.ctx.engine.snapshot())).await?;
        if self.awareness.local_state().is_some() {
            let bytes = self.awareness.encode_update(&[self.awareness.local_id().to_string()])?;
            send_frame(sink, &RelayFrame::awareness(&bytes)).await?;
        }
        Ok(())
    }

    async fn pump(
        &self,
        sink: &mut WsSink,
        stream: &mut SplitStream<WsStream>,
        shutdown: &mut oneshot::Receiver<()>,
        doc_rx: &mut broadcast::Receiver<DocUpdate>,
        aw_rx: &mut broadcast::Receiver<AwarenessEvent>,
    ) -> Result<SessionEnd, SyncError> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    self.awareness.clear_local();
                    let bytes = self.awareness.encode_update(&[self.awareness.local_id().to_string()])?;
                    send_frame(sink, &RelayFrame::awareness(&bytes)).await?;
                    let _ = sink.close().await;
                    log::info!("Relay provider for room {} closed", self.ctx.room);
                    return Ok(SessionEnd::Shutdown);
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Lost(SyncError::ConnectionClosed)),
                    Some(Err(e)) => return Ok(SessionEnd::Lost(e.into())),
                    _ => {}
                },

                update = doc_rx.recv() => match update {
                    Ok(update) if update.origin != Origin::Relay => {
                        send_frame(sink, &RelayFrame::update(&update.update)).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Relay client lagged {n} document updates, resending snapshot");
                        send_frame(sink, &RelayFrame::update(&self.ctx.engine.snapshot())).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                event = aw_rx.recv() => match event {
                    Ok(event) if event.origin != Origin::Relay => {
                        let bytes = self.awareness.encode_update(&event.changed())?;
                        send_frame(sink, &RelayFrame::awareness(&bytes)).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        send_frame(sink, &RelayFrame::awareness(&self.awareness.encode_full()?)).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                _ = heartbeat.tick() => {
                    touch_heartbeat(&self.awareness);
                    let pruned = self.awareness.prune_stale(self.config.presence_timeout);
                    if !pruned.is_empty() {
                        log::debug!("Pruned {} silent awareness entries", pruned.len());
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let frame = match RelayFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring malformed relay frame: {e}");
                return;
            }
        };
        let payload = match frame.payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Ignoring relay frame: {e}");
                return;
            }
        };
        let applied = match frame {
            RelayFrame::Update { .. } => self.ctx.engine.apply_update(&payload, Origin::Relay).map(|_| ()),
            RelayFrame::Awareness { .. } => self.awareness.apply_update(&payload, Origin::Relay).map(|_| ()),
            RelayFrame::Join { .. } => Ok(()),
        };
        if let Err(e) = applied {
            log::warn!("Rejected relay payload: {e}");
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &RelayFrame) -> Result<(), SyncError> {
    sink.send(Message::Text(frame.to_text().into())).await?;
    Ok(())
}
