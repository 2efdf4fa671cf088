//! Integration tests for relay/mesh failover.
//!
//! Most tests drive a session with counting fake providers on a paused
//! clock; the last two run against a real relay and a real mesh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mappu_sync::awareness::AwarenessTable;
use mappu_sync::engine::{DocumentEngine, OpSetEngine, YrsEngine};
use mappu_sync::error::SyncError;
use mappu_sync::identity::Identity;
use mappu_sync::mesh::{MemoryDiscoveryStore, MemoryNetwork};
use mappu_sync::provider::{
    DefaultProviderFactory, Provider, ProviderContext, ProviderFactory, ProviderKind,
    TransportStatus,
};
use mappu_sync::relay::{RelayClientConfig, RelayProvider, RelayServer, ServerConfig};
use mappu_sync::session::{FailoverState, Session, SessionConfig, SessionHost};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use yrs::{Text, WriteTxn};

// ─── Fakes ──────────────────────────────────────────────────────────

struct FakeProvider {
    kind: ProviderKind,
    awareness: Arc<AwarenessTable>,
    status: watch::Sender<TransportStatus>,
    destroyed: AtomicUsize,
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn awareness(&self) -> Arc<AwarenessTable> {
        self.awareness.clone()
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.subscribe()
    }

    async fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.awareness.clear_local();
        self.status.send_replace(TransportStatus::Closed);
    }
}

#[derive(Default)]
struct FakeFactory {
    fail_relay: bool,
    built: Mutex<Vec<(ProviderKind, String, Arc<FakeProvider>)>>,
}

impl FakeFactory {
    fn failing_relay() -> Self {
        Self {
            fail_relay: true,
            ..Self::default()
        }
    }

    fn build(&self, kind: ProviderKind, ctx: ProviderContext) -> Arc<dyn Provider> {
        let (status, _) = watch::channel(TransportStatus::Online);
        let provider = Arc::new(FakeProvider {
            kind,
            awareness: Arc::new(AwarenessTable::new(ctx.identity.peer_id())),
            status,
            destroyed: AtomicUsize::new(0),
        });
        self.built.lock().push((kind, ctx.room.clone(), provider.clone()));
        provider
    }

    fn built(&self, kind: ProviderKind) -> Vec<Arc<FakeProvider>> {
        self.built
            .lock()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    fn rooms(&self, kind: ProviderKind) -> Vec<String> {
        self.built
            .lock()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, room, _)| room.clone())
            .collect()
    }
}

impl ProviderFactory for FakeFactory {
    fn relay(&self, url: &str, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError> {
        if self.fail_relay {
            return Err(SyncError::InvalidEndpoint {
                url: url.to_string(),
                reason: "refused".into(),
            });
        }
        Ok(self.build(ProviderKind::Relay, ctx))
    }

    fn mesh(&self, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError> {
        Ok(self.build(ProviderKind::Mesh, ctx))
    }
}

fn relay_config(room: &str) -> SessionConfig {
    SessionConfig {
        relay_url: Some("ws://relay.invalid:8080".into()),
        ..SessionConfig::new(room, Identity::anonymous())
    }
}

fn open(config: SessionConfig, engine: &Arc<OpSetEngine>, factory: &Arc<FakeFactory>) -> Session {
    Session::open(
        config,
        engine.clone() as Arc<dyn DocumentEngine>,
        factory.clone() as Arc<dyn ProviderFactory>,
    )
}

fn destroys(providers: &[Arc<FakeProvider>]) -> usize {
    providers.iter().map(|p| p.destroyed.load(Ordering::SeqCst)).sum()
}

// ─── Paused clock ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silent_relay_fails_over_after_timeout() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let session = open(relay_config("r"), &engine, &factory);

    sleep(Duration::from_millis(1_900)).await;
    assert_eq!(session.state(), FailoverState::RelayPending);
    assert_eq!(session.provider().map(|p| p.kind()), Some(ProviderKind::Relay));

    sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), FailoverState::FallbackMesh);
    assert_eq!(session.provider().map(|p| p.kind()), Some(ProviderKind::Mesh));

    let relays = factory.built(ProviderKind::Relay);
    assert_eq!(relays.len(), 1);
    assert_eq!(destroys(&relays), 1);
    assert_eq!(factory.built(ProviderKind::Mesh).len(), 1);

    session.close().await;
    assert_eq!(destroys(&relays), 1);
    assert_eq!(destroys(&factory.built(ProviderKind::Mesh)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_leaves_driver_idle() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let session = open(relay_config("r"), &engine, &factory);

    sleep(Duration::from_millis(2_100)).await;
    assert_eq!(session.state(), FailoverState::FallbackMesh);

    // A driver still re-firing the expired timer would keep the paused
    // clock from ever advancing this far.
    sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), FailoverState::FallbackMesh);
    assert_eq!(factory.built(ProviderKind::Mesh).len(), 1);
    session.close().await;
}

#[tokio::test]
async fn test_no_state_churn_after_fallback() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let config = SessionConfig {
        failover_timeout: Duration::from_millis(50),
        ..relay_config("r")
    };
    let session = open(config, &engine, &factory);

    let mut state = session.watch_state();
    let fell_back = timeout(Duration::from_secs(2), async {
        while *state.borrow_and_update() != FailoverState::FallbackMesh {
            state.changed().await.unwrap();
        }
    })
    .await;
    assert!(fell_back.is_ok());

    let mut notifications = 0;
    let _ = timeout(Duration::from_millis(200), async {
        while state.changed().await.is_ok() {
            notifications += 1;
        }
    })
    .await;
    assert_eq!(notifications, 0);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_update_before_timeout_keeps_relay() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let session = open(relay_config("r"), &engine, &factory);

    sleep(Duration::from_millis(1_900)).await;
    engine.insert_local(b"initial sync".to_vec());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(session.state(), FailoverState::RelayActive);
    assert_eq!(session.provider().map(|p| p.kind()), Some(ProviderKind::Relay));
    assert_eq!(destroys(&factory.built(ProviderKind::Relay)), 0);
    assert!(factory.built(ProviderKind::Mesh).is_empty());

    session.close().await;
    assert_eq!(destroys(&factory.built(ProviderKind::Relay)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_relay_goes_straight_to_mesh() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let session = open(SessionConfig::new("r", Identity::anonymous()), &engine, &factory);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state(), FailoverState::FallbackMesh);
    assert!(factory.built(ProviderKind::Relay).is_empty());
    assert_eq!(factory.built(ProviderKind::Mesh).len(), 1);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_relay_construction_failure_falls_back_at_once() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::failing_relay());
    let session = open(relay_config("r"), &engine, &factory);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state(), FailoverState::FallbackMesh);
    assert_eq!(factory.built(ProviderKind::Mesh).len(), 1);

    // The disarmed timer never attaches a second mesh.
    sleep(Duration::from_secs(5)).await;
    assert_eq!(factory.built(ProviderKind::Mesh).len(), 1);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_never_fires_after_close() {
    let engine = Arc::new(OpSetEngine::new());
    let factory = Arc::new(FakeFactory::default());
    let session = open(relay_config("r"), &engine, &factory);

    sleep(Duration::from_secs(1)).await;
    session.close().await;
    assert_eq!(session.state(), FailoverState::Closed);
    assert!(session.provider().is_none());

    sleep(Duration::from_secs(5)).await;
    assert!(factory.built(ProviderKind::Mesh).is_empty());
    assert_eq!(destroys(&factory.built(ProviderKind::Relay)), 1);

    // Closing twice is harmless.
    session.close().await;
    assert_eq!(destroys(&factory.built(ProviderKind::Relay)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_room_switch_replaces_session() {
    let factory = Arc::new(FakeFactory::default());
    let mut host = SessionHost::new(
        SessionConfig::new("", Identity::anonymous()),
        factory.clone() as Arc<dyn ProviderFactory>,
    );

    host.switch_room("north", Arc::new(OpSetEngine::new())).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(host.current().map(|s| s.room()), Some("north"));

    host.switch_room("south", Arc::new(OpSetEngine::new())).await;
    sleep(Duration::from_millis(10)).await;

    let meshes = factory.built(ProviderKind::Mesh);
    assert_eq!(factory.rooms(ProviderKind::Mesh), vec!["north".to_string(), "south".to_string()]);
    assert_eq!(meshes[0].destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(meshes[1].destroyed.load(Ordering::SeqCst), 0);

    host.close().await;
    assert_eq!(meshes[1].destroyed.load(Ordering::SeqCst), 1);
    assert!(host.current().is_none());
}

// ─── Real transports ────────────────────────────────────────────────

fn real_factory() -> Arc<dyn ProviderFactory> {
    Arc::new(DefaultProviderFactory::new(
        Arc::new(MemoryNetwork::new()),
        Arc::new(MemoryDiscoveryStore::new()),
    ))
}

async fn wait_state(session: &Session, want: FailoverState) -> bool {
    let mut state = session.watch_state();
    timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow_and_update() == want {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
        && session.state() == want
}

#[tokio::test]
async fn test_relay_with_content_stays_active() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(RelayServer::new(ServerConfig::default()));
    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });

    // A first client seeds the room.
    let seed = Arc::new(YrsEngine::new());
    seed.transact_local(|txn| {
        let text = txn.get_or_insert_text("notes");
        text.insert(txn, 0, "lighthouse");
    });
    let seeder = RelayProvider::connect(
        RelayClientConfig {
            url: url.clone(),
            ..RelayClientConfig::default()
        },
        ProviderContext::new("coast", seed as Arc<dyn DocumentEngine>, Identity::anonymous()),
    )
    .unwrap();
    let mut status = seeder.status();
    timeout(Duration::from_secs(2), status.wait_for(|s| *s == TransportStatus::Online))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let config = SessionConfig {
        relay_url: Some(url),
        ..SessionConfig::new("coast", Identity::anonymous())
    };
    let session = Session::open(config, Arc::new(YrsEngine::new()), real_factory());
    assert!(wait_state(&session, FailoverState::RelayActive).await);
    assert_eq!(session.provider().map(|p| p.kind()), Some(ProviderKind::Relay));

    session.close().await;
    seeder.destroy().await;
}

#[tokio::test]
async fn test_unreachable_relay_falls_back_to_mesh() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = SessionConfig {
        relay_url: Some(url),
        ..SessionConfig::new("coast", Identity::anonymous())
    };
    let session = Session::open(config, Arc::new(OpSetEngine::new()), real_factory());
    assert!(wait_state(&session, FailoverState::FallbackMesh).await);
    assert_eq!(session.provider().map(|p| p.kind()), Some(ProviderKind::Mesh));
    assert!(session.awareness().is_some());

    session.close().await;
    assert_eq!(session.state(), FailoverState::Closed);
}
