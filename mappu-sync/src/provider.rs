//! The seam between a session and its transports.
//!
//! A provider owns one transport (relay WebSocket or peer mesh), bridges it
//! to the document engine, and exposes its awareness table. Exactly one
//! provider is attached to an open session at any time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::awareness::AwarenessTable;
use crate::engine::DocumentEngine;
use crate::error::SyncError;
use crate::identity::Identity;
use crate::mesh::{DiscoveryStore, MeshConfig, MeshManager, PeerNetwork};
use crate::relay::{RelayClientConfig, RelayProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Relay,
    Mesh,
}

/// Connection state of a provider's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Connecting,
    Online,
    Reconnecting { attempt: u32 },
    /// Gave up; the message describes the last error.
    Failed(String),
    Closed,
}

/// Everything a provider needs from its session.
#[derive(Clone)]
pub struct ProviderContext {
    pub room: String,
    pub engine: Arc<dyn DocumentEngine>,
    pub identity: Identity,
}

impl ProviderContext {
    pub fn new(room: impl Into<String>, engine: Arc<dyn DocumentEngine>, identity: Identity) -> Self {
        Self {
            room: room.into(),
            engine,
            identity,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn awareness(&self) -> Arc<AwarenessTable>;

    fn status(&self) -> watch::Receiver<TransportStatus>;

    /// Clear the local awareness entry, tell the transport, close it.
    /// Idempotent.
    async fn destroy(&self);
}

/// Builds providers for a session.
pub trait ProviderFactory: Send + Sync {
    /// Construct a relay provider. Fails synchronously on a bad endpoint.
    fn relay(&self, url: &str, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError>;

    fn mesh(&self, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError>;
}

/// Real relay client plus a mesh over the given network and directory.
pub struct DefaultProviderFactory {
    pub relay: RelayClientConfig,
    pub mesh: MeshConfig,
    pub network: Arc<dyn PeerNetwork>,
    pub store: Arc<dyn DiscoveryStore>,
}

impl DefaultProviderFactory {
    pub fn new(network: Arc<dyn PeerNetwork>, store: Arc<dyn DiscoveryStore>) -> Self {
        Self {
            relay: RelayClientConfig::default(),
            mesh: MeshConfig::default(),
            network,
            store,
        }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn relay(&self, url: &str, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError> {
        let config = RelayClientConfig {
            url: url.to_string(),
            ..self.relay.clone()
        };
        let provider = RelayProvider::connect(config, ctx)?;
        Ok(Arc::new(provider))
    }

    fn mesh(&self, ctx: ProviderContext) -> Result<Arc<dyn Provider>, SyncError> {
        let manager = MeshManager::start(
            self.mesh.clone(),
            ctx,
            self.network.clone(),
            self.store.clone(),
        );
        Ok(Arc::new(manager))
    }
}
