//! # mappu-sync — Real-time sync transports for shared map boards
//!
//! Moves CRDT updates and presence between clients of a room, through a
//! relay server when one is reachable and over a direct peer mesh when not.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!                  │   Session    │  failover: relay first, mesh after 2s
//!                  └──────┬───────┘
//!             ┌───────────┴───────────┐
//!             ▼                       ▼
//!   ┌──────────────────┐    ┌──────────────────┐
//!   │  RelayProvider   │    │   MeshManager    │
//!   │  (WebSocket)     │    │  (peer links)    │
//!   └────────┬─────────┘    └────────┬─────────┘
//!            │ JSON frames           │ bincode messages
//!            ▼                       ▼
//!   ┌──────────────────┐    ┌──────────────────┐
//!   │   RelayServer    │    │  PeerNetwork +   │
//!   │  rooms, TTL      │    │  DiscoveryStore  │
//!   └──────────────────┘    └──────────────────┘
//! ```
//!
//! Both providers bridge a [`DocumentEngine`] and an [`AwarenessTable`].
//!
//! ## Modules
//!
//! - [`protocol`] — Relay frames and mesh messages
//! - [`engine`] — Document engine contract, yrs and op-set engines
//! - [`awareness`] — Ephemeral per-client state with clocks
//! - [`relay`] — Relay server, room registry, relay client provider
//! - [`mesh`] — Peer mesh manager, discovery, peer network seam
//! - [`session`] — Failover controller and session host
//! - [`presence`] — Cursor publishing and remote cursor reading

pub mod awareness;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod retry;
pub mod session;

// Re-exports for convenience
pub use awareness::{AwarenessEvent, AwarenessState, AwarenessTable};
pub use engine::{DocUpdate, DocumentEngine, OpSetEngine, Origin, YrsEngine};
pub use error::{ErrorClass, SyncError};
pub use identity::Identity;
pub use mesh::{
    DiscoveryStore, FileDiscoveryStore, MemoryDiscoveryStore, MemoryNetwork, MeshConfig,
    MeshManager, PeerNetwork,
};
pub use presence::{CursorColor, LngLat, PointerKind, PresencePublisher, ScreenPoint, Viewport};
pub use protocol::{MeshMessage, RelayFrame};
pub use provider::{
    DefaultProviderFactory, Provider, ProviderContext, ProviderFactory, ProviderKind,
    TransportStatus,
};
pub use relay::{RelayClientConfig, RelayProvider, RelayServer, ServerConfig, ServerStats};
pub use retry::{RetryDecision, RetryPolicy};
pub use session::{FailoverController, FailoverState, Session, SessionConfig, SessionHost};

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
