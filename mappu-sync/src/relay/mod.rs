//! Relay transport: the room server and the client provider that talks to it.

pub mod client;
pub mod room;
pub mod server;

pub use client::{validate_endpoint, RelayClientConfig, RelayProvider};
pub use room::{yrs_engine_factory, ConnectionId, EngineFactory, RoomRegistry, RoomStats};
pub use server::{RelayServer, ServerConfig, ServerStats};
