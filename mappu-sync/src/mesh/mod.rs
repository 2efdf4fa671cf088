//! Serverless sync: a direct peer mesh with room-scoped discovery.

pub mod discovery;
pub mod manager;
pub mod network;

pub use discovery::{
    DirectoryMap, DirectoryRecord, DiscoveryStore, FileDiscoveryStore, KnownPeers,
    MemoryDiscoveryStore, PeerDirectory, PeerDirectoryEntry,
};
pub use manager::{MeshConfig, MeshManager};
pub use network::{MemoryNetwork, PeerLink, PeerNetwork};
