//! Document engine contract.
//!
//! The transport never interprets document bytes. It only needs to:
//! - take a full-state snapshot,
//! - apply a binary update (idempotent, commutative),
//! - observe updates the engine produced, tagged with where they came from.
//!
//! ```text
//!  local edit ──► engine ──► DocUpdate { origin: Local }   ──► relay / mesh
//!  relay frame ─► engine ──► DocUpdate { origin: Relay }   ──► mesh only
//!  peer link ───► engine ──► DocUpdate { origin: Peer(id) } ─► other peers
//! ```
//!
//! [`YrsEngine`] wraps a yrs document. [`OpSetEngine`] is a grow-only set of
//! opaque operations, handy wherever a real CRDT is not needed.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::error::SyncError;

const EVENT_CAPACITY: usize = 1024;

/// Where an update entered this replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Relay,
    Peer(String),
}

/// An update the engine integrated, as bytes other replicas can apply.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub update: Arc<Vec<u8>>,
    pub origin: Origin,
}

/// Replicated document seen from the transport.
pub trait DocumentEngine: Send + Sync {
    /// Apply a remote update. Returns `true` if local state changed, in which
    /// case a [`DocUpdate`] is emitted to subscribers.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<bool, SyncError>;

    /// Full state as a single update.
    fn snapshot(&self) -> Vec<u8>;

    /// Receive every update integrated from now on.
    fn subscribe(&self) -> broadcast::Receiver<DocUpdate>;
}

// ─── yrs ────────────────────────────────────────────────────────────

/// yrs-backed document.
pub struct YrsEngine {
    doc: yrs::Doc,
    // Serializes transactions so before/after state vectors are consistent.
    write_lock: Mutex<()>,
    events: broadcast::Sender<DocUpdate>,
}

impl YrsEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            doc: yrs::Doc::new(),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Underlying document, for reads.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    /// Run a local edit and publish the resulting diff with `Origin::Local`.
    pub fn transact_local<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut yrs::TransactionMut<'_>) -> R,
    {
        let _guard = self.write_lock.lock();
        let before = self.doc.transact().state_vector();
        let result = {
            let mut txn = self.doc.transact_mut();
            f(&mut txn)
        };
        let diff = self.doc.transact().encode_diff_v1(&before);
        let _ = self.events.send(DocUpdate {
            update: Arc::new(diff),
            origin: Origin::Local,
        });
        result
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentEngine for YrsEngine {
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<bool, SyncError> {
        let decoded = Update::decode_v1(update).map_err(|e| SyncError::Engine(e.to_string()))?;

        let _guard = self.write_lock.lock();
        let (before_sv, before_state) = {
            let txn = self.doc.transact();
            (
                txn.state_vector(),
                txn.encode_state_as_update_v1(&StateVector::default()),
            )
        };
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| SyncError::Engine(e.to_string()))?;
        }

        let txn = self.doc.transact();
        let changed = txn.state_vector() != before_sv
            // Deletions leave the state vector untouched.
            || txn.encode_state_as_update_v1(&StateVector::default()) != before_state;
        if changed {
            let diff = txn.encode_diff_v1(&before_sv);
            drop(txn);
            let _ = self.events.send(DocUpdate {
                update: Arc::new(diff),
                origin,
            });
        }
        Ok(changed)
    }

    fn snapshot(&self) -> Vec<u8> {
        let _guard = self.write_lock.lock();
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn subscribe(&self) -> broadcast::Receiver<DocUpdate> {
        self.events.subscribe()
    }
}

// ─── Op set ─────────────────────────────────────────────────────────

/// Grow-only set of opaque operations.
///
/// An update is a bincode-encoded `Vec<Vec<u8>>`; applying it inserts every
/// op, so application is idempotent and commutative.
pub struct OpSetEngine {
    ops: Mutex<BTreeSet<Vec<u8>>>,
    events: broadcast::Sender<DocUpdate>,
}

impl OpSetEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ops: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    /// Insert a local op. Returns `false` if it was already present.
    pub fn insert_local(&self, op: impl Into<Vec<u8>>) -> bool {
        let op = op.into();
        let inserted = self.ops.lock().insert(op.clone());
        if inserted {
            if let Ok(update) = encode_ops(&[op]) {
                let _ = self.events.send(DocUpdate {
                    update: Arc::new(update),
                    origin: Origin::Local,
                });
            }
        }
        inserted
    }

    pub fn ops(&self) -> Vec<Vec<u8>> {
        self.ops.lock().iter().cloned().collect()
    }

    pub fn contains(&self, op: &[u8]) -> bool {
        self.ops.lock().contains(op)
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }
}

impl Default for OpSetEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a batch of ops as an [`OpSetEngine`] update.
pub fn encode_ops(ops: &[Vec<u8>]) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(ops, bincode::config::standard())
        .map_err(|e| SyncError::Engine(e.to_string()))
}

fn decode_ops(bytes: &[u8]) -> Result<Vec<Vec<u8>>, SyncError> {
    let (ops, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Engine(e.to_string()))?;
    Ok(ops)
}

impl DocumentEngine for OpSetEngine {
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<bool, SyncError> {
        let incoming = decode_ops(update)?;
        let fresh: Vec<Vec<u8>> = {
            let mut ops = self.ops.lock();
            incoming.into_iter().filter(|op| ops.insert(op.clone())).collect()
        };
        if fresh.is_empty() {
            return Ok(false);
        }
        let update = encode_ops(&fresh)?;
        let _ = self.events.send(DocUpdate {
            update: Arc::new(update),
            origin,
        });
        Ok(true)
    }

    fn snapshot(&self) -> Vec<u8> {
        encode_ops(&self.ops()).unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<DocUpdate> {
        self.events.subscribe()
    }
}
