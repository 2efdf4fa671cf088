//! Ephemeral per-client presence table.
//!
//! Each client owns exactly one entry and is the only writer of it. Remote
//! entries are replaced wholesale, ordered by a per-client clock:
//!
//! ```text
//! incoming (id, clock, state)
//!    │
//!    ├─ id == local id ............ ignored
//!    ├─ clock >  known clock ...... accepted (added / updated / removed)
//!    ├─ clock == known, state=null  accepted if an entry is present (removal)
//!    └─ otherwise ................. ignored
//! ```
//!
//! Nothing here is persisted. Entries of departed clients are dropped by
//! [`AwarenessTable::prune_stale`] on the reading side.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::engine::Origin;
use crate::error::SyncError;

const EVENT_CAPACITY: usize = 1024;

/// Field map of one client.
pub type AwarenessState = Map<String, Value>;

/// Change notification emitted after local writes and accepted remote updates.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEvent {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub origin: Origin,
}

impl AwarenessEvent {
    fn new(origin: Origin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id touched by this event.
    pub fn changed(&self) -> Vec<String> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    client_id: String,
    clock: u64,
    /// JSON text of the field map, `None` for a removal.
    state: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    state: Option<AwarenessState>,
    clock: u64,
    updated_at: Instant,
}

/// Client id → field map, with the clocks needed to order replacements.
pub struct AwarenessTable {
    local_id: String,
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<AwarenessEvent>,
}

impl AwarenessTable {
    pub fn new(local_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local_id: local_id.into(),
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.events.subscribe()
    }

    // ─── Local writes ───────────────────────────────────────────────

    /// Mutate the local entry in a single write (one clock tick, one event).
    pub fn update_local<F>(&self, f: F)
    where
        F: FnOnce(&mut AwarenessState),
    {
        let event = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(self.local_id.clone()).or_insert(Entry {
                state: None,
                clock: 0,
                updated_at: Instant::now(),
            });
            let was_present = entry.state.is_some();
            let mut state = entry.state.take().unwrap_or_default();
            f(&mut state);
            entry.state = Some(state);
            entry.clock += 1;
            entry.updated_at = Instant::now();

            let mut event = AwarenessEvent::new(Origin::Local);
            if was_present {
                event.updated.push(self.local_id.clone());
            } else {
                event.added.push(self.local_id.clone());
            }
            event
        };
        let _ = self.events.send(event);
    }

    pub fn set_local_field(&self, key: &str, value: Value) {
        self.update_local(|state| {
            state.insert(key.to_string(), value);
        });
    }

    /// Remove the local entry. Peers learn about it through the next
    /// encoded update of the local id.
    pub fn clear_local(&self) {
        let event = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&self.local_id) {
                Some(entry) if entry.state.is_some() => {
                    entry.state = None;
                    entry.clock += 1;
                    entry.updated_at = Instant::now();
                    let mut event = AwarenessEvent::new(Origin::Local);
                    event.removed.push(self.local_id.clone());
                    Some(event)
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    // ─── Reads ──────────────────────────────────────────────────────

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.get(&self.local_id)
    }

    pub fn get(&self, client_id: &str) -> Option<AwarenessState> {
        self.entries
            .lock()
            .get(client_id)
            .and_then(|e| e.state.clone())
    }

    /// Every present state, local entry included.
    pub fn states(&self) -> HashMap<String, AwarenessState> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (id.clone(), s)))
            .collect()
    }

    /// Present states of other clients.
    pub fn remote_states(&self) -> HashMap<String, AwarenessState> {
        let mut states = self.states();
        states.remove(&self.local_id);
        states
    }

    pub fn clock(&self, client_id: &str) -> Option<u64> {
        self.entries.lock().get(client_id).map(|e| e.clock)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─── Wire ───────────────────────────────────────────────────────

    /// Encode the given clients, including removals.
    pub fn encode_update(&self, client_ids: &[String]) -> Result<Vec<u8>, SyncError> {
        let wire: Vec<WireEntry> = {
            let entries = self.entries.lock();
            client_ids
                .iter()
                .filter_map(|id| entries.get(id).map(|e| to_wire(id, e)))
                .collect::<Result<_, _>>()?
        };
        encode_wire(&wire)
    }

    /// Encode every present state.
    pub fn encode_full(&self) -> Result<Vec<u8>, SyncError> {
        self.encode_where(|_| true)
    }

    /// Encode every present state updated within `max_age`.
    pub fn encode_fresh(&self, max_age: Duration) -> Result<Vec<u8>, SyncError> {
        let now = Instant::now();
        self.encode_where(|e| now.saturating_duration_since(e.updated_at) <= max_age)
    }

    /// Number of present states updated within `max_age`.
    pub fn fresh_len(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.state.is_some())
            .filter(|e| now.saturating_duration_since(e.updated_at) <= max_age)
            .count()
    }

    fn encode_where(&self, keep: impl Fn(&Entry) -> bool) -> Result<Vec<u8>, SyncError> {
        let wire: Vec<WireEntry> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| e.state.is_some() && keep(e))
                .map(|(id, e)| to_wire(id, e))
                .collect::<Result<_, _>>()?
        };
        encode_wire(&wire)
    }

    /// Apply an encoded update from a remote source.
    ///
    /// Returns the resulting event, which is also broadcast to subscribers
    /// when anything was accepted.
    pub fn apply_update(&self, bytes: &[u8], origin: Origin) -> Result<AwarenessEvent, SyncError> {
        let (wire, _): (Vec<WireEntry>, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| SyncError::Protocol(format!("awareness: {e}")))?;

        let mut event = AwarenessEvent::new(origin);
        {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            for item in wire {
                if item.client_id == self.local_id {
                    continue;
                }
                let state = match item.state {
                    Some(json) => match serde_json::from_str::<AwarenessState>(&json) {
                        Ok(state) => Some(state),
                        Err(e) => {
                            log::debug!("Skipping awareness entry {}: {e}", item.client_id);
                            continue;
                        }
                    },
                    None => None,
                };

                let known = entries.get(&item.client_id);
                let had_state = known.is_some_and(|e| e.state.is_some());
                let accept = match known {
                    None => true,
                    Some(e) => item.clock > e.clock || (item.clock == e.clock && state.is_none() && had_state),
                };
                if !accept {
                    continue;
                }

                match (&state, had_state) {
                    (Some(_), false) => event.added.push(item.client_id.clone()),
                    (Some(_), true) => event.updated.push(item.client_id.clone()),
                    (None, true) => event.removed.push(item.client_id.clone()),
                    (None, false) => {}
                }
                entries.insert(
                    item.client_id,
                    Entry {
                        state,
                        clock: item.clock,
                        updated_at: now,
                    },
                );
            }
        }

        if !event.is_empty() {
            let _ = self.events.send(event.clone());
        }
        Ok(event)
    }

    /// Drop remote entries not refreshed within `max_age`.
    ///
    /// Purely local: no event is emitted and nothing is propagated, since
    /// every reader prunes on its own schedule.
    pub fn prune_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(id, e)| {
                *id != &self.local_id
                    && e.state.is_some()
                    && now.saturating_duration_since(e.updated_at) > max_age
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = entries.get_mut(id) {
                entry.state = None;
            }
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} stale awareness entries", stale.len());
        }
        stale
    }

    /// Forget remote entries, live or cleared, untouched for `max_age`.
    ///
    /// Unlike [`AwarenessTable::prune_stale`] this drops the clock as well,
    /// so a long-lived table does not keep one tombstone per departed client.
    pub fn compact(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|id, e| id == &self.local_id || now.saturating_duration_since(e.updated_at) <= max_age);
        before - entries.len()
    }

    /// Number of entries held, cleared ones included.
    pub fn tracked_len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn to_wire(id: &str, entry: &Entry) -> Result<WireEntry, SyncError> {
    let state = entry
        .state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok(WireEntry {
        client_id: id.to_string(),
        clock: entry.clock,
        state,
    })
}

fn encode_wire(wire: &[WireEntry]) -> Result<Vec<u8>, SyncError> {
    bincode::serde::encode_to_vec(wire, bincode::config::standard())
        .map_err(|e| SyncError::Protocol(format!("awareness: {e}")))
}
