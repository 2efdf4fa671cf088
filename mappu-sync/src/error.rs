//! Error taxonomy for the sync transport.
//!
//! Every failure is classified as transient (worth retrying after a delay)
//! or permanent (surfaced to the session owner). See [`crate::retry`] for
//! the single place that turns a classification into a backoff decision.

use tokio_tungstenite::tungstenite;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccups, signaling outages, timeouts.
    Transient,
    /// Bad endpoints, rejected payloads, unknown peers.
    Permanent,
}

/// Errors produced by the relay, mesh and session layers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("signaling service error: {0}")]
    Signaling(String),

    #[error("peer {0} is unavailable")]
    PeerUnavailable(String),

    #[error("invalid relay endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("document engine rejected update: {0}")]
    Engine(String),

    #[error("operation timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),
}

impl SyncError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::ConnectionClosed
            | SyncError::Transport(_)
            | SyncError::Signaling(_)
            | SyncError::Timeout
            | SyncError::Io(_) => ErrorClass::Transient,
            SyncError::Protocol(_)
            | SyncError::PeerUnavailable(_)
            | SyncError::InvalidEndpoint { .. }
            | SyncError::Engine(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<tungstenite::Error> for SyncError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                SyncError::ConnectionClosed
            }
            tungstenite::Error::Url(reason) => SyncError::InvalidEndpoint {
                url: String::new(),
                reason: reason.to_string(),
            },
            other => SyncError::Transport(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
