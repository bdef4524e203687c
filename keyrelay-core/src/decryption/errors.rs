//! Error types for the decryption engine

use super::types::{SessionId, StreamId};
use thiserror::Error;

/// Result type for decryption operations
pub type DecryptionResult<T> = Result<T, DecryptionError>;

/// Errors raised by the engine and its collaborators
#[derive(Error, Debug)]
pub enum DecryptionError {
    /// No group session for the event; retried and eventually requested from peers
    #[error("session not found: stream {stream_id} session {session_id}")]
    SessionNotFound { stream_id: StreamId, session_id: SessionId },

    /// `start()` was called on an instance that was already started
    #[error("start() called twice, create a new instance instead")]
    AlreadyStarted,

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// A peer sent data that breaks the key exchange protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Entitlement error: {0}")]
    Entitlement(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DecryptionError {
    /// Whether this failure means the decryption key has not arrived yet
    pub fn is_session_not_found(&self) -> bool {
        match self {
            DecryptionError::SessionNotFound { .. } => true,
            DecryptionError::Crypto(msg) => msg.to_lowercase().contains("session not found"),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DecryptionError {
    fn from(e: serde_json::Error) -> Self {
        DecryptionError::Serialization(e.to_string())
    }
}

/// Error returned by the node when adding an event to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddEventError {
    pub code: String,
    pub msg: String,
}

impl AddEventError {
    pub fn new(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { code: code.into(), msg: msg.into() }
    }

    /// Another device already published the same event
    pub fn is_duplicate_event(&self) -> bool {
        self.code == "DUPLICATE_EVENT" || self.msg.contains("DUPLICATE_EVENT")
    }
}

/// Response to a key fulfillment send
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFulfillmentResponse {
    pub error: Option<AddEventError>,
}
