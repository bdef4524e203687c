//! Protocol structures handled by the decryption engine
//!
//! These are already-decoded forms of the wire messages; the engine never
//! sees raw bytes from the transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

pub type StreamId = String;
pub type SessionId = String;
pub type EventId = String;

/// Identity keys of one device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserDevice {
    pub device_key: String,
    pub fallback_key: String,
}

/// Group-encrypted event content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub ciphertext: String,
    pub algorithm: String,
    pub sender_key: String,
    /// Hex session id; may be empty when only `session_id_bytes` is set
    pub session_id: String,
    pub session_id_bytes: Vec<u8>,
}

impl EncryptedData {
    /// Session id of the group session that encrypted this content
    pub fn session_id(&self) -> SessionId {
        if self.session_id.is_empty() {
            hex::encode(&self.session_id_bytes)
        } else {
            self.session_id.clone()
        }
    }
}

/// An event waiting to be decrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContentItem {
    pub stream_id: StreamId,
    pub event_id: EventId,
    /// Kind of encrypted payload (message, channel properties, ...)
    pub kind: String,
    pub encrypted_data: EncryptedData,
}

/// Group session keys delivered to our inbox, encrypted per recipient device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEncryptionSessions {
    pub stream_id: StreamId,
    /// Device key of the sender
    pub sender_key: String,
    pub session_ids: Vec<SessionId>,
    /// Recipient device key -> device-encrypted `SessionKeys` json
    pub ciphertexts: HashMap<String, String>,
    /// Empty means the default group encryption algorithm
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroupSessionItem {
    pub sessions: GroupEncryptionSessions,
    pub sender_id: String,
}

/// A request for group session keys, as published on a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySolicitationContent {
    pub device_key: String,
    pub fallback_key: String,
    pub is_new_device: bool,
    pub session_ids: Vec<SessionId>,
    /// Event that carried this solicitation
    pub src_event_id: EventId,
}

/// A member's outstanding solicitations, used to seed a stream's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySolicitationMember {
    pub user_id: String,
    pub user_address: Vec<u8>,
    pub solicitations: Vec<KeySolicitationContent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySolicitationItem {
    pub stream_id: StreamId,
    pub from_user_id: String,
    pub from_user_address: Vec<u8>,
    pub solicitation: KeySolicitationContent,
    pub respond_after: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionRetryItem {
    pub item: EncryptedContentItem,
    pub retry_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingKeysItem {
    pub stream_id: StreamId,
    pub wait_until: Instant,
}

/// Outgoing key request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySolicitationData {
    pub stream_id: StreamId,
    pub is_new_device: bool,
    pub missing_session_ids: Vec<SessionId>,
}

/// Outgoing record of which keys were shared with a requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFulfillmentData {
    pub stream_id: StreamId,
    pub user_address: Vec<u8>,
    pub device_key: String,
    /// Empty when answering a new device
    pub session_ids: Vec<SessionId>,
}

/// Outgoing key share for one algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSessionsData {
    pub stream_id: StreamId,
    pub item: KeySolicitationItem,
    pub sessions: Vec<GroupEncryptionSession>,
    pub algorithm: GroupEncryptionAlgorithmId,
}

/// Details passed to the decryption error hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionSessionError {
    pub missing_session: bool,
    pub kind: String,
    pub encrypted_data: EncryptedData,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntitlementCheckOptions {
    /// Trust local membership state instead of validating on chain
    pub skip_on_chain_validation: bool,
}

/// Group encryption algorithms understood by this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupEncryptionAlgorithmId {
    GroupEncryption,
    HybridGroupEncryption,
}

impl GroupEncryptionAlgorithmId {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupEncryptionAlgorithmId::GroupEncryption => "r.group-encryption.v1.aes-sha2",
            GroupEncryptionAlgorithmId::HybridGroupEncryption => "grpaes",
        }
    }

    /// Parse an algorithm id, treating an empty string as the default
    ///
    /// Returns `None` for unrecognized ids.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(GroupEncryptionAlgorithmId::GroupEncryption),
            "r.group-encryption.v1.aes-sha2" => Some(GroupEncryptionAlgorithmId::GroupEncryption),
            "grpaes" => Some(GroupEncryptionAlgorithmId::HybridGroupEncryption),
            _ => None,
        }
    }
}

impl fmt::Display for GroupEncryptionAlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exported or importable group session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEncryptionSession {
    pub stream_id: StreamId,
    pub session_id: SessionId,
    pub session_key: String,
    pub algorithm: GroupEncryptionAlgorithmId,
}

/// Plaintext carried inside a device-encrypted session delivery
///
/// `keys[i]` belongs to `GroupEncryptionSessions::session_ids[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    pub keys: Vec<String>,
}

pub fn make_session_keys(sessions: &[GroupEncryptionSession]) -> SessionKeys {
    SessionKeys { keys: sessions.iter().map(|s| s.session_key.clone()).collect() }
}

/// Result of source-event validation for a key solicitation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventValidity {
    Valid,
    Invalid { reason: String },
}
