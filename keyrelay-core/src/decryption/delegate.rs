//! Collaborator traits
//!
//! The engine owns scheduling and key exchange logic only. Everything that
//! touches cryptographic state, storage, the network or entitlements is
//! reached through these traits.

use super::errors::{DecryptionResult, KeyFulfillmentResponse};
use super::types::{
    DecryptionSessionError, EncryptedContentItem, EncryptedData, EntitlementCheckOptions,
    EventValidity, GroupEncryptionAlgorithmId, GroupEncryptionSession, GroupEncryptionSessions,
    GroupSessionsData, KeyFulfillmentData, KeySolicitationContent, KeySolicitationData,
    SessionId, StreamId,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

/// Group session store and device-to-device channel
///
/// Implementations serialize their own internal state; the engine never
/// calls them concurrently but may interleave calls with other users of the
/// same store.
#[async_trait]
pub trait GroupEncryptionCrypto: Send + Sync + 'static {
    /// Decrypt a payload that another device encrypted for our device
    async fn decrypt_with_device_key(
        &self,
        ciphertext: &str,
        sender_device_key: &str,
    ) -> DecryptionResult<String>;

    async fn has_session_key(
        &self,
        stream_id: &str,
        session_id: &str,
        algorithm: GroupEncryptionAlgorithmId,
    ) -> DecryptionResult<bool>;

    async fn import_session_keys(
        &self,
        stream_id: &str,
        sessions: Vec<GroupEncryptionSession>,
    ) -> DecryptionResult<()>;

    /// Ids of every session we hold for a stream
    async fn get_group_session_ids(&self, stream_id: &str) -> DecryptionResult<Vec<SessionId>>;

    /// Export a session for sharing; `None` if it cannot be exported
    async fn export_group_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> DecryptionResult<Option<GroupEncryptionSession>>;
}

/// Transport, store and entitlement hooks supplied by the client
#[async_trait]
pub trait DecryptionDelegate: Send + Sync + 'static {
    /// Acknowledge that all queued inbox session deliveries were processed
    async fn ack_new_group_session(&self, session: &GroupEncryptionSessions)
        -> DecryptionResult<()>;

    /// Decrypt an event and persist its cleartext
    ///
    /// Must fail with an error for which
    /// [`DecryptionError::is_session_not_found`](super::DecryptionError::is_session_not_found)
    /// holds when the group session is missing.
    async fn decrypt_group_event(
        &self,
        stream_id: &str,
        event_id: &str,
        kind: &str,
        encrypted_data: &EncryptedData,
    ) -> DecryptionResult<()>;

    /// Fetch inbox messages that arrived while offline
    async fn download_new_messages(&self) -> DecryptionResult<()>;

    /// Solicitations currently published on a stream
    fn get_key_solicitations(&self, stream_id: &str) -> Vec<KeySolicitationContent>;

    fn has_stream(&self, stream_id: &str) -> bool;

    async fn is_user_entitled_to_key_exchange(
        &self,
        stream_id: &str,
        user_id: &str,
        opts: EntitlementCheckOptions,
    ) -> DecryptionResult<bool>;

    fn is_user_inbox_stream_up_to_date(&self, up_to_date_streams: &HashSet<StreamId>) -> bool;

    /// Observability hook, called for every failed decryption attempt
    fn on_decryption_error(&self, item: &EncryptedContentItem, err: DecryptionSessionError);

    async fn send_key_solicitation(&self, args: KeySolicitationData) -> DecryptionResult<()>;

    async fn send_key_fulfillment(
        &self,
        args: KeyFulfillmentData,
    ) -> DecryptionResult<KeyFulfillmentResponse>;

    /// Encrypt sessions for the requesting device and send them to its inbox
    async fn encrypt_and_share_group_sessions(&self, args: GroupSessionsData)
        -> DecryptionResult<()>;

    async fn upload_device_keys(&self) -> DecryptionResult<()>;

    /// Backpressure; checked before every tick
    fn should_pause_ticking(&self) -> bool;

    /// Check the event that carried a key solicitation
    fn is_valid_event(&self, _stream_id: &str, _event_id: &str) -> EventValidity {
        EventValidity::Valid
    }

    /// Delay before answering a solicitation from `user_id`
    fn respond_delay_for_key_solicitation(&self, _stream_id: &str, _user_id: &str) -> Duration {
        Duration::ZERO
    }

    fn on_start(&self) {}

    async fn on_stop(&self) {}
}
