//! Recording delegate
//!
//! Logs every call the engine makes, decrypts with a [`MemoryCrypto`] and
//! pushes outgoing key exchange messages to an outbox for routing to peers.

use super::mock_crypto::MemoryCrypto;
use crate::decryption::{
    make_session_keys, AddEventError, DecryptionDelegate, DecryptionResult, DecryptionSessionError,
    EncryptedContentItem, EncryptedData, EntitlementCheckOptions, EventId, EventValidity,
    GroupEncryptionAlgorithmId, GroupEncryptionSessions, GroupSessionsData, KeyFulfillmentData,
    KeyFulfillmentResponse, KeySolicitationContent, KeySolicitationData, SessionId, StreamId,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateCall {
    UploadDeviceKeys,
    DownloadNewMessages,
    AckNewGroupSession { stream_id: StreamId },
    DecryptAttempt { stream_id: StreamId, event_id: EventId },
    DecryptionError { event_id: EventId, missing_session: bool },
    KeySolicitation(KeySolicitationData),
    KeyFulfillment(KeyFulfillmentData),
    ShareGroupSessions {
        stream_id: StreamId,
        algorithm: GroupEncryptionAlgorithmId,
        session_ids: Vec<SessionId>,
    },
}

/// Outgoing message addressed to other devices
#[derive(Debug, Clone)]
pub enum Envelope {
    GroupSessions { sessions: GroupEncryptionSessions, sender_id: String },
    Solicitation { stream_id: StreamId, from_user_id: String, solicitation: KeySolicitationContent },
}

/// Blocks the next decrypt call until released
#[derive(Clone, Default)]
pub struct DecryptGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct RecordingDelegate {
    user_id: String,
    crypto: Arc<MemoryCrypto>,
    outbox: mpsc::UnboundedSender<Envelope>,
    streams: Mutex<HashSet<StreamId>>,
    entitled: AtomicBool,
    paused: AtomicBool,
    inbox_up_to_date: AtomicBool,
    calls: Mutex<Vec<DelegateCall>>,
    decrypted: Mutex<Vec<(EventId, String)>>,
    published: Mutex<HashMap<StreamId, Vec<KeySolicitationContent>>>,
    fulfillment_error: Mutex<Option<AddEventError>>,
    decrypt_gate: Mutex<Option<DecryptGate>>,
    invalid_events: Mutex<HashSet<EventId>>,
    respond_delay: Mutex<Duration>,
    solicitation_seq: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl RecordingDelegate {
    pub fn new(
        user_id: &str,
        crypto: Arc<MemoryCrypto>,
        streams: &[&str],
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            crypto,
            outbox,
            streams: Mutex::new(streams.iter().map(|s| s.to_string()).collect()),
            entitled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            inbox_up_to_date: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            decrypted: Mutex::new(Vec::new()),
            published: Mutex::new(HashMap::new()),
            fulfillment_error: Mutex::new(None),
            decrypt_gate: Mutex::new(None),
            invalid_events: Mutex::new(HashSet::new()),
            respond_delay: Mutex::new(Duration::ZERO),
            solicitation_seq: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<DelegateCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&DelegateCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn decrypted(&self) -> Vec<(EventId, String)> {
        self.decrypted.lock().unwrap().clone()
    }

    pub fn set_entitled(&self, entitled: bool) {
        self.entitled.store(entitled, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn set_inbox_up_to_date(&self, up_to_date: bool) {
        self.inbox_up_to_date.store(up_to_date, Ordering::SeqCst);
    }

    pub fn set_fulfillment_error(&self, error: Option<AddEventError>) {
        *self.fulfillment_error.lock().unwrap() = error;
    }

    pub fn set_respond_delay(&self, delay: Duration) {
        *self.respond_delay.lock().unwrap() = delay;
    }

    pub fn mark_invalid_event(&self, event_id: &str) {
        self.invalid_events.lock().unwrap().insert(event_id.to_string());
    }

    pub fn gate_next_decrypt(&self) -> DecryptGate {
        let gate = DecryptGate::default();
        *self.decrypt_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn publish_solicitation(&self, stream_id: &str, solicitation: KeySolicitationContent) {
        let mut published = self.published.lock().unwrap();
        let entries = published.entry(stream_id.to_string()).or_default();
        entries.retain(|s| s.device_key != solicitation.device_key);
        entries.push(solicitation);
    }

    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    fn record(&self, call: DelegateCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl DecryptionDelegate for RecordingDelegate {
    async fn ack_new_group_session(&self, session: &GroupEncryptionSessions) -> DecryptionResult<()> {
        self.record(DelegateCall::AckNewGroupSession { stream_id: session.stream_id.clone() });
        Ok(())
    }

    async fn decrypt_group_event(
        &self,
        stream_id: &str,
        event_id: &str,
        _kind: &str,
        encrypted_data: &EncryptedData,
    ) -> DecryptionResult<()> {
        self.record(DelegateCall::DecryptAttempt {
            stream_id: stream_id.to_string(),
            event_id: event_id.to_string(),
        });

        let gate = self.decrypt_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let plaintext = self.crypto.decrypt_group_content(stream_id, encrypted_data)?;
        self.decrypted.lock().unwrap().push((event_id.to_string(), plaintext));
        Ok(())
    }

    async fn download_new_messages(&self) -> DecryptionResult<()> {
        self.record(DelegateCall::DownloadNewMessages);
        Ok(())
    }

    fn get_key_solicitations(&self, stream_id: &str) -> Vec<KeySolicitationContent> {
        self.published.lock().unwrap().get(stream_id).cloned().unwrap_or_default()
    }

    fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.lock().unwrap().contains(stream_id)
    }

    async fn is_user_entitled_to_key_exchange(
        &self,
        _stream_id: &str,
        _user_id: &str,
        _opts: EntitlementCheckOptions,
    ) -> DecryptionResult<bool> {
        Ok(self.entitled.load(Ordering::SeqCst))
    }

    fn is_user_inbox_stream_up_to_date(&self, _up_to_date_streams: &HashSet<StreamId>) -> bool {
        self.inbox_up_to_date.load(Ordering::SeqCst)
    }

    fn on_decryption_error(&self, item: &EncryptedContentItem, err: DecryptionSessionError) {
        self.record(DelegateCall::DecryptionError {
            event_id: item.event_id.clone(),
            missing_session: err.missing_session,
        });
    }

    async fn send_key_solicitation(&self, args: KeySolicitationData) -> DecryptionResult<()> {
        self.record(DelegateCall::KeySolicitation(args.clone()));
        let device = self.crypto.device();
        let seq = self.solicitation_seq.fetch_add(1, Ordering::SeqCst);
        let solicitation = KeySolicitationContent {
            device_key: device.device_key,
            fallback_key: device.fallback_key,
            is_new_device: args.is_new_device,
            session_ids: args.missing_session_ids,
            src_event_id: format!("{}-solicitation-{}", self.user_id, seq),
        };
        self.publish_solicitation(&args.stream_id, solicitation.clone());
        let _ = self.outbox.send(Envelope::Solicitation {
            stream_id: args.stream_id,
            from_user_id: self.user_id.clone(),
            solicitation,
        });
        Ok(())
    }

    async fn send_key_fulfillment(&self, args: KeyFulfillmentData) -> DecryptionResult<KeyFulfillmentResponse> {
        self.record(DelegateCall::KeyFulfillment(args));
        Ok(KeyFulfillmentResponse { error: self.fulfillment_error.lock().unwrap().clone() })
    }

    async fn encrypt_and_share_group_sessions(&self, args: GroupSessionsData) -> DecryptionResult<()> {
        let session_ids: Vec<SessionId> = args.sessions.iter().map(|s| s.session_id.clone()).collect();
        self.record(DelegateCall::ShareGroupSessions {
            stream_id: args.stream_id.clone(),
            algorithm: args.algorithm,
            session_ids: session_ids.clone(),
        });

        let payload = serde_json::to_string(&make_session_keys(&args.sessions))?;
        let recipient = args.item.solicitation.device_key;
        let ciphertext = self.crypto.encrypt_for_device(&recipient, &payload);
        let sessions = GroupEncryptionSessions {
            stream_id: args.stream_id,
            sender_key: self.crypto.device().device_key,
            session_ids,
            ciphertexts: HashMap::from([(recipient, ciphertext)]),
            algorithm: args.algorithm.as_str().to_string(),
        };
        let _ = self.outbox.send(Envelope::GroupSessions { sessions, sender_id: self.user_id.clone() });
        Ok(())
    }

    async fn upload_device_keys(&self) -> DecryptionResult<()> {
        self.record(DelegateCall::UploadDeviceKeys);
        Ok(())
    }

    fn should_pause_ticking(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_valid_event(&self, _stream_id: &str, event_id: &str) -> EventValidity {
        if self.invalid_events.lock().unwrap().contains(event_id) {
            EventValidity::Invalid { reason: "event not found".to_string() }
        } else {
            EventValidity::Valid
        }
    }

    fn respond_delay_for_key_solicitation(&self, _stream_id: &str, _user_id: &str) -> Duration {
        *self.respond_delay.lock().unwrap()
    }

    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}
