//! Work item handlers
//!
//! One handler per queue. Each runs inside a single tick; none of them hold
//! the state lock across an await.

use super::delegate::{DecryptionDelegate, GroupEncryptionCrypto};
use super::errors::{DecryptionError, DecryptionResult};
use super::extensions::Engine;
use super::queues::{PriorityTask, WorkItem};
use super::types::{
    DecryptionRetryItem, DecryptionSessionError, EncryptedContentItem, EntitlementCheckOptions,
    EventValidity, GroupEncryptionAlgorithmId, GroupEncryptionSession, GroupSessionsData,
    KeyFulfillmentData, KeySolicitationData, KeySolicitationItem, MissingKeysItem,
    NewGroupSessionItem, SessionKeys,
};
use crate::metrics;
use std::collections::{BTreeMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl<D: DecryptionDelegate, C: GroupEncryptionCrypto> Engine<D, C> {
    pub(crate) async fn process(&self, work: WorkItem) -> DecryptionResult<()> {
        match work {
            WorkItem::Priority(task) => self.run_priority_task(task).await,
            WorkItem::NewGroupSession(item) => self.process_new_group_session(item).await,
            WorkItem::EncryptedContent(item) => self.process_encrypted_content(item).await,
            WorkItem::DecryptionRetry(item) => self.process_decryption_retry(item).await,
            WorkItem::MissingKeys(item) => self.process_missing_keys(item).await,
            WorkItem::KeySolicitation(item) => self.process_key_solicitation(item).await,
        }
    }

    async fn run_priority_task(&self, task: PriorityTask) -> DecryptionResult<()> {
        debug!(task = ?task, "priority task");
        match task {
            PriorityTask::UploadDeviceKeys => self.delegate.upload_device_keys().await,
            PriorityTask::DownloadNewMessages => self.delegate.download_new_messages().await,
        }
    }

    /// Import group sessions another device shared with us
    ///
    /// Deliveries not addressed to us, with an unknown algorithm or carrying
    /// only keys we already hold are skipped without an ack. Once an import
    /// has been attempted and no deliveries remain queued, the inbox is acked.
    async fn process_new_group_session(&self, item: NewGroupSessionItem) -> DecryptionResult<()> {
        let sessions = &item.sessions;
        let stream_id = sessions.stream_id.as_str();

        let Some(ciphertext) = sessions.ciphertexts.get(&self.user_device.device_key) else {
            debug!(stream_id, "skipping, no ciphertext for this device");
            return Ok(());
        };
        debug!(stream_id, sender_id = %item.sender_id, "processNewGroupSession");

        let Some(algorithm) = GroupEncryptionAlgorithmId::parse(&sessions.algorithm) else {
            error!(stream_id, algorithm = %sessions.algorithm, "skipping, unknown group encryption algorithm");
            return Ok(());
        };

        let mut needed = Vec::new();
        for (index, session_id) in sessions.session_ids.iter().enumerate() {
            if !self.crypto.has_session_key(stream_id, session_id, algorithm).await? {
                needed.push(index);
            }
        }
        if needed.is_empty() {
            debug!(stream_id, "skipping, already have all keys");
            return Ok(());
        }

        let cleartext = self.crypto.decrypt_with_device_key(ciphertext, &sessions.sender_key).await?;
        let session_keys: SessionKeys = serde_json::from_str(&cleartext)?;

        if session_keys.keys.len() != sessions.session_ids.len() {
            return Err(DecryptionError::ProtocolViolation(format!(
                "expected {} session keys, got {}",
                sessions.session_ids.len(),
                session_keys.keys.len()
            )));
        }

        let imports: Vec<GroupEncryptionSession> = needed
            .into_iter()
            .map(|index| GroupEncryptionSession {
                stream_id: stream_id.to_string(),
                session_id: sessions.session_ids[index].clone(),
                session_key: session_keys.keys[index].clone(),
                algorithm,
            })
            .collect();
        self.import_sessions(stream_id, imports).await;

        let drained = self.state().queues.new_group_session.is_empty();
        if drained {
            self.delegate.ack_new_group_session(sessions).await?;
        }
        Ok(())
    }

    /// Import sessions and move events waiting on them back to the content queue
    async fn import_sessions(&self, stream_id: &str, imports: Vec<GroupEncryptionSession>) {
        let imported_ids: Vec<String> = imports.iter().map(|s| s.session_id.clone()).collect();

        if let Err(e) = self.crypto.import_session_keys(stream_id, imports).await {
            // Failed items stay in the failure index until another delivery arrives
            error!(stream_id, error = %e, "failed to import group sessions");
            return;
        }
        metrics::record_counter(metrics::SESSIONS_IMPORTED, imported_ids.len() as u64);
        info!(stream_id, count = imported_ids.len(), "imported group sessions");

        let mut state = self.state();
        for session_id in &imported_ids {
            let waiting = state.failures.take_session(stream_id, session_id);
            if !waiting.is_empty() {
                debug!(stream_id, session_id = %session_id, count = waiting.len(), "requeueing failed events");
            }
            state.queues.encrypted_content.extend(waiting);
        }
    }

    /// First decryption attempt; failures are always retried once later
    async fn process_encrypted_content(&self, item: EncryptedContentItem) -> DecryptionResult<()> {
        match self.decrypt(&item).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_session_not_found() {
                    info!(
                        stream_id = %item.stream_id,
                        event_id = %item.event_id,
                        error = %e,
                        "failed to decrypt event, will retry"
                    );
                }
                let retry_at = Instant::now() + self.config.decryption_retry_delay;
                self.state().queues.decryption_retries.insert(DecryptionRetryItem { item, retry_at });
                Ok(())
            }
        }
    }

    /// Second attempt; missing sessions go to the failure index and trigger a key request
    async fn process_decryption_retry(&self, retry: DecryptionRetryItem) -> DecryptionResult<()> {
        let item = retry.item;
        let Err(e) = self.decrypt(&item).await else {
            debug!(stream_id = %item.stream_id, event_id = %item.event_id, "decrypted on retry");
            return Ok(());
        };

        if e.is_session_not_found() {
            let session_id = item.encrypted_data.session_id();
            let stream_id = item.stream_id.clone();
            debug!(stream_id = %stream_id, session_id = %session_id, "waiting for session key");
            let wait_until = Instant::now() + self.config.missing_keys_delay;
            let mut state = self.state();
            state.failures.record(session_id, item);
            state.queues.schedule_missing_keys(&stream_id, wait_until);
        } else {
            warn!(
                stream_id = %item.stream_id,
                event_id = %item.event_id,
                error = %e,
                "failed to decrypt event"
            );
        }
        Ok(())
    }

    async fn decrypt(&self, item: &EncryptedContentItem) -> DecryptionResult<()> {
        let result = self
            .delegate
            .decrypt_group_event(&item.stream_id, &item.event_id, &item.kind, &item.encrypted_data)
            .await;
        match &result {
            Ok(()) => metrics::record_counter(metrics::EVENTS_DECRYPTED, 1),
            Err(e) => {
                metrics::record_counter(metrics::EVENTS_FAILED, 1);
                self.delegate.on_decryption_error(
                    item,
                    DecryptionSessionError {
                        missing_session: e.is_session_not_found(),
                        kind: item.kind.clone(),
                        encrypted_data: item.encrypted_data.clone(),
                        error: e.to_string(),
                    },
                );
            }
        }
        result
    }

    /// Publish a key solicitation for the sessions we are still missing
    async fn process_missing_keys(&self, item: MissingKeysItem) -> DecryptionResult<()> {
        let stream_id = item.stream_id.as_str();
        let missing_session_ids = self
            .state()
            .failures
            .missing_session_ids(stream_id, self.config.max_missing_session_ids);
        if missing_session_ids.is_empty() {
            debug!(stream_id, "no missing keys");
            return Ok(());
        }

        if !self.delegate.has_stream(stream_id) {
            debug!(stream_id, "stream not found");
            return Ok(());
        }

        let entitled = self
            .delegate
            .is_user_entitled_to_key_exchange(
                stream_id,
                &self.user_id,
                EntitlementCheckOptions { skip_on_chain_validation: true },
            )
            .await?;
        if !entitled {
            debug!(stream_id, "not entitled to key exchange");
            return Ok(());
        }

        let own = self
            .delegate
            .get_key_solicitations(stream_id)
            .into_iter()
            .find(|s| s.device_key == self.user_device.device_key);
        if let Some(mut own) = own {
            own.session_ids.sort();
            if own.is_new_device || own.session_ids == missing_session_ids {
                debug!(stream_id, "key solicitation already published");
                return Ok(());
            }
        }

        let known_session_ids = self.crypto.get_group_session_ids(stream_id).await?;
        let is_new_device = known_session_ids.is_empty();
        info!(
            stream_id,
            is_new_device,
            count = missing_session_ids.len(),
            "requesting missing keys"
        );
        self.delegate
            .send_key_solicitation(KeySolicitationData {
                stream_id: stream_id.to_string(),
                is_new_device,
                missing_session_ids,
            })
            .await?;
        metrics::record_counter(metrics::KEY_SOLICITATIONS_SENT, 1);
        Ok(())
    }

    /// Answer a peer's key request with the sessions we can share
    async fn process_key_solicitation(&self, item: KeySolicitationItem) -> DecryptionResult<()> {
        let stream_id = item.stream_id.as_str();
        debug!(stream_id, from_user_id = %item.from_user_id, "processKeySolicitation");

        if !self.delegate.has_stream(stream_id) {
            return Err(DecryptionError::StreamNotFound(item.stream_id.clone()));
        }

        if let EventValidity::Invalid { reason } =
            self.delegate.is_valid_event(stream_id, &item.solicitation.src_event_id)
        {
            error!(stream_id, reason = %reason, "dropping key solicitation from invalid event");
            return Ok(());
        }

        let mut known_session_ids = self.crypto.get_group_session_ids(stream_id).await?;
        known_session_ids.sort();
        let reply_ids: Vec<String> = if item.solicitation.is_new_device {
            known_session_ids
        } else {
            let requested: HashSet<&String> = item.solicitation.session_ids.iter().collect();
            known_session_ids.into_iter().filter(|id| requested.contains(id)).collect()
        };
        if reply_ids.is_empty() {
            debug!(stream_id, "no matching sessions to share");
            return Ok(());
        }

        let entitled = self
            .delegate
            .is_user_entitled_to_key_exchange(
                stream_id,
                &item.from_user_id,
                EntitlementCheckOptions::default(),
            )
            .await?;
        if !entitled {
            info!(stream_id, from_user_id = %item.from_user_id, "requester not entitled");
            return Ok(());
        }

        let mut sessions = Vec::with_capacity(reply_ids.len());
        for session_id in &reply_ids {
            if let Some(session) = self.crypto.export_group_session(stream_id, session_id).await? {
                sessions.push(session);
            }
        }
        if sessions.is_empty() {
            debug!(stream_id, "no exportable sessions");
            return Ok(());
        }

        let session_ids = if item.solicitation.is_new_device {
            Vec::new()
        } else {
            let mut ids: Vec<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
            ids.sort();
            ids
        };
        let fulfillment = self
            .delegate
            .send_key_fulfillment(KeyFulfillmentData {
                stream_id: stream_id.to_string(),
                user_address: item.from_user_address.clone(),
                device_key: item.solicitation.device_key.clone(),
                session_ids,
            })
            .await;
        match fulfillment {
            Ok(response) => match response.error {
                Some(err) if err.is_duplicate_event() => {
                    debug!(stream_id, "key fulfillment already published");
                }
                Some(err) => {
                    error!(stream_id, code = %err.code, msg = %err.msg, "failed to send key fulfillment");
                }
                None => metrics::record_counter(metrics::KEY_FULFILLMENTS_SENT, 1),
            },
            Err(e) => error!(stream_id, error = %e, "failed to send key fulfillment"),
        }

        let mut by_algorithm: BTreeMap<GroupEncryptionAlgorithmId, Vec<GroupEncryptionSession>> =
            BTreeMap::new();
        for session in sessions {
            by_algorithm.entry(session.algorithm).or_default().push(session);
        }
        for (algorithm, sessions) in by_algorithm {
            info!(stream_id, algorithm = %algorithm, count = sessions.len(), "sharing group sessions");
            self.delegate
                .encrypt_and_share_group_sessions(GroupSessionsData {
                    stream_id: stream_id.to_string(),
                    item: item.clone(),
                    sessions,
                    algorithm,
                })
                .await?;
        }
        Ok(())
    }
}
