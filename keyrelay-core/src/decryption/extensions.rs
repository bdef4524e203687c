//! Decryption scheduler and lifecycle
//!
//! `DecryptionExtensions` owns the work queues and runs a single tick loop
//! task. Mutators are synchronous: they take the state lock briefly, change
//! the queues and wake the loop. Each tick pops exactly one work item and
//! awaits its handler to completion before the next tick is considered, so
//! handlers never run concurrently.

use super::delegate::{DecryptionDelegate, GroupEncryptionCrypto};
use super::errors::{DecryptionError, DecryptionResult};
use super::queues::{DecryptionFailureIndex, PriorityTask, QueueSizes, WorkItem, WorkQueues};
use super::status::{DecryptionStatus, StatusBroadcaster};
use super::types::{
    EncryptedContentItem, EncryptedData, GroupEncryptionSessions, KeySolicitationContent,
    KeySolicitationItem, KeySolicitationMember, NewGroupSessionItem, StreamId, UserDevice,
};
use crate::config::DecryptionConfig;
use crate::metrics::{self, Timer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Mutable engine state, guarded by one lock
pub(crate) struct EngineState {
    pub queues: WorkQueues,
    pub failures: DecryptionFailureIndex,
    pub up_to_date_streams: HashSet<StreamId>,
    pub high_priority_streams: HashSet<StreamId>,
    pub status: StatusBroadcaster,
    last_queue_report: Option<Instant>,
}

/// State and collaborators shared between the handle and the tick loop
pub(crate) struct Engine<D, C> {
    pub delegate: Arc<D>,
    pub crypto: Arc<C>,
    pub user_device: UserDevice,
    pub user_id: String,
    pub config: DecryptionConfig,
    state: Mutex<EngineState>,
    wake: Notify,
}

enum TickOutcome {
    Processed,
    Idle { next_due: Option<Instant> },
}

impl<D, C> Engine<D, C> {
    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        // Handlers never panic while holding the lock, but don't cascade if one did
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.wake.notify_one();
    }

    fn set_status(&self, state: &mut EngineState, status: DecryptionStatus) {
        if state.status.set(status) {
            info!(status = %status, "status changed");
        }
    }
}

impl<D: DecryptionDelegate, C: GroupEncryptionCrypto> Engine<D, C> {
    /// Delay before the next tick, or `None` if no tick should be scheduled
    fn check_start_ticking(&self) -> Option<Duration> {
        if self.delegate.should_pause_ticking() {
            return None;
        }
        let up_to_date = self.state().up_to_date_streams.clone();
        if !self.delegate.is_user_inbox_stream_up_to_date(&up_to_date) {
            return None;
        }

        let mut state = self.state();
        if state.queues.is_empty() {
            self.set_status(&mut state, DecryptionStatus::Idle);
            return None;
        }

        let now = Instant::now();
        let report_due = state
            .last_queue_report
            .map_or(true, |last| now.duration_since(last) >= self.config.queue_report_interval);
        if report_due {
            info!(queues = %state.queues.sizes(&state.failures), "queue sizes");
            state.last_queue_report = Some(now);
        }

        if state.queues.new_group_session.is_empty() {
            Some(self.config.tick_delay)
        } else {
            Some(Duration::ZERO)
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("tick loop started");
        loop {
            let Some(delay) = self.check_start_ticking() else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => continue,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            // In-flight work is never raced against cancellation
            if let TickOutcome::Idle { next_due } = self.tick().await {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    _ = sleep_until_due(next_due) => {}
                }
            }
        }
        debug!("tick loop stopped");
    }

    /// Process exactly one work item, if any qualifies
    async fn tick(&self) -> TickOutcome {
        let now = Instant::now();
        let work = {
            let mut state = self.state();
            let EngineState { queues, up_to_date_streams, high_priority_streams, .. } = &mut *state;
            let work = queues.next_work(now, up_to_date_streams, high_priority_streams);
            let next_due = queues.next_due_after(now);
            match work {
                Some(work) => {
                    self.set_status(&mut state, status_for(&work));
                    work
                }
                None => {
                    self.set_status(&mut state, DecryptionStatus::Idle);
                    return TickOutcome::Idle { next_due };
                }
            }
        };

        let timer = Timer::start(metrics::TICK_DURATION_MS);
        let result = self.process(work).await;
        timer.stop();
        metrics::record_counter(metrics::TICKS_TOTAL, 1);

        if let Err(e) = result {
            error!(error = %e, "ProcessTick error");
            metrics::record_counter(metrics::TICKS_FAILED, 1);
        }
        TickOutcome::Processed
    }
}

fn status_for(work: &WorkItem) -> DecryptionStatus {
    match work {
        WorkItem::Priority(_) => DecryptionStatus::Updating,
        WorkItem::NewGroupSession(_) => DecryptionStatus::ProcessingNewGroupSessions,
        WorkItem::EncryptedContent(_) => DecryptionStatus::DecryptingEvents,
        WorkItem::DecryptionRetry(_) => DecryptionStatus::RetryingDecryption,
        WorkItem::MissingKeys(_) => DecryptionStatus::RequestingKeys,
        WorkItem::KeySolicitation(_) => DecryptionStatus::RespondingToKeyRequests,
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Shorten long hex ids to `abcd..wxyz` for log prefixes
fn shorten_hex(value: &str) -> String {
    let value = value.strip_prefix("0x").unwrap_or(value);
    if value.len() > 12 && value.is_ascii() {
        format!("{}..{}", &value[..4], &value[value.len() - 4..])
    } else {
        value.to_string()
    }
}

pub(crate) fn generate_log_id(user_id: &str, device_key: &str) -> String {
    format!("{}:{}", shorten_hex(user_id), shorten_hex(device_key))
}

type Teardown = Box<dyn FnOnce() + Send>;

/// Per-device decryption and key exchange engine
pub struct DecryptionExtensions<D, C> {
    engine: Arc<Engine<D, C>>,
    log_id: String,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    teardown: Mutex<Option<Teardown>>,
}

impl<D: DecryptionDelegate, C: GroupEncryptionCrypto> DecryptionExtensions<D, C> {
    /// Create an engine for one device
    ///
    /// `up_to_date_streams` seeds the set of streams whose time-gated work
    /// may run immediately.
    pub fn new(
        delegate: Arc<D>,
        crypto: Arc<C>,
        user_device: UserDevice,
        user_id: impl Into<String>,
        up_to_date_streams: HashSet<StreamId>,
        config: DecryptionConfig,
    ) -> Self {
        let user_id = user_id.into();
        let log_id = generate_log_id(&user_id, &user_device.device_key);
        let state = EngineState {
            queues: WorkQueues::default(),
            failures: DecryptionFailureIndex::default(),
            up_to_date_streams,
            high_priority_streams: HashSet::new(),
            status: StatusBroadcaster::new(config.status_channel_capacity),
            last_queue_report: None,
        };
        debug!(log_id = %log_id, "new DecryptionExtensions");

        Self {
            engine: Arc::new(Engine {
                delegate,
                crypto,
                user_device,
                user_id,
                config,
                state: Mutex::new(state),
                wake: Notify::new(),
            }),
            log_id,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tick_task: Mutex::new(None),
            teardown: Mutex::new(None),
        }
    }

    /// Hook invoked once, the first time `stop()` runs
    pub fn with_teardown(self, teardown: impl FnOnce() + Send + 'static) -> Self {
        *self.teardown.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(teardown));
        self
    }

    pub fn delegate(&self) -> &Arc<D> {
        &self.engine.delegate
    }

    pub fn crypto(&self) -> &Arc<C> {
        &self.engine.crypto
    }

    pub fn user_device(&self) -> &UserDevice {
        &self.engine.user_device
    }

    pub fn user_id(&self) -> &str {
        &self.engine.user_id
    }

    pub fn status(&self) -> DecryptionStatus {
        self.engine.state().status.current()
    }

    /// Receive every status transition from now on
    pub fn subscribe_status(&self) -> broadcast::Receiver<DecryptionStatus> {
        self.engine.state().status.subscribe()
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        let state = self.engine.state();
        state.queues.sizes(&state.failures)
    }

    /// Number of failed items waiting for a key on a stream
    pub fn decryption_failure_count(&self, stream_id: &str) -> usize {
        self.engine.state().failures.item_count(stream_id)
    }

    /// Start the tick loop
    ///
    /// Queues device key upload and inbox backfill ahead of everything
    /// else. Must be called from within a tokio runtime, and only once.
    pub fn start(&self) -> DecryptionResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DecryptionError::Internal(format!("no tokio runtime: {}", e)))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DecryptionError::AlreadyStarted);
        }
        debug!(log_id = %self.log_id, "starting");
        self.engine.delegate.on_start();

        {
            let mut state = self.engine.state();
            state.queues.priority_tasks.push_back(PriorityTask::UploadDeviceKeys);
            state.queues.priority_tasks.push_back(PriorityTask::DownloadNewMessages);
        }

        let span = tracing::info_span!("decryption", log_id = %self.log_id);
        let handle = runtime.spawn(self.engine.clone().run(self.cancel.clone()).instrument(span));
        *self.tick_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.engine.wake();
        Ok(())
    }

    /// Stop ticking and wait for the in-flight tick to finish
    ///
    /// Not-yet-started work is dropped; in-flight work is never aborted.
    pub async fn stop(&self) {
        let teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(teardown) = teardown {
            teardown();
        }
        self.cancel.cancel();

        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.engine.delegate.on_stop().await;
        }

        let handle = self.tick_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(log_id = %self.log_id, error = %e, "tick loop ended abnormally");
            }
        }
    }

    /// Re-evaluate whether to tick, e.g. after `should_pause_ticking` cleared
    pub fn check_start_ticking(&self) {
        self.engine.wake();
    }

    pub fn enqueue_new_group_sessions(&self, sessions: GroupEncryptionSessions, sender_id: &str) {
        debug!(stream_id = %sessions.stream_id, sender_id, "enqueueNewGroupSessions");
        self.engine.state().queues.new_group_session.push_back(NewGroupSessionItem {
            sessions,
            sender_id: sender_id.to_string(),
        });
        self.engine.wake();
    }

    pub fn enqueue_new_encrypted_content(
        &self,
        stream_id: &str,
        event_id: &str,
        kind: &str,
        encrypted_data: EncryptedData,
    ) {
        self.engine.state().queues.encrypted_content.push_back(EncryptedContentItem {
            stream_id: stream_id.to_string(),
            event_id: event_id.to_string(),
            kind: kind.to_string(),
            encrypted_data,
        });
        self.engine.wake();
    }

    /// Queue a peer's request for our keys
    ///
    /// Requests from our own device are ignored. A newer request from the
    /// same device replaces the queued one; an empty request only cancels.
    pub fn enqueue_key_solicitation(
        &self,
        stream_id: &str,
        from_user_id: &str,
        from_user_address: Vec<u8>,
        solicitation: KeySolicitationContent,
    ) {
        if solicitation.device_key == self.engine.user_device.device_key {
            return;
        }
        let item = self.solicitation_item(stream_id, from_user_id, from_user_address, solicitation);
        let queued = self.engine.state().queues.admit_key_solicitation(item);
        if !queued {
            debug!(stream_id, from_user_id, "cleared key solicitation");
        }
        self.engine.wake();
    }

    /// Replace every queued solicitation for a stream with the members' current ones
    pub fn enqueue_init_key_solicitations(&self, stream_id: &str, members: Vec<KeySolicitationMember>) {
        let mut items = Vec::new();
        for member in members {
            for solicitation in member.solicitations {
                if solicitation.device_key == self.engine.user_device.device_key {
                    continue;
                }
                items.push(self.solicitation_item(
                    stream_id,
                    &member.user_id,
                    member.user_address.clone(),
                    solicitation,
                ));
            }
        }

        {
            let mut state = self.engine.state();
            state.queues.key_solicitations.retain(|x| x.stream_id != stream_id);
            for item in items {
                state.queues.admit_key_solicitation(item);
            }
        }
        self.engine.wake();
    }

    fn solicitation_item(
        &self,
        stream_id: &str,
        from_user_id: &str,
        from_user_address: Vec<u8>,
        solicitation: KeySolicitationContent,
    ) -> KeySolicitationItem {
        let delay = self.engine.delegate.respond_delay_for_key_solicitation(stream_id, from_user_id);
        KeySolicitationItem {
            stream_id: stream_id.to_string(),
            from_user_id: from_user_id.to_string(),
            from_user_address,
            solicitation,
            respond_after: Instant::now() + delay,
        }
    }

    /// Mark a stream synchronized, unblocking its time-gated work
    pub fn set_stream_up_to_date(&self, stream_id: &str) {
        let inserted = self.engine.state().up_to_date_streams.insert(stream_id.to_string());
        if inserted {
            debug!(stream_id, "streamUpToDate");
            self.engine.wake();
        }
    }

    /// Request missing keys again for a stream, e.g. after a membership change
    pub fn retry_decryption_failures(&self, stream_id: &str) {
        {
            let mut state = self.engine.state();
            if state.failures.has_failures(stream_id) {
                debug!(stream_id, "re-enqueuing decryption failures for stream");
                state.queues.schedule_missing_keys(stream_id, Instant::now());
            }
        }
        self.engine.wake();
    }

    /// Streams whose encrypted content is decrypted first
    pub fn set_high_priority_streams<I, S>(&self, stream_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<StreamId>,
    {
        self.engine.state().high_priority_streams = stream_ids.into_iter().map(Into::into).collect();
        self.engine.wake();
    }
}

impl<D, C> Drop for DecryptionExtensions<D, C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
