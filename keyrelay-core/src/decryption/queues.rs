//! Work queues owned by the scheduler
//!
//! Three FIFO queues (priority tasks, new group sessions, encrypted content)
//! and three time-ordered queues (decryption retries, missing keys, key
//! solicitations). The time-ordered queues are kept sorted ascending by due
//! time; insertion scans from the tail since most items are appended with
//! the latest due time.

use super::types::{
    DecryptionRetryItem, EncryptedContentItem, KeySolicitationItem, MissingKeysItem,
    NewGroupSessionItem, SessionId, StreamId,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::time::Instant;

/// Items that become eligible at a point in time, for a given stream
pub(crate) trait TimeGated {
    fn due_at(&self) -> Instant;
    fn stream_id(&self) -> &str;
}

impl TimeGated for DecryptionRetryItem {
    fn due_at(&self) -> Instant {
        self.retry_at
    }

    fn stream_id(&self) -> &str {
        &self.item.stream_id
    }
}

impl TimeGated for MissingKeysItem {
    fn due_at(&self) -> Instant {
        self.wait_until
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

impl TimeGated for KeySolicitationItem {
    fn due_at(&self) -> Instant {
        self.respond_after
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

#[derive(Debug)]
pub(crate) struct TimeOrderedQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for TimeOrderedQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T: TimeGated> TimeOrderedQueue<T> {
    /// Insert after every item due at or before `item`, keeping FIFO order for ties
    pub fn insert(&mut self, item: T) {
        let due = item.due_at();
        let mut index = self.items.len();
        while index > 0 && self.items[index - 1].due_at() > due {
            index -= 1;
        }
        self.items.insert(index, item);
    }

    /// Remove the first item that is due and whose stream is up to date
    ///
    /// If the head is not due yet the queue counts as empty. Otherwise the
    /// due prefix is scanned for an up-to-date stream and only that item is
    /// removed.
    pub fn dequeue_up_to_date(
        &mut self,
        now: Instant,
        up_to_date: &HashSet<StreamId>,
    ) -> Option<T> {
        let head = self.items.front()?;
        if head.due_at() > now {
            return None;
        }
        let index = self
            .items
            .iter()
            .take_while(|x| x.due_at() <= now)
            .position(|x| up_to_date.contains(x.stream_id()))?;
        self.items.remove(index)
    }

    /// Earliest due time strictly after `now`
    ///
    /// Looks past overdue items, which may be blocked on a stream that is
    /// not up to date.
    pub fn next_due_after(&self, now: Instant) -> Option<Instant> {
        // Sorted by due time, so the first future item is the earliest
        self.items.iter().map(TimeGated::due_at).find(|due| *due > now)
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Failed decryptions waiting for a key: stream -> session -> items
#[derive(Debug, Default)]
pub(crate) struct DecryptionFailureIndex {
    streams: HashMap<StreamId, BTreeMap<SessionId, Vec<EncryptedContentItem>>>,
}

impl DecryptionFailureIndex {
    /// Returns false if an item for the same event is already recorded
    pub fn record(&mut self, session_id: SessionId, item: EncryptedContentItem) -> bool {
        let items = self
            .streams
            .entry(item.stream_id.clone())
            .or_default()
            .entry(session_id)
            .or_default();
        if items.iter().any(|x| x.event_id == item.event_id) {
            return false;
        }
        items.push(item);
        true
    }

    /// Remove and return everything recorded for a session
    pub fn take_session(&mut self, stream_id: &str, session_id: &str) -> Vec<EncryptedContentItem> {
        let Some(sessions) = self.streams.get_mut(stream_id) else {
            return Vec::new();
        };
        let items = sessions.remove(session_id).unwrap_or_default();
        if sessions.is_empty() {
            self.streams.remove(stream_id);
        }
        items
    }

    /// Up to `limit` failing session ids for a stream, ascending
    pub fn missing_session_ids(&self, stream_id: &str, limit: usize) -> Vec<SessionId> {
        self.streams
            .get(stream_id)
            .map(|sessions| sessions.keys().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_failures(&self, stream_id: &str) -> bool {
        self.streams.get(stream_id).is_some_and(|sessions| !sessions.is_empty())
    }

    pub fn item_count(&self, stream_id: &str) -> usize {
        self.streams
            .get(stream_id)
            .map(|sessions| sessions.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn total_items(&self) -> usize {
        self.streams.values().flat_map(|s| s.values()).map(Vec::len).sum()
    }
}

/// Deferred startup work, run before anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTask {
    UploadDeviceKeys,
    DownloadNewMessages,
}

/// The single unit of work picked by a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Priority(PriorityTask),
    NewGroupSession(NewGroupSessionItem),
    EncryptedContent(EncryptedContentItem),
    DecryptionRetry(DecryptionRetryItem),
    MissingKeys(MissingKeysItem),
    KeySolicitation(KeySolicitationItem),
}

impl WorkItem {
    /// Position in the fixed tick priority order, lower runs first
    #[cfg(test)]
    pub fn rank(&self) -> u8 {
        match self {
            WorkItem::Priority(_) => 0,
            WorkItem::NewGroupSession(_) => 1,
            WorkItem::EncryptedContent(_) => 2,
            WorkItem::DecryptionRetry(_) => 3,
            WorkItem::MissingKeys(_) => 4,
            WorkItem::KeySolicitation(_) => 5,
        }
    }
}

/// Snapshot of queue lengths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub priority_tasks: usize,
    pub new_group_session: usize,
    pub encrypted_content: usize,
    pub decryption_retries: usize,
    pub missing_keys: usize,
    pub key_solicitations: usize,
    pub decryption_failures: usize,
}

impl fmt::Display for QueueSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "priorityTasks: {}, newGroupSession: {}, encryptedContent: {}, decryptionRetries: {}, \
             missingKeys: {}, keySolicitations: {}, decryptionFailures: {}",
            self.priority_tasks,
            self.new_group_session,
            self.encrypted_content,
            self.decryption_retries,
            self.missing_keys,
            self.key_solicitations,
            self.decryption_failures,
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueues {
    pub priority_tasks: VecDeque<PriorityTask>,
    pub new_group_session: VecDeque<NewGroupSessionItem>,
    pub encrypted_content: VecDeque<EncryptedContentItem>,
    pub decryption_retries: TimeOrderedQueue<DecryptionRetryItem>,
    pub missing_keys: TimeOrderedQueue<MissingKeysItem>,
    pub key_solicitations: TimeOrderedQueue<KeySolicitationItem>,
}

impl WorkQueues {
    pub fn is_empty(&self) -> bool {
        self.priority_tasks.is_empty()
            && self.new_group_session.is_empty()
            && self.encrypted_content.is_empty()
            && self.decryption_retries.is_empty()
            && self.missing_keys.is_empty()
            && self.key_solicitations.is_empty()
    }

    pub fn sizes(&self, failures: &DecryptionFailureIndex) -> QueueSizes {
        QueueSizes {
            priority_tasks: self.priority_tasks.len(),
            new_group_session: self.new_group_session.len(),
            encrypted_content: self.encrypted_content.len(),
            decryption_retries: self.decryption_retries.len(),
            missing_keys: self.missing_keys.len(),
            key_solicitations: self.key_solicitations.len(),
            decryption_failures: failures.total_items(),
        }
    }

    /// First item of a high priority stream, else the head
    pub fn pop_encrypted_content(
        &mut self,
        high_priority: &HashSet<StreamId>,
    ) -> Option<EncryptedContentItem> {
        if !high_priority.is_empty() {
            if let Some(index) = self
                .encrypted_content
                .iter()
                .position(|x| high_priority.contains(&x.stream_id))
            {
                return self.encrypted_content.remove(index);
            }
        }
        self.encrypted_content.pop_front()
    }

    /// Replace any pending missing-keys request for the stream
    pub fn schedule_missing_keys(&mut self, stream_id: &str, wait_until: Instant) {
        self.missing_keys.retain(|x| x.stream_id != stream_id);
        self.missing_keys.insert(MissingKeysItem { stream_id: stream_id.to_string(), wait_until });
    }

    /// Queue a solicitation, replacing any earlier one from the same device
    ///
    /// A solicitation with no session ids that is not from a new device only
    /// cancels. Returns true if the item was queued.
    pub fn admit_key_solicitation(&mut self, item: KeySolicitationItem) -> bool {
        let device_key = &item.solicitation.device_key;
        self.key_solicitations
            .retain(|x| !(x.stream_id == item.stream_id && &x.solicitation.device_key == device_key));
        if item.solicitation.session_ids.is_empty() && !item.solicitation.is_new_device {
            return false;
        }
        self.key_solicitations.insert(item);
        true
    }

    /// Pop the one item the next tick should process
    pub fn next_work(
        &mut self,
        now: Instant,
        up_to_date: &HashSet<StreamId>,
        high_priority: &HashSet<StreamId>,
    ) -> Option<WorkItem> {
        if let Some(task) = self.priority_tasks.pop_front() {
            return Some(WorkItem::Priority(task));
        }
        if let Some(item) = self.new_group_session.pop_front() {
            return Some(WorkItem::NewGroupSession(item));
        }
        if let Some(item) = self.pop_encrypted_content(high_priority) {
            return Some(WorkItem::EncryptedContent(item));
        }
        if let Some(item) = self.decryption_retries.dequeue_up_to_date(now, up_to_date) {
            return Some(WorkItem::DecryptionRetry(item));
        }
        if let Some(item) = self.missing_keys.dequeue_up_to_date(now, up_to_date) {
            return Some(WorkItem::MissingKeys(item));
        }
        if let Some(item) = self.key_solicitations.dequeue_up_to_date(now, up_to_date) {
            return Some(WorkItem::KeySolicitation(item));
        }
        None
    }

    /// Earliest future due time among the time-ordered queue heads
    pub fn next_due_after(&self, now: Instant) -> Option<Instant> {
        [
            self.decryption_retries.next_due_after(now),
            self.missing_keys.next_due_after(now),
            self.key_solicitations.next_due_after(now),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
