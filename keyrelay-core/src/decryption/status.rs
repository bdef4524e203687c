//! Engine status and change notifications

use std::fmt;
use tokio::sync::broadcast;

/// What the tick loop is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptionStatus {
    Initializing,
    Updating,
    ProcessingNewGroupSessions,
    DecryptingEvents,
    RetryingDecryption,
    RequestingKeys,
    RespondingToKeyRequests,
    Idle,
}

impl DecryptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecryptionStatus::Initializing => "initializing",
            DecryptionStatus::Updating => "updating",
            DecryptionStatus::ProcessingNewGroupSessions => "processingNewGroupSessions",
            DecryptionStatus::DecryptingEvents => "decryptingEvents",
            DecryptionStatus::RetryingDecryption => "retryingDecryption",
            DecryptionStatus::RequestingKeys => "requestingKeys",
            DecryptionStatus::RespondingToKeyRequests => "respondingToKeyRequests",
            DecryptionStatus::Idle => "idle",
        }
    }
}

impl fmt::Display for DecryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcasts status transitions to any number of subscribers
///
/// Holds the current status so repeated sets of the same value are dropped.
pub struct StatusBroadcaster {
    current: DecryptionStatus,
    tx: broadcast::Sender<DecryptionStatus>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { current: DecryptionStatus::Initializing, tx }
    }

    pub fn current(&self) -> DecryptionStatus {
        self.current
    }

    /// Returns true if the status changed
    pub fn set(&mut self, status: DecryptionStatus) -> bool {
        if self.current == status {
            return false;
        }
        self.current = status;
        // No receivers is fine
        let _ = self.tx.send(status);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DecryptionStatus> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
