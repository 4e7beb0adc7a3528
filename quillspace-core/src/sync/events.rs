//! Event stream the engine publishes for application layers
//!
//! The core has no UI dependency; anything a frontend would surface (finished
//! rounds, new conflicts, a peer showing up with a different key) goes out on
//! a broadcast channel instead. Subscribers come and go freely, and a slow
//! subscriber loses the oldest events rather than stalling the engine.

use tokio::sync::broadcast;
use uuid::Uuid;

use super::models::SyncSummary;

const EVENT_CAPACITY: usize = 64;

/// Notable occurrence during synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync round with a peer ran to completion
    RoundCompleted(SyncSummary),
    /// A sync round aborted; `peer_device_id` is `None` when the failure
    /// happened before the peer identified itself
    RoundFailed {
        peer_device_id: Option<Uuid>,
        reason: String,
    },
    /// A concurrent change could not be merged automatically and a conflict
    /// record now awaits the user
    ConflictDetected {
        conflict_id: i64,
        entity_id: Uuid,
        peer_device_id: Uuid,
    },
    /// A remote mutation was skipped and written to the skip table
    MutationSkipped {
        origin_device_id: Uuid,
        logical_clock: u64,
        reason: String,
    },
    /// A known peer presented a key different from the pinned one; the
    /// session proceeds but the user should re-verify the peer
    PeerKeyChanged { device_id: Uuid },
}

/// Handle for publishing and subscribing to [`SyncEvent`]s
#[derive(Clone)]
pub struct SyncEvents {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// dropped.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new()
    }
}
