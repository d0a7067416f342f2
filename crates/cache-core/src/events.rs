use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    pagination::MergeResult,
    types::{GroupId, MutationKind, MutationState},
};

/// Settle outcome of one tracked mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationAck {
    pub txn_id: Uuid,
    pub kind: MutationKind,
    /// `Committed` or `RolledBack`.
    pub state: MutationState,
    /// Stable error code when the mutation rolled back.
    pub error_code: Option<String>,
}

/// Cache-level notifications for observers that do not hold a query binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    MutationSettled(MutationAck),
    PageMerged(MergeResult),
    WindowReloaded {
        group_id: GroupId,
        len: usize,
        exhausted: bool,
    },
}

/// Broadcast event stream type used by subscribers.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Fan-out point for `SyncEvent`s.
#[derive(Clone, Debug)]
pub struct EventHub {
    event_tx: broadcast::Sender<SyncEvent>,
}

impl EventHub {
    /// Hub whose slow subscribers lag after `event_buffer` events.
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// New receiver for events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloaded(len: usize) -> SyncEvent {
        SyncEvent::WindowReloaded {
            group_id: GroupId(7),
            len,
            exhausted: false,
        }
    }

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(reloaded(3));

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let hub = EventHub::new(0);
        hub.emit(reloaded(1));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_skipped_events() {
        let hub = EventHub::new(1);
        let mut rx = hub.subscribe();
        hub.emit(reloaded(1));
        hub.emit(reloaded(2));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.expect("latest event"), reloaded(2));
    }
}
