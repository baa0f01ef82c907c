//! Per-device queue of locally persisted but unsynced events.

use std::collections::BTreeMap;
use std::sync::Mutex;

use caresync_core::EventId;
use caresync_infra::OutboxSink;

/// Ordered by local sequence number; pruned when the hub acknowledges.
///
/// Enqueue happens alongside the local append (the handler owns that
/// coupling through [`OutboxSink`]); removal is idempotent, so replayed
/// acks are harmless.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Mutex<BTreeMap<u64, EventId>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending `(event_id, lsn)` pairs in LSN order.
    pub fn pending(&self) -> Vec<(EventId, u64)> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|(&lsn, &id)| (id, lsn)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose event id the hub acknowledged.
    pub fn prune(&self, acknowledged: impl IntoIterator<Item = EventId>) {
        let acknowledged: std::collections::HashSet<EventId> =
            acknowledged.into_iter().collect();
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, id| !acknowledged.contains(id));
        }
    }
}

impl OutboxSink for Outbox {
    fn enqueue(&self, event_id: EventId, local_sequence_number: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(local_sequence_number, event_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_lsn_ordered_and_prune_is_idempotent() {
        let outbox = Outbox::new();
        let (a, b, c) = (EventId::new(), EventId::new(), EventId::new());
        outbox.enqueue(b, 2);
        outbox.enqueue(a, 1);
        outbox.enqueue(c, 3);

        assert_eq!(outbox.pending(), vec![(a, 1), (b, 2), (c, 3)]);

        outbox.prune([a, b]);
        outbox.prune([a, b]);
        assert_eq!(outbox.pending(), vec![(c, 3)]);
    }
}
