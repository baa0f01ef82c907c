use std::collections::HashMap;
use std::sync::RwLock;

use caresync_core::{AggregateId, AggregateKind, EventId};
use caresync_events::StoredEnvelope;

use super::query::{EventFilter, Sequenced};
use super::r#trait::{AppendOutcome, EventStore, EventStoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    aggregate_type: AggregateKind,
    aggregate_id: AggregateId,
}

#[derive(Debug, Default)]
struct Inner {
    /// Insertion-ordered log; index + 1 is the insertion position.
    log: Vec<StoredEnvelope>,
    /// Per-stream log indices, ascending by aggregate_version.
    streams: HashMap<StreamKey, Vec<usize>>,
    /// Idempotency index.
    by_event_id: HashMap<EventId, usize>,
    /// Events displaced from their stream by conflict resolution. They stay
    /// in the log (positions are stable) but leave the read path.
    displaced: std::collections::HashSet<EventId>,
}

/// In-memory append-only event store.
///
/// Serves tests, development, and device-local state. Not optimized for
/// large histories.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, envelope: &StoredEnvelope) -> Result<AppendOutcome, EventStoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        // Idempotent by event id.
        if inner.by_event_id.contains_key(&envelope.event_id()) {
            return Ok(AppendOutcome::AlreadyExists);
        }

        let key = StreamKey {
            aggregate_type: envelope.aggregate_type(),
            aggregate_id: envelope.aggregate_id(),
        };

        let current_len = inner.streams.get(&key).map(Vec::len).unwrap_or(0) as u64;
        let expected = current_len + 1;
        if envelope.aggregate_version() != expected {
            return Err(EventStoreError::VersionConflict {
                expected,
                actual: envelope.aggregate_version(),
            });
        }

        // Organization stability across the stream.
        if let Some(&first_idx) = inner.streams.get(&key).and_then(|s| s.first()) {
            let first_org = inner.log[first_idx].organization_id();
            if first_org != envelope.organization_id() {
                return Err(EventStoreError::OrganizationIsolation(format!(
                    "stream belongs to organization {first_org}"
                )));
            }
        }

        let idx = inner.log.len();
        inner.log.push(envelope.clone());
        inner.streams.entry(key).or_default().push(idx);
        inner.by_event_id.insert(envelope.event_id(), idx);

        Ok(AppendOutcome::Appended {
            position: (idx + 1) as u64,
        })
    }

    fn read_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEnvelope>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let key = StreamKey {
            aggregate_type,
            aggregate_id,
        };

        Ok(inner
            .streams
            .get(&key)
            .map(|indices| indices.iter().map(|&i| inner.log[i].clone()).collect())
            .unwrap_or_default())
    }

    fn read_after(
        &self,
        filter: &EventFilter,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Sequenced>, u64), EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let mut page = Vec::new();
        let mut next_cursor = cursor;
        let start = cursor.min(inner.log.len() as u64) as usize;
        for (idx, envelope) in inner.log.iter().enumerate().skip(start) {
            let position = (idx + 1) as u64;
            // Events the filter drops still advance the cursor; they will
            // never match on a later page either.
            next_cursor = position;
            if inner.displaced.contains(&envelope.event_id()) {
                continue;
            }
            if filter.matches(envelope) {
                page.push(Sequenced {
                    position,
                    envelope: envelope.clone(),
                });
                if page.len() == limit {
                    break;
                }
            }
        }

        Ok((page, next_cursor))
    }

    fn exists(&self, event_id: EventId) -> Result<bool, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.by_event_id.contains_key(&event_id))
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<StoredEnvelope>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner
            .by_event_id
            .get(&event_id)
            .map(|&idx| inner.log[idx].clone()))
    }

    fn current_position(&self) -> Result<u64, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.log.len() as u64)
    }

    fn restructure_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
        accepted: Vec<StoredEnvelope>,
    ) -> Result<Vec<Sequenced>, EventStoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let key = StreamKey {
            aggregate_type,
            aggregate_id,
        };

        let accepted_ids: std::collections::HashSet<EventId> =
            accepted.iter().map(|e| e.event_id()).collect();

        // Displace what the resolver dropped.
        let old_indices = inner.streams.get(&key).cloned().unwrap_or_default();
        for idx in old_indices {
            let id = inner.log[idx].event_id();
            if !accepted_ids.contains(&id) {
                inner.displaced.insert(id);
            }
        }

        let mut new_indices = Vec::with_capacity(accepted.len());
        let mut fresh = Vec::new();
        for envelope in accepted {
            match inner.by_event_id.get(&envelope.event_id()).copied() {
                Some(idx) => {
                    // Same identity, possibly renumbered placement.
                    inner.displaced.remove(&envelope.event_id());
                    inner.log[idx] = envelope;
                    new_indices.push(idx);
                }
                None => {
                    let idx = inner.log.len();
                    inner.by_event_id.insert(envelope.event_id(), idx);
                    inner.log.push(envelope.clone());
                    new_indices.push(idx);
                    fresh.push(Sequenced {
                        position: (idx + 1) as u64,
                        envelope,
                    });
                }
            }
        }
        inner.streams.insert(key, new_indices);

        Ok(fresh)
    }
}
