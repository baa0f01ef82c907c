use thiserror::Error;

use caresync_core::{AggregateId, AggregateKind, EventId};
use caresync_events::StoredEnvelope;

use super::query::{EventFilter, Sequenced};
use std::sync::Arc;

/// Result of a successful append call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The envelope was persisted at this store-local insertion position.
    Appended { position: u64 },
    /// An envelope with the same event id is already persisted. Idempotent
    /// no-op, treated as success everywhere.
    AlreadyExists,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed: the envelope's stream version
    /// does not continue the stream.
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// The envelope's organization does not match the stream's.
    #[error("organization isolation violation: {0}")]
    OrganizationIsolation(String),

    /// Storage-level failure; callers treat this as transient.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only event store: one stream per `(AggregateKind, AggregateId)`.
///
/// - **No storage assumptions** (the in-memory implementation serves tests
///   and device-local state; durable backends plug in behind this trait)
/// - **Append-only**: no update, no delete; durable at return of `append`
/// - **Optimistic concurrency**: an append must carry stream version
///   `current length + 1`
/// - **Idempotent by event id**: re-appending a persisted event succeeds
///   silently
///
/// `read_after` pages events across streams in *insertion order*, which is
/// store-local and not semantic; consumers apply the causal orderer when
/// semantic order matters.
pub trait EventStore: Send + Sync {
    fn append(&self, envelope: &StoredEnvelope) -> Result<AppendOutcome, EventStoreError>;

    /// Full stream in ascending `aggregate_version` order.
    fn read_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEnvelope>, EventStoreError>;

    /// Filtered page of events with insertion position greater than
    /// `cursor`. Returns the page and the cursor to resume from.
    fn read_after(
        &self,
        filter: &EventFilter,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Sequenced>, u64), EventStoreError>;

    fn exists(&self, event_id: EventId) -> Result<bool, EventStoreError>;

    /// Fetch one envelope by id, whether or not it is still part of its
    /// stream's effective composition.
    fn get_event(&self, event_id: EventId) -> Result<Option<StoredEnvelope>, EventStoreError>;

    /// Highest insertion position handed out so far.
    fn current_position(&self) -> Result<u64, EventStoreError>;

    /// Conflict resolution only: atomically set one stream's effective
    /// composition to `accepted` (renumbered 1..=n by the resolver).
    ///
    /// Events already persisted keep their identity and insertion position;
    /// events new to the store are appended and returned with their
    /// positions so the caller can dispatch them. Events displaced from the
    /// stream stay addressable by event id (idempotent re-upload reports
    /// Duplicate) but leave the read path; the caller preserves their
    /// content verbatim in compensation records before restructuring. No
    /// other component may call this.
    fn restructure_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
        accepted: Vec<StoredEnvelope>,
    ) -> Result<Vec<Sequenced>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(&self, envelope: &StoredEnvelope) -> Result<AppendOutcome, EventStoreError> {
        (**self).append(envelope)
    }

    fn read_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEnvelope>, EventStoreError> {
        (**self).read_stream(aggregate_type, aggregate_id)
    }

    fn read_after(
        &self,
        filter: &EventFilter,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<Sequenced>, u64), EventStoreError> {
        (**self).read_after(filter, cursor, limit)
    }

    fn exists(&self, event_id: EventId) -> Result<bool, EventStoreError> {
        (**self).exists(event_id)
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<StoredEnvelope>, EventStoreError> {
        (**self).get_event(event_id)
    }

    fn current_position(&self) -> Result<u64, EventStoreError> {
        (**self).current_position()
    }

    fn restructure_stream(
        &self,
        aggregate_type: AggregateKind,
        aggregate_id: AggregateId,
        accepted: Vec<StoredEnvelope>,
    ) -> Result<Vec<Sequenced>, EventStoreError> {
        (**self).restructure_stream(aggregate_type, aggregate_id, accepted)
    }
}
