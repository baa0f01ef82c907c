use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use caresync_core::{
    AggregateId, AggregateKind, ConnectionStatus, CorrelationId, EventId, FacilityId,
    OrganizationId, PerformerId, PerformerRole, SyncBatchId, Visibility,
};

/// Envelope for an event: the unit of persistence and sync transport.
///
/// An `EventEnvelope` wraps a domain event payload with the metadata the
/// store, the dispatcher, and the sync protocol need: identity, stream
/// position, business and system time, actor, organization, producing
/// device, causal trace, and visibility. Envelopes are immutable once
/// created; the store appends them and nothing ever mutates or deletes one.
///
/// The `E` type parameter separates the transported form
/// (`EventEnvelope<serde_json::Value>`, see [`StoredEnvelope`]) from typed
/// domain views. Infrastructure works with JSON for schema evolution; domain
/// and projection code deserializes the payload into its own event enum.
///
/// Organization isolation works the same way stream identity does: it is
/// envelope-level metadata, enforced on append and on every filtered read,
/// so domain events stay infrastructure-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    /// Namespaced event name, e.g. `encounter.began`.
    event_type: String,
    schema_version: u32,

    aggregate_id: AggregateId,
    aggregate_type: AggregateKind,
    /// Monotonically increasing position in the aggregate stream, from 1.
    aggregate_version: u64,

    /// Business time, stamped by the producing device.
    occurred_at: DateTime<FixedOffset>,
    /// System time at persistence on the producing device.
    recorded_at: DateTime<FixedOffset>,

    actor: ActorContext,
    org: OrgContext,
    device: DeviceContext,
    trace: TraceContext,

    #[serde(default)]
    visibility: Visibility,

    payload: E,
}

/// Who performed the operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
}

/// Where the operation belongs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgContext {
    pub organization_id: OrganizationId,
    pub facility_id: FacilityId,
}

/// Which device produced the event, and under what conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContext {
    pub device_id: String,
    pub connection_status: ConnectionStatus,
    /// Estimated device clock drift against the hub, in milliseconds.
    /// Subtracting it from `occurred_at` yields hub-comparable time.
    pub device_clock_drift_ms: i64,
    /// Per-device monotonic sequence, from 1, never reused.
    pub local_sequence_number: u64,
    /// Set by the sync engine when the event travels in an upload batch.
    #[serde(default)]
    pub sync_batch_id: Option<SyncBatchId>,
}

/// Causal trace of the event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub correlation_id: CorrelationId,
    /// The event that directly caused this one, when known.
    #[serde(default)]
    pub causation_id: Option<EventId>,
}

/// The persisted/transported envelope form: payload kept as JSON.
pub type StoredEnvelope = EventEnvelope<JsonValue>;

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        event_type: impl Into<String>,
        schema_version: u32,
        aggregate_id: AggregateId,
        aggregate_type: AggregateKind,
        aggregate_version: u64,
        occurred_at: DateTime<FixedOffset>,
        recorded_at: DateTime<FixedOffset>,
        actor: ActorContext,
        org: OrgContext,
        device: DeviceContext,
        trace: TraceContext,
        visibility: Visibility,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            schema_version,
            aggregate_id,
            aggregate_type,
            aggregate_version,
            occurred_at,
            recorded_at,
            actor,
            org,
            device,
            trace,
            visibility,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> AggregateKind {
        self.aggregate_type
    }

    pub fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }

    pub fn occurred_at(&self) -> DateTime<FixedOffset> {
        self.occurred_at
    }

    pub fn recorded_at(&self) -> DateTime<FixedOffset> {
        self.recorded_at
    }

    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    pub fn org(&self) -> &OrgContext {
        &self.org
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.org.organization_id
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn causation_id(&self) -> Option<EventId> {
        self.trace.causation_id
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Business time corrected by the device's drift estimate, making stamps
    /// from different devices comparable. Causal ordering rule four.
    pub fn adjusted_occurred_at(&self) -> DateTime<FixedOffset> {
        self.occurred_at - Duration::milliseconds(self.device.device_clock_drift_ms)
    }

    /// Sync upload marks the envelope with the batch it travelled in.
    pub fn with_sync_batch(mut self, batch: SyncBatchId) -> Self {
        self.device.sync_batch_id = Some(batch);
        self
    }

    /// Conflict resolution is the one place a contested event may legally be
    /// re-slotted into a stream; everything else treats versions as fixed.
    pub fn renumbered(mut self, aggregate_version: u64) -> Self {
        self.aggregate_version = aggregate_version;
        self
    }
}

impl<E: Serialize> EventEnvelope<E> {
    /// Erase the payload type for persistence/transport.
    pub fn into_stored(self) -> Result<StoredEnvelope, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type,
            schema_version: self.schema_version,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            aggregate_version: self.aggregate_version,
            occurred_at: self.occurred_at,
            recorded_at: self.recorded_at,
            actor: self.actor,
            org: self.org,
            device: self.device,
            trace: self.trace,
            visibility: self.visibility,
            payload,
        })
    }
}

impl StoredEnvelope {
    /// View the payload as a typed domain event.
    pub fn typed_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Payload-level patient reference, when the event carries one.
    /// Event-store filters use this for patient-scoped queries.
    pub fn patient_id_in_payload(&self) -> Option<AggregateId> {
        self.payload
            .get("patient_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }
}
