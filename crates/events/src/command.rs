use chrono::{DateTime, Utc};

use caresync_core::{
    AggregateId, CorrelationId, EventId, FacilityId, OrganizationId, PerformerId, PerformerRole,
};

/// A command targets a specific aggregate.
///
/// Commands represent intent; they are transient and carry no event-level
/// metadata (no event id, no stream version). Validation rejects them;
/// accepted commands turn into events.
///
/// Each command operates on exactly one aggregate, which is the transaction
/// boundary: different aggregates process commands concurrently, and the
/// optimistic-concurrency retry loop serializes writers within one stream.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}

/// Request context attached to a command by the gateway.
///
/// Actor, organization, and trace data live here rather than on the command
/// payload; the handler stamps them onto the emitted envelopes. Device
/// context (id, sequence, drift) is added at stamping time by the device
/// session, which owns those counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub organization_id: OrganizationId,
    pub facility_id: FacilityId,
    /// Minted by the handler when absent.
    pub correlation_id: Option<CorrelationId>,
    /// The event that led to this command, when it is a follow-up.
    pub causation_id: Option<EventId>,
    /// Honored between handler retries; expiry surfaces as a transient error.
    pub deadline: Option<DateTime<Utc>>,
}

impl CommandContext {
    pub fn new(
        performed_by: PerformerId,
        performer_role: PerformerRole,
        organization_id: OrganizationId,
        facility_id: FacilityId,
    ) -> Self {
        Self {
            performed_by,
            performer_role,
            organization_id,
            facility_id,
            correlation_id: None,
            causation_id: None,
            deadline: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
