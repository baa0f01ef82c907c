//! Envelope constructors for store and dispatcher tests.

use chrono::{TimeZone, Utc};
use serde_json::json;

use caresync_core::{
    AggregateId, AggregateKind, ConnectionStatus, CorrelationId, EventId, FacilityId,
    OrganizationId, PerformerId, PerformerRole, Visibility,
};
use caresync_events::{ActorContext, DeviceContext, EventEnvelope, OrgContext, StoredEnvelope, TraceContext};

pub fn envelope_for_stream(
    aggregate_type: AggregateKind,
    aggregate_id: AggregateId,
    aggregate_version: u64,
    organization_id: OrganizationId,
    device_id: &str,
    lsn: u64,
) -> StoredEnvelope {
    let at = Utc
        .with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
        .unwrap()
        .fixed_offset()
        + chrono::Duration::seconds(lsn as i64);
    EventEnvelope::new(
        EventId::new(),
        format!("{}.test", aggregate_type.as_str()),
        1,
        aggregate_id,
        aggregate_type,
        aggregate_version,
        at,
        at,
        ActorContext {
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Nurse,
        },
        OrgContext {
            organization_id,
            facility_id: FacilityId::new(),
        },
        DeviceContext {
            device_id: device_id.to_string(),
            connection_status: ConnectionStatus::Offline,
            device_clock_drift_ms: 0,
            local_sequence_number: lsn,
            sync_batch_id: None,
        },
        TraceContext {
            correlation_id: CorrelationId::new(),
            causation_id: None,
        },
        Visibility::clinical(),
        json!({"patient_id": AggregateId::new().to_string()}),
    )
}
