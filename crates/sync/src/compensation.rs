//! Eventual-consistency violation detection at sync time.
//!
//! Runs on the hub for each uploaded event that passed its per-stream
//! version check. A violated cross-aggregate rule never rejects the event —
//! the engine emits a `CompensationRequired` review item, and for the one
//! unambiguous case (scheduling activity for a terminal patient) also the
//! compensating domain event. The original event is never modified.
//!
//! Review items are events themselves, on a dedicated stream per original
//! event. Their ids derive deterministically from the original event id and
//! invariant code, so re-running an upload re-emits the same envelopes and
//! the store's idempotent append collapses them.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::info;
use uuid::Uuid;

use caresync_core::{
    AggregateId, AggregateKind, ConnectionStatus, EventId, InvariantCode, PerformerId,
    PerformerRole, Visibility,
};
use caresync_events::{
    ActorContext, DeviceContext, EventEnvelope, OrgContext, StoredEnvelope, TraceContext,
};
use caresync_infra::{DeviceSession, EventStore, ReadModels};

use caresync_diagnostics::DiagnosisStage;
use caresync_scheduling::appointment::AppointmentCancelledByPractice;
use caresync_scheduling::{AppointmentId, AppointmentStage};

pub const COMPENSATION_EVENT_TYPE: &str = "compensation.review_required";

// Name-based namespaces for deterministic compensation identities.
const NS_CASE: Uuid = Uuid::from_u128(0x8f2c_1b6a_42d3_4c8e_9a17_52e0c4a6d901);
const NS_REVIEW: Uuid = Uuid::from_u128(0x3d94_7a0e_5b21_4f6c_8e55_b9d2f7c31a02);
const NS_AUTO: Uuid = Uuid::from_u128(0x61e8_3c5f_9d07_4b2a_bd39_04a8e6f5c703);

/// Payload of a review item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRequired {
    pub original_event_id: EventId,
    pub invariant_code: InvariantCode,
    /// What the producing device believed; for state-machine rejections
    /// this is the contested envelope verbatim.
    pub stale_snapshot: JsonValue,
    /// The hub's view at detection time.
    pub current_snapshot: JsonValue,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Detects violations and builds the envelopes to append.
pub struct CompensationEngine {
    read_models: ReadModels,
    hub_session: std::sync::Arc<DeviceSession>,
    clock: std::sync::Arc<dyn caresync_core::Clock>,
}

impl CompensationEngine {
    pub fn new(
        read_models: ReadModels,
        hub_session: std::sync::Arc<DeviceSession>,
        clock: std::sync::Arc<dyn caresync_core::Clock>,
    ) -> Self {
        Self {
            read_models,
            hub_session,
            clock,
        }
    }

    /// Cross-aggregate checks for one accepted upload. Returns envelopes
    /// ready to append: review items, plus the auto-compensating event where
    /// policy allows one.
    pub fn check<S: EventStore>(&self, envelope: &StoredEnvelope, store: &S) -> Vec<StoredEnvelope> {
        let mut emitted = Vec::new();
        let org = envelope.organization_id();

        match envelope.aggregate_type() {
            AggregateKind::Appointment => {
                if matches!(
                    envelope.event_type(),
                    "appointment.requested" | "appointment.confirmed" | "appointment.rescheduled"
                ) {
                    if let Some(patient_id) = envelope.patient_id_in_payload() {
                        if let Some(stage) = self.read_models.patient_stage(org, patient_id) {
                            if stage.is_terminal() {
                                emitted.extend(self.review(
                                    envelope,
                                    InvariantCode::PatientTerminal,
                                    json!({"patient_stage": stage}),
                                    store,
                                ));
                                emitted.extend(self.auto_cancel_appointment(envelope, store));
                            }
                        }
                    }
                }
            }

            AggregateKind::Diagnosis => {
                if let Some(patient_id) = envelope.patient_id_in_payload() {
                    if let Some(stage) = self.read_models.patient_stage(org, patient_id) {
                        if stage.is_terminal() {
                            emitted.extend(self.review(
                                envelope,
                                InvariantCode::PatientTerminal,
                                json!({"patient_stage": stage}),
                                store,
                            ));
                        }
                    }
                }
                if envelope.event_type() == "diagnosis.made" {
                    emitted.extend(self.check_encounter_open(envelope, store));
                }
            }

            AggregateKind::ClinicalNote => {
                if envelope.event_type() == "clinical_note.authored" {
                    emitted.extend(self.check_encounter_open(envelope, store));
                }
            }

            kind if kind.is_fact() => {
                emitted.extend(self.check_encounter_open(envelope, store));
                if kind == AggregateKind::TreatmentPlan {
                    emitted.extend(self.check_treatment_plan_diagnosis(envelope, store));
                }
            }

            AggregateKind::Encounter => {
                if envelope.event_type() == "encounter.checked_in" {
                    emitted.extend(self.check_concurrent_encounters(envelope, store));
                }
            }

            _ => {}
        }

        emitted
    }

    /// Review item for a state-machine rejection during conflict
    /// resolution; preserves the contested envelope verbatim.
    pub fn review_for_rejection<S: EventStore>(
        &self,
        contested: &StoredEnvelope,
        code: InvariantCode,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let current = json!({
            "stream": contested.aggregate_type(),
            "aggregate_id": contested.aggregate_id(),
        });
        self.review(contested, code, current, store)
    }

    fn check_encounter_open<S: EventStore>(
        &self,
        envelope: &StoredEnvelope,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let Some(encounter_id) = payload_id(envelope, "encounter_id") else {
            return vec![];
        };
        match self
            .read_models
            .encounter_stage(envelope.organization_id(), encounter_id)
        {
            Some(stage) if !stage.in_progress() => self.review(
                envelope,
                InvariantCode::EncounterNotInProgress,
                json!({"encounter_stage": stage}),
                store,
            ),
            _ => vec![],
        }
    }

    fn check_treatment_plan_diagnosis<S: EventStore>(
        &self,
        envelope: &StoredEnvelope,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let Some(diagnosis_id) = envelope
            .payload()
            .get("payload")
            .and_then(|p| p.get("diagnosis_id"))
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse::<AggregateId>().ok())
        else {
            return vec![];
        };
        match self
            .read_models
            .diagnosis_stage(envelope.organization_id(), diagnosis_id)
        {
            Some(DiagnosisStage::Resolved) => self.review(
                envelope,
                InvariantCode::TreatmentPlanDiagnosisResolved,
                json!({"diagnosis_stage": DiagnosisStage::Resolved}),
                store,
            ),
            _ => vec![],
        }
    }

    fn check_concurrent_encounters<S: EventStore>(
        &self,
        envelope: &StoredEnvelope,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let (Some(patient_id), Some(attending)) = (
            envelope.patient_id_in_payload(),
            payload_performer(envelope, "attending"),
        ) else {
            return vec![];
        };
        let others: Vec<AggregateId> = self
            .read_models
            .active_encounters_for(envelope.organization_id(), patient_id, attending)
            .into_iter()
            .filter(|row| row.encounter_id != envelope.aggregate_id())
            .map(|row| row.encounter_id)
            .collect();
        if others.is_empty() {
            return vec![];
        }
        self.review(
            envelope,
            InvariantCode::ConcurrentEncounters,
            json!({"active_encounters": others}),
            store,
        )
    }

    /// Build (and dedupe) one review envelope.
    fn review<S: EventStore>(
        &self,
        original: &StoredEnvelope,
        code: InvariantCode,
        current_snapshot: JsonValue,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let review_id = derive_event_id(NS_REVIEW, original.event_id(), code);
        if store.exists(review_id).unwrap_or(false) {
            return vec![];
        }

        info!(
            original = %original.event_id(),
            code = %code,
            "eventual-consistency violation; queueing review item"
        );

        let case_id = derive_aggregate_id(NS_CASE, original.event_id(), code);
        let now = self.clock.now().fixed_offset();
        let payload = CompensationRequired {
            original_event_id: original.event_id(),
            invariant_code: code,
            stale_snapshot: serde_json::to_value(original).unwrap_or(JsonValue::Null),
            current_snapshot,
            occurred_at: now,
        };

        vec![self.hub_envelope(
            review_id,
            COMPENSATION_EVENT_TYPE,
            case_id,
            AggregateKind::CompensationCase,
            1,
            now,
            original,
            serde_json::to_value(&payload).unwrap_or(JsonValue::Null),
        )]
    }

    /// Unambiguous policy case: scheduling activity for a terminal patient
    /// is cancelled by the practice automatically.
    fn auto_cancel_appointment<S: EventStore>(
        &self,
        original: &StoredEnvelope,
        store: &S,
    ) -> Vec<StoredEnvelope> {
        let appointment_id = original.aggregate_id();
        let org = original.organization_id();

        let auto_id = derive_event_id(NS_AUTO, original.event_id(), InvariantCode::PatientTerminal);
        if store.exists(auto_id).unwrap_or(false) {
            return vec![];
        }
        // Only an open appointment needs cancelling.
        match self.read_models.appointment_stage(org, appointment_id) {
            Some(stage) if stage.is_open() => {}
            Some(AppointmentStage::NotRequested) | None => {}
            _ => return vec![],
        }

        let Some(patient_id) = original.patient_id_in_payload() else {
            return vec![];
        };
        let stream_len = match store.read_stream(AggregateKind::Appointment, appointment_id) {
            Ok(stream) => stream.len() as u64,
            Err(_) => return vec![],
        };

        let now = self.clock.now().fixed_offset();
        let event = AppointmentCancelledByPractice {
            appointment_id: AppointmentId(appointment_id),
            patient_id,
            reason: "patient registration is terminal".to_string(),
            occurred_at: now,
        };
        let payload = serde_json::to_value(caresync_scheduling::AppointmentEvent::CancelledByPractice(
            event,
        ))
        .unwrap_or(JsonValue::Null);

        vec![self.hub_envelope(
            auto_id,
            "appointment.cancelled_by_practice",
            appointment_id,
            AggregateKind::Appointment,
            stream_len + 1,
            now,
            original,
            payload,
        )]
    }

    #[allow(clippy::too_many_arguments)]
    fn hub_envelope(
        &self,
        event_id: EventId,
        event_type: &str,
        aggregate_id: AggregateId,
        aggregate_type: AggregateKind,
        aggregate_version: u64,
        now: DateTime<FixedOffset>,
        original: &StoredEnvelope,
        payload: JsonValue,
    ) -> StoredEnvelope {
        EventEnvelope::new(
            event_id,
            event_type,
            1,
            aggregate_id,
            aggregate_type,
            aggregate_version,
            now,
            now,
            ActorContext {
                performed_by: PerformerId::from_uuid(Uuid::nil()),
                performer_role: PerformerRole::Administrator,
            },
            *original.org(),
            DeviceContext {
                device_id: self.hub_session.device_id().to_string(),
                connection_status: ConnectionStatus::Online,
                device_clock_drift_ms: 0,
                local_sequence_number: self.hub_session.next_lsn(),
                sync_batch_id: original.device().sync_batch_id,
            },
            TraceContext {
                correlation_id: original.trace().correlation_id,
                causation_id: Some(original.event_id()),
            },
            Visibility::clinical(),
            payload,
        )
    }
}

fn derive_event_id(namespace: Uuid, original: EventId, code: InvariantCode) -> EventId {
    let mut name = original.as_uuid().as_bytes().to_vec();
    name.extend_from_slice(code.as_str().as_bytes());
    EventId::from_uuid(Uuid::new_v5(&namespace, &name))
}

fn derive_aggregate_id(namespace: Uuid, original: EventId, code: InvariantCode) -> AggregateId {
    let mut name = original.as_uuid().as_bytes().to_vec();
    name.extend_from_slice(code.as_str().as_bytes());
    AggregateId::from_uuid(Uuid::new_v5(&namespace, &name))
}

fn payload_id(envelope: &StoredEnvelope, field: &str) -> Option<AggregateId> {
    envelope
        .payload()
        .get(field)
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
}

fn payload_performer(envelope: &StoredEnvelope, field: &str) -> Option<PerformerId> {
    envelope
        .payload()
        .get(field)
        .and_then(JsonValue::as_str)
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensation_identities_are_deterministic() {
        let original = EventId::new();
        let a = derive_event_id(NS_REVIEW, original, InvariantCode::PatientTerminal);
        let b = derive_event_id(NS_REVIEW, original, InvariantCode::PatientTerminal);
        let c = derive_event_id(NS_REVIEW, original, InvariantCode::EncounterNotInProgress);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
