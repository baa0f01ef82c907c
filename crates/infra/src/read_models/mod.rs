//! Handler-internal read models.
//!
//! Five deterministic projections consulted by the command handler for
//! cross-aggregate precondition checks and by the compensation engine at
//! sync time. They are not end-user views: each holds the minimal status a
//! check needs, keyed by aggregate id (performer id for roles), isolated per
//! organization, fed only by the dispatcher, and rebuildable by replay.

pub mod appointment_status;
pub mod diagnosis_status;
pub mod encounter_state;
pub mod patient_status;
pub mod performer_role;

use std::sync::Arc;

use caresync_core::{AggregateId, AggregateKind, OrganizationId, PerformerId};
use caresync_events::Projection;

use crate::event_store::EventStore;

pub use appointment_status::{AppointmentStatusProjection, AppointmentStatusRow};
pub use diagnosis_status::{DiagnosisStatusProjection, DiagnosisStatusRow};
pub use encounter_state::{EncounterStateProjection, EncounterStateRow};
pub use patient_status::{PatientStatusProjection, PatientStatusRow};
pub use performer_role::PerformerRoleProjection;

use caresync_diagnostics::DiagnosisStage;
use caresync_encounters::EncounterStage;
use caresync_patients::RegistrationStage;
use caresync_scheduling::AppointmentStage;

/// Bundle of the five handler read models.
#[derive(Clone)]
pub struct ReadModels {
    pub patient_status: Arc<PatientStatusProjection>,
    pub encounter_state: Arc<EncounterStateProjection>,
    pub diagnosis_status: Arc<DiagnosisStatusProjection>,
    pub appointment_status: Arc<AppointmentStatusProjection>,
    pub performer_role: Arc<PerformerRoleProjection>,
}

impl ReadModels {
    pub fn new() -> Self {
        Self {
            patient_status: Arc::new(PatientStatusProjection::new()),
            encounter_state: Arc::new(EncounterStateProjection::new()),
            diagnosis_status: Arc::new(DiagnosisStatusProjection::new()),
            appointment_status: Arc::new(AppointmentStatusProjection::new()),
            performer_role: Arc::new(PerformerRoleProjection::new()),
        }
    }

    /// All five, for dispatcher registration.
    pub fn projections(&self) -> Vec<Arc<dyn Projection>> {
        vec![
            self.patient_status.clone(),
            self.encounter_state.clone(),
            self.diagnosis_status.clone(),
            self.appointment_status.clone(),
            self.performer_role.clone(),
        ]
    }

    pub fn patient_stage(
        &self,
        organization_id: OrganizationId,
        patient_id: AggregateId,
    ) -> Option<RegistrationStage> {
        self.patient_status
            .get(organization_id, patient_id)
            .map(|row| row.stage)
    }

    pub fn encounter(
        &self,
        organization_id: OrganizationId,
        encounter_id: AggregateId,
    ) -> Option<EncounterStateRow> {
        self.encounter_state.get(organization_id, encounter_id)
    }

    /// Encounters currently active for the same patient and practitioner.
    pub fn active_encounters_for(
        &self,
        organization_id: OrganizationId,
        patient_id: AggregateId,
        attending: PerformerId,
    ) -> Vec<EncounterStateRow> {
        self.encounter_state
            .list(organization_id)
            .into_iter()
            .filter(|row| {
                row.patient_id == patient_id
                    && row.attending == attending
                    && row.stage.is_active()
            })
            .collect()
    }

    pub fn diagnosis_stage(
        &self,
        organization_id: OrganizationId,
        diagnosis_id: AggregateId,
    ) -> Option<DiagnosisStage> {
        self.diagnosis_status
            .get(organization_id, diagnosis_id)
            .map(|row| row.stage)
    }

    pub fn appointment_stage(
        &self,
        organization_id: OrganizationId,
        appointment_id: AggregateId,
    ) -> Option<AppointmentStage> {
        self.appointment_status
            .get(organization_id, appointment_id)
            .map(|row| row.stage)
    }

    pub fn encounter_stage(
        &self,
        organization_id: OrganizationId,
        encounter_id: AggregateId,
    ) -> Option<EncounterStage> {
        self.encounter(organization_id, encounter_id)
            .map(|row| row.stage)
    }

    /// Re-derive one aggregate's row after conflict resolution restructured
    /// its stream. Watermarks are version-based and a restructured stream
    /// reuses version slots, so the row is rebuilt from scratch.
    pub fn rebuild_stream(
        &self,
        store: &dyn EventStore,
        kind: AggregateKind,
        aggregate_id: AggregateId,
    ) {
        let Ok(stream) = store.read_stream(kind, aggregate_id) else {
            return;
        };
        let Some(first) = stream.first() else {
            return;
        };
        let org = first.organization_id();

        match kind {
            AggregateKind::PatientRegistration => {
                self.patient_status.reset(org, aggregate_id);
                for envelope in &stream {
                    let _ = self.patient_status.apply(envelope);
                }
            }
            AggregateKind::Encounter => {
                self.encounter_state.reset(org, aggregate_id);
                for envelope in &stream {
                    let _ = self.encounter_state.apply(envelope);
                }
            }
            AggregateKind::Diagnosis => {
                self.diagnosis_status.reset(org, aggregate_id);
                for envelope in &stream {
                    let _ = self.diagnosis_status.apply(envelope);
                }
            }
            AggregateKind::Appointment => {
                self.appointment_status.reset(org, aggregate_id);
                for envelope in &stream {
                    let _ = self.appointment_status.apply(envelope);
                }
            }
            _ => {}
        }
    }
}

impl Default for ReadModels {
    fn default() -> Self {
        Self::new()
    }
}
