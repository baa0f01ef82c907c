//! Typed command union routed by the gateway.

use caresync_core::{AggregateId, AggregateKind};
use caresync_diagnostics::{AllergyCommand, DiagnosisCommand};
use caresync_encounters::{EncounterCommand, NoteCommand};
use caresync_events::Command;
use caresync_observations::{
    IssueReferral, PrescribeTreatmentPlan, RecordExaminationFinding, RecordLabResult,
    RecordProcedure, RecordVitalSigns, ReportSymptom,
};
use caresync_patients::{DuplicateCommand, PatientCommand};
use caresync_scheduling::AppointmentCommand;

/// Every command the gateway can route. One variant per aggregate kind;
/// each inner command kind maps to exactly one event kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ClinicalCommand {
    Patient(PatientCommand),
    Duplicate(DuplicateCommand),
    Encounter(EncounterCommand),
    Note(NoteCommand),
    Diagnosis(DiagnosisCommand),
    Allergy(AllergyCommand),
    Appointment(AppointmentCommand),
    VitalSigns(RecordVitalSigns),
    Symptom(ReportSymptom),
    Examination(RecordExaminationFinding),
    LabResult(RecordLabResult),
    Procedure(RecordProcedure),
    Referral(IssueReferral),
    TreatmentPlan(PrescribeTreatmentPlan),
}

impl ClinicalCommand {
    pub fn aggregate_kind(&self) -> AggregateKind {
        match self {
            Self::Patient(_) => AggregateKind::PatientRegistration,
            Self::Duplicate(_) => AggregateKind::DuplicateResolution,
            Self::Encounter(_) => AggregateKind::Encounter,
            Self::Note(_) => AggregateKind::ClinicalNote,
            Self::Diagnosis(_) => AggregateKind::Diagnosis,
            Self::Allergy(_) => AggregateKind::AllergyRecord,
            Self::Appointment(_) => AggregateKind::Appointment,
            Self::VitalSigns(_) => AggregateKind::VitalSigns,
            Self::Symptom(_) => AggregateKind::Symptom,
            Self::Examination(_) => AggregateKind::ExaminationFinding,
            Self::LabResult(_) => AggregateKind::LabResult,
            Self::Procedure(_) => AggregateKind::Procedure,
            Self::Referral(_) => AggregateKind::Referral,
            Self::TreatmentPlan(_) => AggregateKind::TreatmentPlan,
        }
    }

    pub fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Patient(c) => c.target_aggregate_id(),
            Self::Duplicate(c) => c.target_aggregate_id(),
            Self::Encounter(c) => c.target_aggregate_id(),
            Self::Note(c) => c.target_aggregate_id(),
            Self::Diagnosis(c) => c.target_aggregate_id(),
            Self::Allergy(c) => c.target_aggregate_id(),
            Self::Appointment(c) => c.target_aggregate_id(),
            Self::VitalSigns(c) => c.target_aggregate_id(),
            Self::Symptom(c) => c.target_aggregate_id(),
            Self::Examination(c) => c.target_aggregate_id(),
            Self::LabResult(c) => c.target_aggregate_id(),
            Self::Procedure(c) => c.target_aggregate_id(),
            Self::Referral(c) => c.target_aggregate_id(),
            Self::TreatmentPlan(c) => c.target_aggregate_id(),
        }
    }
}
