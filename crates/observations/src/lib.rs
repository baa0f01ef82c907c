//! Fact aggregates: single-event clinical observations.

mod fact;

pub mod examination;
pub mod lab_result;
pub mod procedure;
pub mod referral;
pub mod symptom;
pub mod treatment_plan;
pub mod vital_signs;

pub use examination::{
    ExaminationFinding, ExaminationFindingId, ExaminationFindingPayload,
    ExaminationFindingRecorded, RecordExaminationFinding,
};
pub use lab_result::{LabResult, LabResultId, LabResultPayload, LabResultRecorded, RecordLabResult};
pub use procedure::{Procedure, ProcedureId, ProcedurePayload, ProcedurePerformed, RecordProcedure};
pub use referral::{IssueReferral, Referral, ReferralId, ReferralIssued, ReferralPayload, ReferralUrgency};
pub use symptom::{ReportSymptom, Symptom, SymptomId, SymptomPayload, SymptomReported};
pub use treatment_plan::{
    PrescribeTreatmentPlan, TreatmentPlan, TreatmentPlanId, TreatmentPlanPayload,
    TreatmentPlanPrescribed,
};
pub use vital_signs::{
    RecordVitalSigns, VitalSigns, VitalSignsId, VitalSignsPayload, VitalSignsRecorded,
};
