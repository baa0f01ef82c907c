//! Clinical judgment aggregates: diagnoses and allergy records.

pub mod allergy;
pub mod diagnosis;

pub use allergy::{
    AllergyCommand, AllergyEvent, AllergyRecord, AllergyRecordId, AllergyStage, IdentifyAllergy,
    RefuteAllergy,
};
pub use diagnosis::{
    Diagnosis, DiagnosisCommand, DiagnosisEvent, DiagnosisId, DiagnosisStage, MakeDiagnosis,
    ResolveDiagnosis, ReviseDiagnosis,
};
