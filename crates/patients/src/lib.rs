//! Patient lifecycle aggregates: registration and duplicate resolution.

pub mod duplicate;
pub mod patient;

pub use duplicate::{
    ConfirmDistinct, ConfirmDuplicate, DuplicateCommand, DuplicateEvent, DuplicateResolution,
    DuplicateResolutionId, ReportDuplicate, ResolutionStage,
};
pub use patient::{
    CorrectPatientIdentity, DeclareContactInfo, PatientCommand, PatientEvent, PatientId,
    PatientRegistration, RecordPatientDeath, RegisterPatient, RegistrationStage,
    TransferPatientOut,
};
