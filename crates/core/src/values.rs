//! Shared value enums with domain meaning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The fourteen clinical aggregate kinds plus the internal compensation
/// stream. One physical stream exists per `(AggregateKind, AggregateId)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    PatientRegistration,
    Encounter,
    Diagnosis,
    ClinicalNote,
    Appointment,
    AllergyRecord,
    DuplicateResolution,
    VitalSigns,
    Symptom,
    ExaminationFinding,
    LabResult,
    Procedure,
    Referral,
    TreatmentPlan,
    /// Review items emitted by the compensation engine; not commandable.
    CompensationCase,
}

impl AggregateKind {
    pub const fn as_str(&self) -> &'static str {
        use AggregateKind::*;
        match self {
            PatientRegistration => "patient_registration",
            Encounter => "encounter",
            Diagnosis => "diagnosis",
            ClinicalNote => "clinical_note",
            Appointment => "appointment",
            AllergyRecord => "allergy_record",
            DuplicateResolution => "duplicate_resolution",
            VitalSigns => "vital_signs",
            Symptom => "symptom",
            ExaminationFinding => "examination_finding",
            LabResult => "lab_result",
            Procedure => "procedure",
            Referral => "referral",
            TreatmentPlan => "treatment_plan",
            CompensationCase => "compensation_case",
        }
    }

    /// Fact aggregates hold exactly one event and are frozen afterwards.
    pub const fn is_fact(&self) -> bool {
        use AggregateKind::*;
        matches!(
            self,
            VitalSigns
                | Symptom
                | ExaminationFinding
                | LabResult
                | Procedure
                | Referral
                | TreatmentPlan
        )
    }
}

impl core::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clinical role of the actor issuing a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformerRole {
    Physician,
    Nurse,
    MedicalAssistant,
    FrontDesk,
    Administrator,
}

impl PerformerRole {
    /// Roles allowed to author clinical content (notes, observations).
    pub const fn is_clinical(&self) -> bool {
        matches!(
            self,
            Self::Physician | Self::Nurse | Self::MedicalAssistant
        )
    }
}

/// Connectivity of the producing device at event creation time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Audience tags gating who may see an event.
///
/// Single enumeration point for the visibility vocabulary; `Part2Restricted`
/// marks substance-use records under 42 CFR Part 2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceTag {
    Clinical,
    Billing,
    PatientPortal,
    Part2Restricted,
}

/// Set of audience tags stamped on an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Visibility(BTreeSet<AudienceTag>);

impl Visibility {
    pub fn new(tags: impl IntoIterator<Item = AudienceTag>) -> Self {
        Self(tags.into_iter().collect())
    }

    /// Baseline for clinical events.
    pub fn clinical() -> Self {
        Self::new([AudienceTag::Clinical])
    }

    pub fn with(mut self, tag: AudienceTag) -> Self {
        self.0.insert(tag);
        self
    }

    pub fn contains(&self, tag: AudienceTag) -> bool {
        self.0.contains(&tag)
    }

    /// An empty mask matches everything; otherwise at least one tag must be
    /// shared. Used by event-store filters and the sync download phase.
    pub fn intersects(&self, mask: &Visibility) -> bool {
        mask.0.is_empty() || self.0.iter().any(|t| mask.0.contains(t))
    }

    pub fn iter(&self) -> impl Iterator<Item = AudienceTag> + '_ {
        self.0.iter().copied()
    }
}
