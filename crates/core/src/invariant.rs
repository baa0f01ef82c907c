//! Stable invariant codes carried in errors and compensation records.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Identifies the clinical rule a rejected command or flagged event violated.
///
/// Codes are stable wire identifiers (`INV-PL-2` and friends); surfaces use
/// them for localization and the compensation review queue groups by them.
/// One code per violation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InvariantCode {
    /// Patient is unknown or not yet registered.
    PatientUnknown,
    /// Patient reached a terminal state (deceased / transferred out).
    PatientTerminal,
    /// Patient is already registered.
    PatientAlreadyRegistered,
    /// Identity corrections require an active registration.
    IdentityCorrectionInactive,
    /// Contact declarations require an active registration.
    ContactDeclarationInactive,

    /// Encounter transition not permitted from the current stage.
    EncounterTransition,
    /// Check-in attempted on an encounter that already exists.
    EncounterExists,
    /// Reopen/discharge ordering violated.
    EncounterReopenOrder,

    /// Fact aggregate already holds its single event.
    FactAlreadyRecorded,
    /// Clinical content targets an encounter that is not in progress.
    EncounterNotInProgress,
    /// `occurred_at` lies beyond the future clock tolerance.
    OccurredAtTooFarAhead,

    /// Diagnosis already made.
    DiagnosisAlreadyMade,
    /// Diagnosis not yet made.
    DiagnosisNotMade,
    /// Diagnosis is resolved (terminal).
    DiagnosisResolved,
    /// Diagnosis belongs to a different patient or encounter.
    DiagnosisPatientMismatch,
    /// Treatment plan references a resolved diagnosis.
    TreatmentPlanDiagnosisResolved,

    /// Note already authored.
    NoteAlreadyAuthored,
    /// Addendum or cosign attempted before the note was authored.
    NoteNotAuthored,
    /// Cosigner equals the original author.
    SelfCosign,

    /// Appointment transition not permitted from the current stage.
    AppointmentTransition,
    /// Appointment already requested.
    AppointmentExists,
    /// Appointment reached a terminal stage.
    AppointmentTerminal,
    /// Reschedule requires a confirmed appointment.
    RescheduleUnconfirmed,

    /// Causation references form a cycle (provenance integrity violation).
    CausationCycle,
    /// Concurrent active encounters for the same patient and practitioner.
    ConcurrentEncounters,
    /// Performer role is not permitted to issue this command.
    RoleNotPermitted,
}

impl InvariantCode {
    pub const fn as_str(&self) -> &'static str {
        use InvariantCode::*;
        match self {
            PatientUnknown => "INV-PL-1",
            PatientTerminal => "INV-PL-2",
            PatientAlreadyRegistered => "INV-PL-3",
            IdentityCorrectionInactive => "INV-PL-4",
            ContactDeclarationInactive => "INV-PL-5",
            EncounterTransition => "INV-EP-1",
            EncounterExists => "INV-EP-2",
            EncounterReopenOrder => "INV-EP-3",
            FactAlreadyRecorded => "INV-CO-1",
            EncounterNotInProgress => "INV-CO-2",
            OccurredAtTooFarAhead => "INV-CO-3",
            DiagnosisAlreadyMade => "INV-CJ-1",
            DiagnosisNotMade => "INV-CJ-2",
            DiagnosisResolved => "INV-CJ-3",
            DiagnosisPatientMismatch => "INV-CJ-4",
            TreatmentPlanDiagnosisResolved => "INV-CJ-5",
            NoteAlreadyAuthored => "INV-CD-1",
            NoteNotAuthored => "INV-CD-2",
            SelfCosign => "INV-CD-3",
            AppointmentTransition => "INV-CA-1",
            AppointmentExists => "INV-CA-2",
            AppointmentTerminal => "INV-CA-3",
            RescheduleUnconfirmed => "INV-CA-4",
            CausationCycle => "INV-XX-1",
            ConcurrentEncounters => "INV-XX-2",
            RoleNotPermitted => "INV-XX-3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use InvariantCode::*;
        Some(match s {
            "INV-PL-1" => PatientUnknown,
            "INV-PL-2" => PatientTerminal,
            "INV-PL-3" => PatientAlreadyRegistered,
            "INV-PL-4" => IdentityCorrectionInactive,
            "INV-PL-5" => ContactDeclarationInactive,
            "INV-EP-1" => EncounterTransition,
            "INV-EP-2" => EncounterExists,
            "INV-EP-3" => EncounterReopenOrder,
            "INV-CO-1" => FactAlreadyRecorded,
            "INV-CO-2" => EncounterNotInProgress,
            "INV-CO-3" => OccurredAtTooFarAhead,
            "INV-CJ-1" => DiagnosisAlreadyMade,
            "INV-CJ-2" => DiagnosisNotMade,
            "INV-CJ-3" => DiagnosisResolved,
            "INV-CJ-4" => DiagnosisPatientMismatch,
            "INV-CJ-5" => TreatmentPlanDiagnosisResolved,
            "INV-CD-1" => NoteAlreadyAuthored,
            "INV-CD-2" => NoteNotAuthored,
            "INV-CD-3" => SelfCosign,
            "INV-CA-1" => AppointmentTransition,
            "INV-CA-2" => AppointmentExists,
            "INV-CA-3" => AppointmentTerminal,
            "INV-CA-4" => RescheduleUnconfirmed,
            "INV-XX-1" => CausationCycle,
            "INV-XX-2" => ConcurrentEncounters,
            "INV-XX-3" => RoleNotPermitted,
            _ => return None,
        })
    }
}

impl core::fmt::Display for InvariantCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for InvariantCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InvariantCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CodeVisitor;

        impl Visitor<'_> for CodeVisitor {
            type Value = InvariantCode;

            fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("an invariant code such as INV-PL-2")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                InvariantCode::parse(v)
                    .ok_or_else(|| E::custom(format!("unknown invariant code: {v}")))
            }
        }

        deserializer.deserialize_str(CodeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[InvariantCode] = &[
        InvariantCode::PatientUnknown,
        InvariantCode::PatientTerminal,
        InvariantCode::PatientAlreadyRegistered,
        InvariantCode::IdentityCorrectionInactive,
        InvariantCode::ContactDeclarationInactive,
        InvariantCode::EncounterTransition,
        InvariantCode::EncounterExists,
        InvariantCode::EncounterReopenOrder,
        InvariantCode::FactAlreadyRecorded,
        InvariantCode::EncounterNotInProgress,
        InvariantCode::OccurredAtTooFarAhead,
        InvariantCode::DiagnosisAlreadyMade,
        InvariantCode::DiagnosisNotMade,
        InvariantCode::DiagnosisResolved,
        InvariantCode::DiagnosisPatientMismatch,
        InvariantCode::TreatmentPlanDiagnosisResolved,
        InvariantCode::NoteAlreadyAuthored,
        InvariantCode::NoteNotAuthored,
        InvariantCode::SelfCosign,
        InvariantCode::AppointmentTransition,
        InvariantCode::AppointmentExists,
        InvariantCode::AppointmentTerminal,
        InvariantCode::RescheduleUnconfirmed,
        InvariantCode::CausationCycle,
        InvariantCode::ConcurrentEncounters,
        InvariantCode::RoleNotPermitted,
    ];

    #[test]
    fn codes_round_trip() {
        for code in ALL {
            assert_eq!(InvariantCode::parse(code.as_str()), Some(*code));
        }
    }

    #[test]
    fn codes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.as_str()), "duplicate code {code}");
        }
    }
}
