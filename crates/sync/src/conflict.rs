//! Conflict resolution for contested lifecycle streams.
//!
//! Triggered when two devices wrote to the same aggregate while
//! partitioned. The resolver is a pure function over the union of the
//! existing stream and the contested events: causal-sort the set, replay it
//! against the aggregate's state machine, admit what the machine permits
//! (renumbered consecutively), classify repeats of an already-performed
//! transition as duplicates, and reject the rest with their invariant code.
//!
//! Purity is the convergence argument: hub and device run the same function
//! over the same event set and reach byte-identical streams, regardless of
//! which side saw which event first. Nothing is ever silently discarded —
//! the caller preserves every rejected envelope in a compensation record.

use std::collections::{HashMap, HashSet};

use caresync_core::{
    AggregateId, AggregateKind, DomainError, EventId, InvariantCode, StateMachine,
};
use caresync_events::causal::{CausalOrderError, causal_sort};
use caresync_events::StoredEnvelope;

use caresync_diagnostics::{AllergyRecord, AllergyRecordId, Diagnosis, DiagnosisId};
use caresync_encounters::{ClinicalNote, ClinicalNoteId, Encounter, EncounterId};
use caresync_observations::{
    ExaminationFinding, ExaminationFindingId, LabResult, LabResultId, Procedure, ProcedureId,
    Referral, ReferralId, Symptom, SymptomId, TreatmentPlan, TreatmentPlanId, VitalSigns,
    VitalSignsId,
};
use caresync_patients::{
    DuplicateResolution, DuplicateResolutionId, PatientId, PatientRegistration,
};
use caresync_scheduling::{Appointment, AppointmentId};

/// Outcome of resolving one stream's event set.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    /// The stream's new composition, renumbered 1..=n in causal order.
    pub accepted: Vec<StoredEnvelope>,
    /// Events repeating a transition another event already performs.
    pub duplicates: Vec<EventId>,
    /// Events the state machine refuses, with the violated invariant.
    pub rejected: Vec<(StoredEnvelope, InvariantCode)>,
}

impl ResolvedStream {
    pub fn version_of(&self, event_id: EventId) -> Option<u64> {
        self.accepted
            .iter()
            .find(|e| e.event_id() == event_id)
            .map(|e| e.aggregate_version())
    }
}

/// Resolve the union of a stream's persisted events and any contested ones.
///
/// Deduplicates by event id before ordering. A causation cycle poisons the
/// whole set (the caller flags it for review); it is never reordered
/// around.
pub fn resolve_set(events: Vec<StoredEnvelope>) -> Result<ResolvedStream, CausalOrderError> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(events.len());
    for event in events {
        if seen.insert(event.event_id()) {
            unique.push(event);
        }
    }

    let Some(first) = unique.first() else {
        return Ok(ResolvedStream {
            accepted: vec![],
            duplicates: vec![],
            rejected: vec![],
        });
    };
    let kind = first.aggregate_type();
    let aggregate_id = first.aggregate_id();

    let ordered = causal_sort(unique)?;

    let mut machine = Machine::new(kind, aggregate_id);
    let mut accepted: Vec<StoredEnvelope> = Vec::with_capacity(ordered.len());
    let mut applied_types: HashMap<String, u32> = HashMap::new();
    let mut duplicates = Vec::new();
    let mut rejected = Vec::new();

    for envelope in ordered {
        match machine.admit(&envelope) {
            Ok(()) => {
                applied_types
                    .entry(envelope.event_type().to_string())
                    .and_modify(|n| *n += 1)
                    .or_insert(1);
                let version = accepted.len() as u64 + 1;
                accepted.push(envelope.renumbered(version));
            }
            Err(err) => {
                // Same transition already performed from this state: the
                // first in causal order wins, the rest are duplicates.
                if applied_types.contains_key(envelope.event_type()) {
                    duplicates.push(envelope.event_id());
                } else {
                    let code = err
                        .invariant_code()
                        .unwrap_or(InvariantCode::CausationCycle);
                    rejected.push((envelope, code));
                }
            }
        }
    }

    Ok(ResolvedStream {
        accepted,
        duplicates,
        rejected,
    })
}

/// Typed state-machine wrapper over the stored-envelope representation.
enum Machine {
    Patient(PatientRegistration),
    Duplicate(DuplicateResolution),
    Encounter(Encounter),
    Note(ClinicalNote),
    Diagnosis(Diagnosis),
    Allergy(AllergyRecord),
    Appointment(Appointment),
    VitalSigns(VitalSigns),
    Symptom(Symptom),
    Examination(ExaminationFinding),
    LabResult(LabResult),
    Procedure(Procedure),
    Referral(Referral),
    TreatmentPlan(TreatmentPlan),
    /// Compensation streams hold a single deterministic event each.
    Compensation { recorded: bool },
}

impl Machine {
    fn new(kind: AggregateKind, id: AggregateId) -> Self {
        use AggregateKind::*;
        match kind {
            PatientRegistration => {
                Self::Patient(caresync_patients::PatientRegistration::empty(PatientId::new(id)))
            }
            DuplicateResolution => Self::Duplicate(
                caresync_patients::DuplicateResolution::empty(DuplicateResolutionId(id)),
            ),
            Encounter => Self::Encounter(caresync_encounters::Encounter::empty(EncounterId(id))),
            ClinicalNote => {
                Self::Note(caresync_encounters::ClinicalNote::empty(ClinicalNoteId(id)))
            }
            Diagnosis => Self::Diagnosis(caresync_diagnostics::Diagnosis::empty(DiagnosisId(id))),
            AllergyRecord => {
                Self::Allergy(caresync_diagnostics::AllergyRecord::empty(AllergyRecordId(id)))
            }
            Appointment => {
                Self::Appointment(caresync_scheduling::Appointment::empty(AppointmentId(id)))
            }
            VitalSigns => {
                Self::VitalSigns(caresync_observations::VitalSigns::empty(VitalSignsId(id)))
            }
            Symptom => Self::Symptom(caresync_observations::Symptom::empty(SymptomId(id))),
            ExaminationFinding => Self::Examination(
                caresync_observations::ExaminationFinding::empty(ExaminationFindingId(id)),
            ),
            LabResult => Self::LabResult(caresync_observations::LabResult::empty(LabResultId(id))),
            Procedure => Self::Procedure(caresync_observations::Procedure::empty(ProcedureId(id))),
            Referral => Self::Referral(caresync_observations::Referral::empty(ReferralId(id))),
            TreatmentPlan => {
                Self::TreatmentPlan(caresync_observations::TreatmentPlan::empty(TreatmentPlanId(id)))
            }
            CompensationCase => Self::Compensation { recorded: false },
        }
    }

    /// Check the envelope against the state machine and, if permitted,
    /// evolve.
    fn admit(&mut self, envelope: &StoredEnvelope) -> Result<(), DomainError> {
        fn step<A>(aggregate: &mut A, envelope: &StoredEnvelope) -> Result<(), DomainError>
        where
            A: StateMachine,
            A::Event: serde::de::DeserializeOwned,
        {
            let event: A::Event = envelope
                .typed_payload()
                .map_err(|e| DomainError::validation(format!("undecodable payload: {e}")))?;
            aggregate.permits(&event)?;
            aggregate.apply(&event);
            Ok(())
        }

        match self {
            Self::Patient(a) => step(a, envelope),
            Self::Duplicate(a) => step(a, envelope),
            Self::Encounter(a) => step(a, envelope),
            Self::Note(a) => step(a, envelope),
            Self::Diagnosis(a) => step(a, envelope),
            Self::Allergy(a) => step(a, envelope),
            Self::Appointment(a) => step(a, envelope),
            Self::VitalSigns(a) => step(a, envelope),
            Self::Symptom(a) => step(a, envelope),
            Self::Examination(a) => step(a, envelope),
            Self::LabResult(a) => step(a, envelope),
            Self::Procedure(a) => step(a, envelope),
            Self::Referral(a) => step(a, envelope),
            Self::TreatmentPlan(a) => step(a, envelope),
            Self::Compensation { recorded } => {
                if *recorded {
                    Err(DomainError::invariant(
                        InvariantCode::FactAlreadyRecorded,
                        "compensation case already recorded",
                    ))
                } else {
                    *recorded = true;
                    Ok(())
                }
            }
        }
    }
}
