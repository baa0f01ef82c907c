use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

/// Diagnosis identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosisId(pub AggregateId);

impl core::fmt::Display for DiagnosisId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStage {
    NotMade,
    Made,
    Resolved,
}

/// Clinical content of a diagnosis; revision equality is judged on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisContent {
    /// Coded diagnosis, e.g. an ICD-10 code.
    pub code: String,
    pub description: String,
}

/// Aggregate root: Diagnosis.
///
/// Made once, revised any number of times, resolved once; resolution is
/// terminal. Revision is idempotent over content: restating the current
/// content emits nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    id: DiagnosisId,
    patient_id: Option<AggregateId>,
    stage: DiagnosisStage,
    content: Option<DiagnosisContent>,
    version: u64,
}

impl Diagnosis {
    pub fn empty(id: DiagnosisId) -> Self {
        Self {
            id,
            patient_id: None,
            stage: DiagnosisStage::NotMade,
            content: None,
            version: 0,
        }
    }

    pub fn stage(&self) -> DiagnosisStage {
        self.stage
    }

    pub fn content(&self) -> Option<&DiagnosisContent> {
        self.content.as_ref()
    }
}

impl AggregateRoot for Diagnosis {
    type Id = DiagnosisId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: MakeDiagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeDiagnosis {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub encounter_id: AggregateId,
    pub code: String,
    pub description: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ReviseDiagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviseDiagnosis {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub code: String,
    pub description: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ResolveDiagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveDiagnosis {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub resolution_note: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagnosisCommand {
    Make(MakeDiagnosis),
    Revise(ReviseDiagnosis),
    Resolve(ResolveDiagnosis),
}

impl Command for DiagnosisCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Make(c) => c.diagnosis_id.0,
            Self::Revise(c) => c.diagnosis_id.0,
            Self::Resolve(c) => c.diagnosis_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisMade {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub encounter_id: AggregateId,
    pub code: String,
    pub description: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRevised {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub code: String,
    pub description: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResolved {
    pub diagnosis_id: DiagnosisId,
    pub patient_id: AggregateId,
    pub resolution_note: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosisEvent {
    Made(DiagnosisMade),
    Revised(DiagnosisRevised),
    Resolved(DiagnosisResolved),
}

impl Event for DiagnosisEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Made(_) => "diagnosis.made",
            Self::Revised(_) => "diagnosis.revised",
            Self::Resolved(_) => "diagnosis.resolved",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Made(e) => e.occurred_at,
            Self::Revised(e) => e.occurred_at,
            Self::Resolved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Diagnosis {
    type Command = DiagnosisCommand;
    type Event = DiagnosisEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::Diagnosis;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DiagnosisEvent::Made(e) => {
                self.id = e.diagnosis_id;
                self.patient_id = Some(e.patient_id);
                self.stage = DiagnosisStage::Made;
                self.content = Some(DiagnosisContent {
                    code: e.code.clone(),
                    description: e.description.clone(),
                });
            }
            DiagnosisEvent::Revised(e) => {
                self.content = Some(DiagnosisContent {
                    code: e.code.clone(),
                    description: e.description.clone(),
                });
            }
            DiagnosisEvent::Resolved(_) => {
                self.stage = DiagnosisStage::Resolved;
            }
        }

        self.version += 1;
    }

    fn decide(
        &self,
        command: &Self::Command,
        clock: &dyn Clock,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            DiagnosisCommand::Make(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                require_physician(cmd.performer_role)?;
                if self.stage != DiagnosisStage::NotMade {
                    return Err(DomainError::invariant(
                        InvariantCode::DiagnosisAlreadyMade,
                        "diagnosis is already made",
                    ));
                }
                check_content(&cmd.code, &cmd.description)?;
                Ok(vec![DiagnosisEvent::Made(DiagnosisMade {
                    diagnosis_id: cmd.diagnosis_id,
                    patient_id: cmd.patient_id,
                    encounter_id: cmd.encounter_id,
                    code: cmd.code.clone(),
                    description: cmd.description.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            DiagnosisCommand::Revise(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                require_physician(cmd.performer_role)?;
                self.ensure_open()?;
                self.ensure_patient(cmd.patient_id)?;
                check_content(&cmd.code, &cmd.description)?;
                let revised = DiagnosisContent {
                    code: cmd.code.clone(),
                    description: cmd.description.clone(),
                };
                // Idempotent over content: restating the diagnosis is a no-op.
                if self.content.as_ref() == Some(&revised) {
                    return Ok(vec![]);
                }
                Ok(vec![DiagnosisEvent::Revised(DiagnosisRevised {
                    diagnosis_id: cmd.diagnosis_id,
                    patient_id: cmd.patient_id,
                    code: cmd.code.clone(),
                    description: cmd.description.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            DiagnosisCommand::Resolve(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                require_physician(cmd.performer_role)?;
                self.ensure_open()?;
                self.ensure_patient(cmd.patient_id)?;
                Ok(vec![DiagnosisEvent::Resolved(DiagnosisResolved {
                    diagnosis_id: cmd.diagnosis_id,
                    patient_id: cmd.patient_id,
                    resolution_note: cmd.resolution_note.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl StateMachine for Diagnosis {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use DiagnosisStage::*;
        match (self.stage, event) {
            (NotMade, DiagnosisEvent::Made(_)) => Ok(()),
            (Made, DiagnosisEvent::Revised(_)) => Ok(()),
            (Made, DiagnosisEvent::Resolved(_)) => Ok(()),
            (_, DiagnosisEvent::Made(_)) => Err(DomainError::invariant(
                InvariantCode::DiagnosisAlreadyMade,
                "diagnosis is already made",
            )),
            (NotMade, _) => Err(DomainError::invariant(
                InvariantCode::DiagnosisNotMade,
                "diagnosis is not made yet",
            )),
            (Resolved, _) => Err(DomainError::invariant(
                InvariantCode::DiagnosisResolved,
                "diagnosis is resolved",
            )),
        }
    }
}

impl Diagnosis {
    fn ensure_open(&self) -> Result<(), DomainError> {
        match self.stage {
            DiagnosisStage::NotMade => Err(DomainError::invariant(
                InvariantCode::DiagnosisNotMade,
                "diagnosis is not made yet",
            )),
            DiagnosisStage::Made => Ok(()),
            DiagnosisStage::Resolved => Err(DomainError::invariant(
                InvariantCode::DiagnosisResolved,
                "diagnosis is resolved",
            )),
        }
    }

    fn ensure_patient(&self, patient_id: AggregateId) -> Result<(), DomainError> {
        if self.patient_id != Some(patient_id) {
            return Err(DomainError::invariant(
                InvariantCode::DiagnosisPatientMismatch,
                "command references a different patient",
            ));
        }
        Ok(())
    }
}

fn require_physician(role: PerformerRole) -> Result<(), DomainError> {
    if role != PerformerRole::Physician {
        return Err(DomainError::invariant(
            InvariantCode::RoleNotPermitted,
            "diagnoses require a physician",
        ));
    }
    Ok(())
}

fn check_content(code: &str, description: &str) -> Result<(), DomainError> {
    if code.trim().is_empty() {
        return Err(DomainError::validation("diagnosis code cannot be empty"));
    }
    if description.trim().is_empty() {
        return Err(DomainError::validation(
            "diagnosis description cannot be empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresync_core::{FixedClock, execute};
    use chrono::{TimeZone, Utc};

    fn clock() -> FixedClock {
        FixedClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    fn made(clock: &FixedClock) -> (Diagnosis, AggregateId) {
        let id = DiagnosisId(AggregateId::new());
        let patient = AggregateId::new();
        let mut dx = Diagnosis::empty(id);
        execute(
            &mut dx,
            &DiagnosisCommand::Make(MakeDiagnosis {
                diagnosis_id: id,
                patient_id: patient,
                encounter_id: AggregateId::new(),
                code: "J06.9".to_string(),
                description: "Acute upper respiratory infection".to_string(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            clock,
        )
        .unwrap();
        (dx, patient)
    }

    #[test]
    fn revision_after_resolution_is_rejected() {
        let clock = clock();
        let (mut dx, patient) = made(&clock);
        let id = *dx.id();
        execute(
            &mut dx,
            &DiagnosisCommand::Resolve(ResolveDiagnosis {
                diagnosis_id: id,
                patient_id: patient,
                resolution_note: None,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();

        let err = execute(
            &mut dx,
            &DiagnosisCommand::Revise(ReviseDiagnosis {
                diagnosis_id: id,
                patient_id: patient,
                code: "J20.9".to_string(),
                description: "Acute bronchitis".to_string(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::DiagnosisResolved));
        // Nothing was emitted: stage transition plus the rejection leaves v2.
        assert_eq!(dx.version(), 2);
    }

    #[test]
    fn revision_is_idempotent_over_content() {
        let clock = clock();
        let (mut dx, patient) = made(&clock);
        let id = *dx.id();
        let same = DiagnosisCommand::Revise(ReviseDiagnosis {
            diagnosis_id: id,
            patient_id: patient,
            code: "J06.9".to_string(),
            description: "Acute upper respiratory infection".to_string(),
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Physician,
            occurred_at: clock.now().fixed_offset(),
        });
        let events = execute(&mut dx, &same, &clock).unwrap();
        assert!(events.is_empty());
        assert_eq!(dx.version(), 1);
    }

    #[test]
    fn a_diagnosis_is_made_once() {
        let clock = clock();
        let (mut dx, patient) = made(&clock);
        let id = *dx.id();
        let err = execute(
            &mut dx,
            &DiagnosisCommand::Make(MakeDiagnosis {
                diagnosis_id: id,
                patient_id: patient,
                encounter_id: AggregateId::new(),
                code: "J06.9".to_string(),
                description: "Acute upper respiratory infection".to_string(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::DiagnosisAlreadyMade)
        );
    }

    #[test]
    fn nurses_cannot_make_diagnoses() {
        let clock = clock();
        let id = DiagnosisId(AggregateId::new());
        let dx = Diagnosis::empty(id);
        let err = dx
            .decide(
                &DiagnosisCommand::Make(MakeDiagnosis {
                    diagnosis_id: id,
                    patient_id: AggregateId::new(),
                    encounter_id: AggregateId::new(),
                    code: "J06.9".to_string(),
                    description: "URI".to_string(),
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::Nurse,
                    occurred_at: clock.now().fixed_offset(),
                }),
                &clock,
            )
            .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::RoleNotPermitted));
    }

    #[test]
    fn patient_mismatch_is_rejected() {
        let clock = clock();
        let (mut dx, _) = made(&clock);
        let id = *dx.id();
        let err = execute(
            &mut dx,
            &DiagnosisCommand::Resolve(ResolveDiagnosis {
                diagnosis_id: id,
                patient_id: AggregateId::new(),
                resolution_note: None,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::DiagnosisPatientMismatch)
        );
    }
}
