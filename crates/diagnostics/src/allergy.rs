use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

/// Allergy record identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllergyRecordId(pub AggregateId);

impl core::fmt::Display for AllergyRecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllergyStage {
    NotRecorded,
    Identified,
    Refuted,
}

/// Aggregate root: AllergyRecord. Refutation is terminal; the identification
/// stays in the history for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct AllergyRecord {
    id: AllergyRecordId,
    stage: AllergyStage,
    version: u64,
}

impl AllergyRecord {
    pub fn empty(id: AllergyRecordId) -> Self {
        Self {
            id,
            stage: AllergyStage::NotRecorded,
            version: 0,
        }
    }

    pub fn stage(&self) -> AllergyStage {
        self.stage
    }
}

impl AggregateRoot for AllergyRecord {
    type Id = AllergyRecordId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: IdentifyAllergy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyAllergy {
    pub allergy_id: AllergyRecordId,
    pub patient_id: AggregateId,
    pub substance: String,
    pub reaction: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: RefuteAllergy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefuteAllergy {
    pub allergy_id: AllergyRecordId,
    pub patient_id: AggregateId,
    pub reason: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AllergyCommand {
    Identify(IdentifyAllergy),
    Refute(RefuteAllergy),
}

impl Command for AllergyCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Identify(c) => c.allergy_id.0,
            Self::Refute(c) => c.allergy_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllergyIdentified {
    pub allergy_id: AllergyRecordId,
    pub patient_id: AggregateId,
    pub substance: String,
    pub reaction: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllergyRefuted {
    pub allergy_id: AllergyRecordId,
    pub patient_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllergyEvent {
    Identified(AllergyIdentified),
    Refuted(AllergyRefuted),
}

impl Event for AllergyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Identified(_) => "allergy_record.identified",
            Self::Refuted(_) => "allergy_record.refuted",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Identified(e) => e.occurred_at,
            Self::Refuted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for AllergyRecord {
    type Command = AllergyCommand;
    type Event = AllergyEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::AllergyRecord;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AllergyEvent::Identified(e) => {
                self.id = e.allergy_id;
                self.stage = AllergyStage::Identified;
            }
            AllergyEvent::Refuted(_) => {
                self.stage = AllergyStage::Refuted;
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
            AllergyCommand::Identify(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if !cmd.performer_role.is_clinical() {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "identifying an allergy requires a clinical role",
                    ));
                }
                if self.stage != AllergyStage::NotRecorded {
                    return Err(DomainError::invariant(
                        InvariantCode::DiagnosisAlreadyMade,
                        "allergy is already identified",
                    ));
                }
                if cmd.substance.trim().is_empty() {
                    return Err(DomainError::validation("substance cannot be empty"));
                }
                Ok(vec![AllergyEvent::Identified(AllergyIdentified {
                    allergy_id: cmd.allergy_id,
                    patient_id: cmd.patient_id,
                    substance: cmd.substance.clone(),
                    reaction: cmd.reaction.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            AllergyCommand::Refute(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if cmd.performer_role != PerformerRole::Physician {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "refuting an allergy requires a physician",
                    ));
                }
                match self.stage {
                    AllergyStage::NotRecorded => Err(DomainError::invariant(
                        InvariantCode::DiagnosisNotMade,
                        "allergy is not identified yet",
                    )),
                    AllergyStage::Identified => {
                        if cmd.reason.trim().is_empty() {
                            return Err(DomainError::validation(
                                "refutation reason cannot be empty",
                            ));
                        }
                        Ok(vec![AllergyEvent::Refuted(AllergyRefuted {
                            allergy_id: cmd.allergy_id,
                            patient_id: cmd.patient_id,
                            reason: cmd.reason.clone(),
                            occurred_at: cmd.occurred_at,
                        })])
                    }
                    AllergyStage::Refuted => Err(DomainError::invariant(
                        InvariantCode::DiagnosisResolved,
                        "allergy is already refuted",
                    )),
                }
            }
        }
    }
}

impl StateMachine for AllergyRecord {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use AllergyStage::*;
        match (self.stage, event) {
            (NotRecorded, AllergyEvent::Identified(_)) => Ok(()),
            (Identified, AllergyEvent::Refuted(_)) => Ok(()),
            (_, AllergyEvent::Identified(_)) => Err(DomainError::invariant(
                InvariantCode::DiagnosisAlreadyMade,
                "allergy is already identified",
            )),
            (NotRecorded, AllergyEvent::Refuted(_)) => Err(DomainError::invariant(
                InvariantCode::DiagnosisNotMade,
                "allergy is not identified yet",
            )),
            (Refuted, AllergyEvent::Refuted(_)) => Err(DomainError::invariant(
                InvariantCode::DiagnosisResolved,
                "allergy is already refuted",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresync_core::{FixedClock, execute};
    use chrono::{TimeZone, Utc};

    fn clock() -> FixedClock {
        FixedClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    #[test]
    fn identified_then_refuted_is_terminal() {
        let clock = clock();
        let id = AllergyRecordId(AggregateId::new());
        let patient = AggregateId::new();
        let mut allergy = AllergyRecord::empty(id);

        execute(
            &mut allergy,
            &AllergyCommand::Identify(IdentifyAllergy {
                allergy_id: id,
                patient_id: patient,
                substance: "penicillin".to_string(),
                reaction: Some("hives".to_string()),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();

        let refute = AllergyCommand::Refute(RefuteAllergy {
            allergy_id: id,
            patient_id: patient,
            reason: "tolerated full course".to_string(),
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Physician,
            occurred_at: clock.now().fixed_offset(),
        });
        execute(&mut allergy, &refute, &clock).unwrap();
        assert_eq!(allergy.stage(), AllergyStage::Refuted);

        let err = execute(&mut allergy, &refute, &clock).unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::DiagnosisResolved));
    }

    #[test]
    fn refutation_requires_identification_first() {
        let clock = clock();
        let id = AllergyRecordId(AggregateId::new());
        let allergy = AllergyRecord::empty(id);
        let err = allergy
            .decide(
                &AllergyCommand::Refute(RefuteAllergy {
                    allergy_id: id,
                    patient_id: AggregateId::new(),
                    reason: "never confirmed".to_string(),
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::Physician,
                    occurred_at: clock.now().fixed_offset(),
                }),
                &clock,
            )
            .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::DiagnosisNotMade));
    }
}
