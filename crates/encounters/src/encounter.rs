use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

/// Encounter identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncounterId(pub AggregateId);

impl core::fmt::Display for EncounterId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Encounter stages.
///
/// Check-in opens the visit, triage is optional, and a completed encounter
/// may be reopened for further documentation before final discharge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterStage {
    NotStarted,
    CheckedIn,
    Triaged,
    InProgress,
    Reopened,
    Completed,
    Discharged,
}

impl EncounterStage {
    /// Clinical content (observations, notes, diagnoses) may only attach
    /// while the encounter is in progress.
    pub const fn in_progress(&self) -> bool {
        matches!(self, Self::InProgress | Self::Reopened)
    }

    /// Counts toward the one-active-encounter rule per patient+practitioner.
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::CheckedIn | Self::Triaged | Self::InProgress | Self::Reopened
        )
    }
}

/// Aggregate root: Encounter.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    id: EncounterId,
    patient_id: Option<AggregateId>,
    attending: Option<PerformerId>,
    stage: EncounterStage,
    version: u64,
}

impl Encounter {
    pub fn empty(id: EncounterId) -> Self {
        Self {
            id,
            patient_id: None,
            attending: None,
            stage: EncounterStage::NotStarted,
            version: 0,
        }
    }

    pub fn stage(&self) -> EncounterStage {
        self.stage
    }

    pub fn patient_id(&self) -> Option<AggregateId> {
        self.patient_id
    }
}

impl AggregateRoot for Encounter {
    type Id = EncounterId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CheckInPatient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInPatient {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    /// Practitioner expected to attend; keys the concurrent-encounter rule.
    pub attending: PerformerId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: TriagePatient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriagePatient {
    pub encounter_id: EncounterId,
    /// 1 (immediate) to 5 (non-urgent).
    pub acuity: u8,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: BeginEncounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginEncounter {
    pub encounter_id: EncounterId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: CompleteEncounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEncounter {
    pub encounter_id: EncounterId,
    pub summary: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ReopenEncounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReopenEncounter {
    pub encounter_id: EncounterId,
    pub reason: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: DischargePatient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DischargePatient {
    pub encounter_id: EncounterId,
    pub disposition: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncounterCommand {
    CheckIn(CheckInPatient),
    Triage(TriagePatient),
    Begin(BeginEncounter),
    Complete(CompleteEncounter),
    Reopen(ReopenEncounter),
    Discharge(DischargePatient),
}

impl Command for EncounterCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::CheckIn(c) => c.encounter_id.0,
            Self::Triage(c) => c.encounter_id.0,
            Self::Begin(c) => c.encounter_id.0,
            Self::Complete(c) => c.encounter_id.0,
            Self::Reopen(c) => c.encounter_id.0,
            Self::Discharge(c) => c.encounter_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientCheckedIn {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub attending: PerformerId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientTriaged {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub acuity: u8,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterBegan {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterCompleted {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub summary: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterReopened {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDischarged {
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub disposition: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncounterEvent {
    CheckedIn(PatientCheckedIn),
    Triaged(PatientTriaged),
    Began(EncounterBegan),
    Completed(EncounterCompleted),
    Reopened(EncounterReopened),
    Discharged(PatientDischarged),
}

impl Event for EncounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::CheckedIn(_) => "encounter.checked_in",
            Self::Triaged(_) => "encounter.triaged",
            Self::Began(_) => "encounter.began",
            Self::Completed(_) => "encounter.completed",
            Self::Reopened(_) => "encounter.reopened",
            Self::Discharged(_) => "encounter.discharged",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::CheckedIn(e) => e.occurred_at,
            Self::Triaged(e) => e.occurred_at,
            Self::Began(e) => e.occurred_at,
            Self::Completed(e) => e.occurred_at,
            Self::Reopened(e) => e.occurred_at,
            Self::Discharged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Encounter {
    type Command = EncounterCommand;
    type Event = EncounterEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::Encounter;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            EncounterEvent::CheckedIn(e) => {
                self.id = e.encounter_id;
                self.patient_id = Some(e.patient_id);
                self.attending = Some(e.attending);
                self.stage = EncounterStage::CheckedIn;
            }
            EncounterEvent::Triaged(_) => {
                self.stage = EncounterStage::Triaged;
            }
            EncounterEvent::Began(_) => {
                self.stage = EncounterStage::InProgress;
            }
            EncounterEvent::Completed(_) => {
                self.stage = EncounterStage::Completed;
            }
            EncounterEvent::Reopened(_) => {
                self.stage = EncounterStage::Reopened;
            }
            EncounterEvent::Discharged(_) => {
                self.stage = EncounterStage::Discharged;
            }
        }

        self.version += 1;
    }

    fn decide(
        &self,
        command: &Self::Command,
        clock: &dyn Clock,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        use EncounterStage::*;
        match command {
            EncounterCommand::CheckIn(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != NotStarted {
                    return Err(DomainError::invariant(
                        InvariantCode::EncounterExists,
                        format!("encounter {} already exists", cmd.encounter_id),
                    ));
                }
                Ok(vec![EncounterEvent::CheckedIn(PatientCheckedIn {
                    encounter_id: cmd.encounter_id,
                    patient_id: cmd.patient_id,
                    attending: cmd.attending,
                    occurred_at: cmd.occurred_at,
                })])
            }
            EncounterCommand::Triage(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if !matches!(
                    cmd.performer_role,
                    PerformerRole::Physician | PerformerRole::Nurse
                ) {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "triage requires a physician or nurse",
                    ));
                }
                if !(1..=5).contains(&cmd.acuity) {
                    return Err(DomainError::validation("acuity must be between 1 and 5"));
                }
                match self.stage {
                    CheckedIn => Ok(vec![EncounterEvent::Triaged(PatientTriaged {
                        encounter_id: cmd.encounter_id,
                        patient_id: self.require_patient()?,
                        acuity: cmd.acuity,
                        occurred_at: cmd.occurred_at,
                    })]),
                    _ => Err(self.bad_transition("triage")),
                }
            }
            EncounterCommand::Begin(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if !cmd.performer_role.is_clinical() {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "beginning an encounter requires a clinical role",
                    ));
                }
                match self.stage {
                    CheckedIn | Triaged => Ok(vec![EncounterEvent::Began(EncounterBegan {
                        encounter_id: cmd.encounter_id,
                        patient_id: self.require_patient()?,
                        occurred_at: cmd.occurred_at,
                    })]),
                    _ => Err(self.bad_transition("begin")),
                }
            }
            EncounterCommand::Complete(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                match self.stage {
                    InProgress | Reopened => {
                        Ok(vec![EncounterEvent::Completed(EncounterCompleted {
                            encounter_id: cmd.encounter_id,
                            patient_id: self.require_patient()?,
                            summary: cmd.summary.clone(),
                            occurred_at: cmd.occurred_at,
                        })])
                    }
                    _ => Err(self.bad_transition("complete")),
                }
            }
            EncounterCommand::Reopen(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if cmd.reason.trim().is_empty() {
                    return Err(DomainError::validation("reopen reason cannot be empty"));
                }
                match self.stage {
                    Completed => Ok(vec![EncounterEvent::Reopened(EncounterReopened {
                        encounter_id: cmd.encounter_id,
                        patient_id: self.require_patient()?,
                        reason: cmd.reason.clone(),
                        occurred_at: cmd.occurred_at,
                    })]),
                    _ => Err(DomainError::invariant(
                        InvariantCode::EncounterReopenOrder,
                        "only a completed encounter can be reopened",
                    )),
                }
            }
            EncounterCommand::Discharge(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                match self.stage {
                    Completed => Ok(vec![EncounterEvent::Discharged(PatientDischarged {
                        encounter_id: cmd.encounter_id,
                        patient_id: self.require_patient()?,
                        disposition: cmd.disposition.clone(),
                        occurred_at: cmd.occurred_at,
                    })]),
                    _ => Err(DomainError::invariant(
                        InvariantCode::EncounterReopenOrder,
                        "discharge requires a completed encounter",
                    )),
                }
            }
        }
    }
}

impl StateMachine for Encounter {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use EncounterStage::*;
        let ok = match (self.stage, event) {
            (NotStarted, EncounterEvent::CheckedIn(_)) => true,
            (CheckedIn, EncounterEvent::Triaged(_)) => true,
            (CheckedIn | Triaged, EncounterEvent::Began(_)) => true,
            (InProgress | Reopened, EncounterEvent::Completed(_)) => true,
            (Completed, EncounterEvent::Reopened(_)) => true,
            (Completed, EncounterEvent::Discharged(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else if matches!(event, EncounterEvent::CheckedIn(_)) {
            Err(DomainError::invariant(
                InvariantCode::EncounterExists,
                "encounter already exists",
            ))
        } else {
            Err(self.bad_transition(match event {
                EncounterEvent::Triaged(_) => "triage",
                EncounterEvent::Began(_) => "begin",
                EncounterEvent::Completed(_) => "complete",
                EncounterEvent::Reopened(_) => "reopen",
                EncounterEvent::Discharged(_) => "discharge",
                EncounterEvent::CheckedIn(_) => unreachable!(),
            }))
        }
    }
}

impl Encounter {
    fn require_patient(&self) -> Result<AggregateId, DomainError> {
        self.patient_id.ok_or_else(DomainError::not_found)
    }

    fn bad_transition(&self, attempted: &str) -> DomainError {
        DomainError::invariant(
            InvariantCode::EncounterTransition,
            format!("cannot {attempted} from {:?}", self.stage),
        )
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

    fn checked_in(clock: &FixedClock) -> Encounter {
        let id = EncounterId(AggregateId::new());
        let mut enc = Encounter::empty(id);
        execute(
            &mut enc,
            &EncounterCommand::CheckIn(CheckInPatient {
                encounter_id: id,
                patient_id: AggregateId::new(),
                attending: PerformerId::new(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            clock,
        )
        .unwrap();
        enc
    }

    fn cmd_begin(id: EncounterId, clock: &FixedClock) -> EncounterCommand {
        EncounterCommand::Begin(BeginEncounter {
            encounter_id: id,
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Physician,
            occurred_at: clock.now().fixed_offset(),
        })
    }

    #[test]
    fn triage_is_optional_before_begin() {
        let clock = clock();

        // Path A: check in, then begin directly.
        let mut direct = checked_in(&clock);
        let cmd = cmd_begin(*direct.id(), &clock);
        execute(&mut direct, &cmd, &clock).unwrap();
        assert_eq!(direct.stage(), EncounterStage::InProgress);

        // Path B: check in, triage, then begin.
        let mut triaged = checked_in(&clock);
        let id = *triaged.id();
        execute(
            &mut triaged,
            &EncounterCommand::Triage(TriagePatient {
                encounter_id: id,
                acuity: 3,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        execute(&mut triaged, &cmd_begin(id, &clock), &clock).unwrap();
        assert_eq!(triaged.stage(), EncounterStage::InProgress);
    }

    #[test]
    fn triage_after_begin_is_rejected() {
        let clock = clock();
        let mut enc = checked_in(&clock);
        let id = *enc.id();
        execute(&mut enc, &cmd_begin(id, &clock), &clock).unwrap();

        let err = execute(
            &mut enc,
            &EncounterCommand::Triage(TriagePatient {
                encounter_id: id,
                acuity: 2,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::EncounterTransition)
        );
    }

    #[test]
    fn reopen_completes_and_discharges() {
        let clock = clock();
        let mut enc = checked_in(&clock);
        let id = *enc.id();
        execute(&mut enc, &cmd_begin(id, &clock), &clock).unwrap();

        let complete = EncounterCommand::Complete(CompleteEncounter {
            encounter_id: id,
            summary: None,
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::Physician,
            occurred_at: clock.now().fixed_offset(),
        });
        execute(&mut enc, &complete, &clock).unwrap();
        assert_eq!(enc.stage(), EncounterStage::Completed);

        execute(
            &mut enc,
            &EncounterCommand::Reopen(ReopenEncounter {
                encounter_id: id,
                reason: "late lab results".to_string(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(enc.stage(), EncounterStage::Reopened);

        execute(&mut enc, &complete, &clock).unwrap();
        execute(
            &mut enc,
            &EncounterCommand::Discharge(DischargePatient {
                encounter_id: id,
                disposition: Some("home".to_string()),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(enc.stage(), EncounterStage::Discharged);
    }

    #[test]
    fn discharge_before_completion_is_rejected() {
        let clock = clock();
        let mut enc = checked_in(&clock);
        let id = *enc.id();
        execute(&mut enc, &cmd_begin(id, &clock), &clock).unwrap();

        let err = execute(
            &mut enc,
            &EncounterCommand::Discharge(DischargePatient {
                encounter_id: id,
                disposition: None,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::EncounterReopenOrder)
        );
    }

    #[test]
    fn double_check_in_is_rejected() {
        let clock = clock();
        let mut enc = checked_in(&clock);
        let id = *enc.id();
        let err = execute(
            &mut enc,
            &EncounterCommand::CheckIn(CheckInPatient {
                encounter_id: id,
                patient_id: AggregateId::new(),
                attending: PerformerId::new(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::EncounterExists));
    }

    use proptest::prelude::prop_assert_eq;

    proptest::proptest! {
        /// Whatever command sequence arrives, rejected commands leave no
        /// trace and accepted ones advance the version by exactly their
        /// event count.
        #[test]
        fn random_command_sequences_keep_versions_dense(ops in proptest::collection::vec(0u8..6, 1..24)) {
            let clock = clock();
            let id = EncounterId(AggregateId::new());
            let patient = AggregateId::new();
            let mut enc = Encounter::empty(id);
            let mut expected = 0u64;
            for op in ops {
                let at = clock.now().fixed_offset();
                let actor = PerformerId::new();
                let cmd = match op {
                    0 => EncounterCommand::CheckIn(CheckInPatient {
                        encounter_id: id,
                        patient_id: patient,
                        attending: actor,
                        performed_by: actor,
                        performer_role: PerformerRole::FrontDesk,
                        occurred_at: at,
                    }),
                    1 => EncounterCommand::Triage(TriagePatient {
                        encounter_id: id,
                        acuity: 3,
                        performed_by: actor,
                        performer_role: PerformerRole::Nurse,
                        occurred_at: at,
                    }),
                    2 => EncounterCommand::Begin(BeginEncounter {
                        encounter_id: id,
                        performed_by: actor,
                        performer_role: PerformerRole::Physician,
                        occurred_at: at,
                    }),
                    3 => EncounterCommand::Complete(CompleteEncounter {
                        encounter_id: id,
                        summary: None,
                        performed_by: actor,
                        performer_role: PerformerRole::Physician,
                        occurred_at: at,
                    }),
                    4 => EncounterCommand::Reopen(ReopenEncounter {
                        encounter_id: id,
                        reason: "recheck".to_string(),
                        performed_by: actor,
                        performer_role: PerformerRole::Physician,
                        occurred_at: at,
                    }),
                    _ => EncounterCommand::Discharge(DischargePatient {
                        encounter_id: id,
                        disposition: None,
                        performed_by: actor,
                        performer_role: PerformerRole::Nurse,
                        occurred_at: at,
                    }),
                };
                if let Ok(events) = execute(&mut enc, &cmd, &clock) {
                    expected += events.len() as u64;
                }
                prop_assert_eq!(enc.version(), expected);
            }
        }
    }

    #[test]
    fn permits_agrees_with_decide_on_the_transition_table() {
        let clock = clock();
        let mut enc = checked_in(&clock);
        let began = EncounterEvent::Began(EncounterBegan {
            encounter_id: *enc.id(),
            patient_id: enc.patient_id().unwrap(),
            occurred_at: clock.now().fixed_offset(),
        });
        assert!(enc.permits(&began).is_ok());
        enc.apply(&began);
        assert!(enc.permits(&began).is_err());

        let triaged = EncounterEvent::Triaged(PatientTriaged {
            encounter_id: *enc.id(),
            patient_id: enc.patient_id().unwrap(),
            acuity: 3,
            occurred_at: clock.now().fixed_offset(),
        });
        assert_eq!(
            enc.permits(&triaged).unwrap_err().invariant_code(),
            Some(InvariantCode::EncounterTransition)
        );
    }
}
