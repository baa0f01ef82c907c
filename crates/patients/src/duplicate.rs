use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

use crate::patient::PatientId;

/// Identifier of one duplicate-resolution case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuplicateResolutionId(pub AggregateId);

impl core::fmt::Display for DuplicateResolutionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Case stages. Both confirmations are terminal; merging records or keeping
/// them apart happens downstream of the decision recorded here.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    NotReported,
    Detected,
    ConfirmedDuplicate,
    ConfirmedDistinct,
}

impl ResolutionStage {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfirmedDuplicate | Self::ConfirmedDistinct)
    }
}

/// Aggregate root: DuplicateResolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateResolution {
    id: DuplicateResolutionId,
    stage: ResolutionStage,
    version: u64,
}

impl DuplicateResolution {
    pub fn empty(id: DuplicateResolutionId) -> Self {
        Self {
            id,
            stage: ResolutionStage::NotReported,
            version: 0,
        }
    }

    pub fn stage(&self) -> ResolutionStage {
        self.stage
    }
}

impl AggregateRoot for DuplicateResolution {
    type Id = DuplicateResolutionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ReportDuplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDuplicate {
    pub resolution_id: DuplicateResolutionId,
    /// The registration presumed authoritative.
    pub patient_id: PatientId,
    /// The registration suspected to duplicate it.
    pub suspected_duplicate_id: PatientId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ConfirmDuplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmDuplicate {
    pub resolution_id: DuplicateResolutionId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ConfirmDistinct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmDistinct {
    pub resolution_id: DuplicateResolutionId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DuplicateCommand {
    Report(ReportDuplicate),
    ConfirmDuplicate(ConfirmDuplicate),
    ConfirmDistinct(ConfirmDistinct),
}

impl Command for DuplicateCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Report(c) => c.resolution_id.0,
            Self::ConfirmDuplicate(c) => c.resolution_id.0,
            Self::ConfirmDistinct(c) => c.resolution_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReported {
    pub resolution_id: DuplicateResolutionId,
    pub patient_id: PatientId,
    pub suspected_duplicate_id: PatientId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateConfirmed {
    pub resolution_id: DuplicateResolutionId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientsConfirmedDistinct {
    pub resolution_id: DuplicateResolutionId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateEvent {
    Reported(DuplicateReported),
    Confirmed(DuplicateConfirmed),
    Distinct(PatientsConfirmedDistinct),
}

impl Event for DuplicateEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Reported(_) => "duplicate_resolution.reported",
            Self::Confirmed(_) => "duplicate_resolution.confirmed_duplicate",
            Self::Distinct(_) => "duplicate_resolution.confirmed_distinct",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Reported(e) => e.occurred_at,
            Self::Confirmed(e) => e.occurred_at,
            Self::Distinct(e) => e.occurred_at,
        }
    }
}

impl Aggregate for DuplicateResolution {
    type Command = DuplicateCommand;
    type Event = DuplicateEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::DuplicateResolution;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DuplicateEvent::Reported(e) => {
                self.id = e.resolution_id;
                self.stage = ResolutionStage::Detected;
            }
            DuplicateEvent::Confirmed(_) => {
                self.stage = ResolutionStage::ConfirmedDuplicate;
            }
            DuplicateEvent::Distinct(_) => {
                self.stage = ResolutionStage::ConfirmedDistinct;
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
            DuplicateCommand::Report(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != ResolutionStage::NotReported {
                    return Err(DomainError::invariant(
                        InvariantCode::PatientAlreadyRegistered,
                        "duplicate case already reported",
                    ));
                }
                if cmd.patient_id == cmd.suspected_duplicate_id {
                    return Err(DomainError::validation(
                        "a registration cannot duplicate itself",
                    ));
                }
                Ok(vec![DuplicateEvent::Reported(DuplicateReported {
                    resolution_id: cmd.resolution_id,
                    patient_id: cmd.patient_id,
                    suspected_duplicate_id: cmd.suspected_duplicate_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            DuplicateCommand::ConfirmDuplicate(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_open()?;
                Ok(vec![DuplicateEvent::Confirmed(DuplicateConfirmed {
                    resolution_id: cmd.resolution_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            DuplicateCommand::ConfirmDistinct(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_open()?;
                Ok(vec![DuplicateEvent::Distinct(PatientsConfirmedDistinct {
                    resolution_id: cmd.resolution_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl StateMachine for DuplicateResolution {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use ResolutionStage::*;
        match (self.stage, event) {
            (NotReported, DuplicateEvent::Reported(_)) => Ok(()),
            (Detected, DuplicateEvent::Confirmed(_)) => Ok(()),
            (Detected, DuplicateEvent::Distinct(_)) => Ok(()),
            (_, DuplicateEvent::Reported(_)) => Err(DomainError::invariant(
                InvariantCode::PatientAlreadyRegistered,
                "duplicate case already reported",
            )),
            _ => Err(DomainError::invariant(
                InvariantCode::PatientTerminal,
                "duplicate case already resolved",
            )),
        }
    }
}

impl DuplicateResolution {
    fn ensure_open(&self) -> Result<(), DomainError> {
        match self.stage {
            ResolutionStage::NotReported => Err(DomainError::not_found()),
            ResolutionStage::Detected => Ok(()),
            _ => Err(DomainError::invariant(
                InvariantCode::PatientTerminal,
                "duplicate case already resolved",
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

    fn reported(clock: &FixedClock) -> DuplicateResolution {
        let id = DuplicateResolutionId(AggregateId::new());
        let mut case = DuplicateResolution::empty(id);
        execute(
            &mut case,
            &DuplicateCommand::Report(ReportDuplicate {
                resolution_id: id,
                patient_id: PatientId::new(AggregateId::new()),
                suspected_duplicate_id: PatientId::new(AggregateId::new()),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            clock,
        )
        .unwrap();
        case
    }

    #[test]
    fn report_then_confirm_is_terminal() {
        let clock = clock();
        let mut case = reported(&clock);
        let id = *case.id();
        execute(
            &mut case,
            &DuplicateCommand::ConfirmDuplicate(ConfirmDuplicate {
                resolution_id: id,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Administrator,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(case.stage(), ResolutionStage::ConfirmedDuplicate);

        let err = execute(
            &mut case,
            &DuplicateCommand::ConfirmDistinct(ConfirmDistinct {
                resolution_id: id,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Administrator,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::PatientTerminal));
    }

    #[test]
    fn self_duplicate_is_rejected() {
        let clock = clock();
        let id = DuplicateResolutionId(AggregateId::new());
        let patient = PatientId::new(AggregateId::new());
        let case = DuplicateResolution::empty(id);
        let err = case
            .decide(
                &DuplicateCommand::Report(ReportDuplicate {
                    resolution_id: id,
                    patient_id: patient,
                    suspected_duplicate_id: patient,
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::FrontDesk,
                    occurred_at: clock.now().fixed_offset(),
                }),
                &clock,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
