use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

/// Appointment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(pub AggregateId);

impl core::fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Appointment stages. Both cancellations and the no-show are terminal.
/// Rescheduling returns the appointment to an unconfirmed slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStage {
    NotRequested,
    Requested,
    Confirmed,
    Rescheduled,
    CancelledByPatient,
    CancelledByPractice,
    NoShowed,
}

impl AppointmentStage {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CancelledByPatient | Self::CancelledByPractice | Self::NoShowed
        )
    }

    /// Still occupies a slot on the calendar.
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Requested | Self::Confirmed | Self::Rescheduled)
    }
}

/// Aggregate root: Appointment.
#[derive(Debug, Clone, PartialEq)]
pub struct Appointment {
    id: AppointmentId,
    patient_id: Option<AggregateId>,
    stage: AppointmentStage,
    version: u64,
}

impl Appointment {
    pub fn empty(id: AppointmentId) -> Self {
        Self {
            id,
            patient_id: None,
            stage: AppointmentStage::NotRequested,
            version: 0,
        }
    }

    pub fn stage(&self) -> AppointmentStage {
        self.stage
    }

    pub fn patient_id(&self) -> Option<AggregateId> {
        self.patient_id
    }
}

impl AggregateRoot for Appointment {
    type Id = AppointmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RequestAppointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAppointment {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub practitioner_id: PerformerId,
    pub slot_start: DateTime<FixedOffset>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: ConfirmAppointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmAppointment {
    pub appointment_id: AppointmentId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: RescheduleAppointment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleAppointment {
    pub appointment_id: AppointmentId,
    pub new_slot_start: DateTime<FixedOffset>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: CancelAppointmentByPatient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAppointmentByPatient {
    pub appointment_id: AppointmentId,
    pub reason: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: CancelAppointmentByPractice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAppointmentByPractice {
    pub appointment_id: AppointmentId,
    pub reason: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: MarkAppointmentNoShow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkAppointmentNoShow {
    pub appointment_id: AppointmentId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppointmentCommand {
    Request(RequestAppointment),
    Confirm(ConfirmAppointment),
    Reschedule(RescheduleAppointment),
    CancelByPatient(CancelAppointmentByPatient),
    CancelByPractice(CancelAppointmentByPractice),
    MarkNoShow(MarkAppointmentNoShow),
}

impl Command for AppointmentCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Request(c) => c.appointment_id.0,
            Self::Confirm(c) => c.appointment_id.0,
            Self::Reschedule(c) => c.appointment_id.0,
            Self::CancelByPatient(c) => c.appointment_id.0,
            Self::CancelByPractice(c) => c.appointment_id.0,
            Self::MarkNoShow(c) => c.appointment_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRequested {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub practitioner_id: PerformerId,
    pub slot_start: DateTime<FixedOffset>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentConfirmed {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRescheduled {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub new_slot_start: DateTime<FixedOffset>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentCancelledByPatient {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentCancelledByPractice {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentNoShowed {
    pub appointment_id: AppointmentId,
    pub patient_id: AggregateId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppointmentEvent {
    Requested(AppointmentRequested),
    Confirmed(AppointmentConfirmed),
    Rescheduled(AppointmentRescheduled),
    CancelledByPatient(AppointmentCancelledByPatient),
    CancelledByPractice(AppointmentCancelledByPractice),
    NoShowed(AppointmentNoShowed),
}

impl Event for AppointmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Requested(_) => "appointment.requested",
            Self::Confirmed(_) => "appointment.confirmed",
            Self::Rescheduled(_) => "appointment.rescheduled",
            Self::CancelledByPatient(_) => "appointment.cancelled_by_patient",
            Self::CancelledByPractice(_) => "appointment.cancelled_by_practice",
            Self::NoShowed(_) => "appointment.no_showed",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Requested(e) => e.occurred_at,
            Self::Confirmed(e) => e.occurred_at,
            Self::Rescheduled(e) => e.occurred_at,
            Self::CancelledByPatient(e) => e.occurred_at,
            Self::CancelledByPractice(e) => e.occurred_at,
            Self::NoShowed(e) => e.occurred_at,
        }
    }

    fn visibility(&self) -> caresync_core::Visibility {
        // Scheduling is patient-facing end to end.
        caresync_core::Visibility::clinical().with(caresync_core::AudienceTag::PatientPortal)
    }
}

impl Aggregate for Appointment {
    type Command = AppointmentCommand;
    type Event = AppointmentEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::Appointment;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AppointmentEvent::Requested(e) => {
                self.id = e.appointment_id;
                self.patient_id = Some(e.patient_id);
                self.stage = AppointmentStage::Requested;
            }
            AppointmentEvent::Confirmed(_) => {
                self.stage = AppointmentStage::Confirmed;
            }
            AppointmentEvent::Rescheduled(_) => {
                self.stage = AppointmentStage::Rescheduled;
            }
            AppointmentEvent::CancelledByPatient(_) => {
                self.stage = AppointmentStage::CancelledByPatient;
            }
            AppointmentEvent::CancelledByPractice(_) => {
                self.stage = AppointmentStage::CancelledByPractice;
            }
            AppointmentEvent::NoShowed(_) => {
                self.stage = AppointmentStage::NoShowed;
            }
        }

        self.version += 1;
    }

    fn decide(
        &self,
        command: &Self::Command,
        clock: &dyn Clock,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        use AppointmentStage::*;
        match command {
            AppointmentCommand::Request(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != NotRequested {
                    return Err(DomainError::invariant(
                        InvariantCode::AppointmentExists,
                        "appointment is already requested",
                    ));
                }
                Ok(vec![AppointmentEvent::Requested(AppointmentRequested {
                    appointment_id: cmd.appointment_id,
                    patient_id: cmd.patient_id,
                    practitioner_id: cmd.practitioner_id,
                    slot_start: cmd.slot_start,
                    occurred_at: cmd.occurred_at,
                })])
            }
            AppointmentCommand::Confirm(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_not_terminal()?;
                match self.stage {
                    Requested | Rescheduled => {
                        Ok(vec![AppointmentEvent::Confirmed(AppointmentConfirmed {
                            appointment_id: cmd.appointment_id,
                            patient_id: self.require_patient()?,
                            occurred_at: cmd.occurred_at,
                        })])
                    }
                    _ => Err(self.bad_transition("confirm")),
                }
            }
            AppointmentCommand::Reschedule(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_not_terminal()?;
                if self.stage != Confirmed {
                    return Err(DomainError::invariant(
                        InvariantCode::RescheduleUnconfirmed,
                        "only a confirmed appointment can be rescheduled",
                    ));
                }
                Ok(vec![AppointmentEvent::Rescheduled(AppointmentRescheduled {
                    appointment_id: cmd.appointment_id,
                    patient_id: self.require_patient()?,
                    new_slot_start: cmd.new_slot_start,
                    occurred_at: cmd.occurred_at,
                })])
            }
            AppointmentCommand::CancelByPatient(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_not_terminal()?;
                if !self.stage.is_open() {
                    return Err(self.bad_transition("cancel"));
                }
                Ok(vec![AppointmentEvent::CancelledByPatient(
                    AppointmentCancelledByPatient {
                        appointment_id: cmd.appointment_id,
                        patient_id: self.require_patient()?,
                        reason: cmd.reason.clone(),
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
            AppointmentCommand::CancelByPractice(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_not_terminal()?;
                if !self.stage.is_open() {
                    return Err(self.bad_transition("cancel"));
                }
                if cmd.reason.trim().is_empty() {
                    return Err(DomainError::validation(
                        "practice cancellations require a reason",
                    ));
                }
                Ok(vec![AppointmentEvent::CancelledByPractice(
                    AppointmentCancelledByPractice {
                        appointment_id: cmd.appointment_id,
                        patient_id: self.require_patient()?,
                        reason: cmd.reason.clone(),
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
            AppointmentCommand::MarkNoShow(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                self.ensure_not_terminal()?;
                if self.stage != Confirmed {
                    return Err(self.bad_transition("mark no-show on"));
                }
                Ok(vec![AppointmentEvent::NoShowed(AppointmentNoShowed {
                    appointment_id: cmd.appointment_id,
                    patient_id: self.require_patient()?,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl StateMachine for Appointment {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use AppointmentStage::*;
        let ok = match (self.stage, event) {
            (NotRequested, AppointmentEvent::Requested(_)) => true,
            (Requested | Rescheduled, AppointmentEvent::Confirmed(_)) => true,
            (Confirmed, AppointmentEvent::Rescheduled(_)) => true,
            (s, AppointmentEvent::CancelledByPatient(_)) if s.is_open() => true,
            (s, AppointmentEvent::CancelledByPractice(_)) if s.is_open() => true,
            (Confirmed, AppointmentEvent::NoShowed(_)) => true,
            _ => false,
        };
        if ok {
            return Ok(());
        }
        if matches!(event, AppointmentEvent::Requested(_)) {
            return Err(DomainError::invariant(
                InvariantCode::AppointmentExists,
                "appointment is already requested",
            ));
        }
        self.ensure_not_terminal()?;
        if matches!(event, AppointmentEvent::Rescheduled(_)) {
            return Err(DomainError::invariant(
                InvariantCode::RescheduleUnconfirmed,
                "only a confirmed appointment can be rescheduled",
            ));
        }
        Err(self.bad_transition("apply"))
    }
}

impl Appointment {
    fn require_patient(&self) -> Result<AggregateId, DomainError> {
        self.patient_id.ok_or_else(DomainError::not_found)
    }

    fn ensure_not_terminal(&self) -> Result<(), DomainError> {
        if self.stage.is_terminal() {
            return Err(DomainError::invariant(
                InvariantCode::AppointmentTerminal,
                format!("appointment is {:?}", self.stage),
            ));
        }
        Ok(())
    }

    fn bad_transition(&self, attempted: &str) -> DomainError {
        DomainError::invariant(
            InvariantCode::AppointmentTransition,
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

    fn requested(clock: &FixedClock) -> Appointment {
        let id = AppointmentId(AggregateId::new());
        let mut appt = Appointment::empty(id);
        execute(
            &mut appt,
            &AppointmentCommand::Request(RequestAppointment {
                appointment_id: id,
                patient_id: AggregateId::new(),
                practitioner_id: PerformerId::new(),
                slot_start: clock.now().fixed_offset() + chrono::Duration::minutes(3),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            clock,
        )
        .unwrap();
        appt
    }

    fn confirm(id: AppointmentId, clock: &FixedClock) -> AppointmentCommand {
        AppointmentCommand::Confirm(ConfirmAppointment {
            appointment_id: id,
            performed_by: PerformerId::new(),
            performer_role: PerformerRole::FrontDesk,
            occurred_at: clock.now().fixed_offset(),
        })
    }

    #[test]
    fn reschedule_cycles_back_through_confirmation() {
        let clock = clock();
        let mut appt = requested(&clock);
        let id = *appt.id();
        execute(&mut appt, &confirm(id, &clock), &clock).unwrap();

        execute(
            &mut appt,
            &AppointmentCommand::Reschedule(RescheduleAppointment {
                appointment_id: id,
                new_slot_start: clock.now().fixed_offset(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(appt.stage(), AppointmentStage::Rescheduled);

        execute(&mut appt, &confirm(id, &clock), &clock).unwrap();
        assert_eq!(appt.stage(), AppointmentStage::Confirmed);
    }

    #[test]
    fn reschedule_requires_confirmation_first() {
        let clock = clock();
        let mut appt = requested(&clock);
        let id = *appt.id();
        let err = execute(
            &mut appt,
            &AppointmentCommand::Reschedule(RescheduleAppointment {
                appointment_id: id,
                new_slot_start: clock.now().fixed_offset(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::RescheduleUnconfirmed)
        );
    }

    #[test]
    fn a_slot_is_requested_once() {
        let clock = clock();
        let mut appt = requested(&clock);
        let id = *appt.id();
        let err = execute(
            &mut appt,
            &AppointmentCommand::Request(RequestAppointment {
                appointment_id: id,
                patient_id: AggregateId::new(),
                practitioner_id: PerformerId::new(),
                slot_start: clock.now().fixed_offset(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::AppointmentExists));
    }

    #[test]
    fn cancellation_is_terminal() {
        let clock = clock();
        let mut appt = requested(&clock);
        let id = *appt.id();
        execute(
            &mut appt,
            &AppointmentCommand::CancelByPatient(CancelAppointmentByPatient {
                appointment_id: id,
                reason: None,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(appt.stage(), AppointmentStage::CancelledByPatient);

        let err = execute(&mut appt, &confirm(id, &clock), &clock).unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::AppointmentTerminal)
        );
    }

    #[test]
    fn no_show_requires_confirmed() {
        let clock = clock();
        let mut appt = requested(&clock);
        let id = *appt.id();
        let err = execute(
            &mut appt,
            &AppointmentCommand::MarkNoShow(MarkAppointmentNoShow {
                appointment_id: id,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::AppointmentTransition)
        );
    }
}
