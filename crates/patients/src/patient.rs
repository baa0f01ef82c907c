use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, AudienceTag, Clock, DomainError,
    InvariantCode, PerformerId, PerformerRole, StateMachine, Visibility,
    ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

/// Patient identifier. The registration stream id doubles as the patient id
/// referenced from every other aggregate's payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub AggregateId);

impl PatientId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PatientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle stage of a registration.
///
/// `Deceased` and `TransferredOut` are terminal: no further transitions, and
/// other aggregates referencing the patient are checked against this status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStage {
    NotRegistered,
    Active,
    Deceased,
    TransferredOut,
}

impl RegistrationStage {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Deceased | Self::TransferredOut)
    }
}

/// Aggregate root: PatientRegistration.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRegistration {
    id: PatientId,
    stage: RegistrationStage,
    legal_name: String,
    date_of_birth: Option<NaiveDate>,
    version: u64,
}

impl PatientRegistration {
    /// Empty, not-yet-registered instance for rehydration.
    pub fn empty(id: PatientId) -> Self {
        Self {
            id,
            stage: RegistrationStage::NotRegistered,
            legal_name: String::new(),
            date_of_birth: None,
            version: 0,
        }
    }

    pub fn stage(&self) -> RegistrationStage {
        self.stage
    }

    pub fn legal_name(&self) -> &str {
        &self.legal_name
    }
}

impl AggregateRoot for PatientRegistration {
    type Id = PatientId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterPatient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPatient {
    pub patient_id: PatientId,
    pub legal_name: String,
    pub date_of_birth: NaiveDate,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: CorrectPatientIdentity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectPatientIdentity {
    pub patient_id: PatientId,
    pub legal_name: String,
    pub date_of_birth: NaiveDate,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: DeclareContactInfo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareContactInfo {
    pub patient_id: PatientId,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: RecordPatientDeath.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatientDeath {
    pub patient_id: PatientId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: TransferPatientOut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPatientOut {
    pub patient_id: PatientId,
    pub destination: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatientCommand {
    Register(RegisterPatient),
    CorrectIdentity(CorrectPatientIdentity),
    DeclareContactInfo(DeclareContactInfo),
    RecordDeath(RecordPatientDeath),
    TransferOut(TransferPatientOut),
}

impl Command for PatientCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Register(c) => c.patient_id.0,
            Self::CorrectIdentity(c) => c.patient_id.0,
            Self::DeclareContactInfo(c) => c.patient_id.0,
            Self::RecordDeath(c) => c.patient_id.0,
            Self::TransferOut(c) => c.patient_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRegistered {
    pub patient_id: PatientId,
    pub legal_name: String,
    pub date_of_birth: NaiveDate,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientIdentityCorrected {
    pub patient_id: PatientId,
    pub legal_name: String,
    pub date_of_birth: NaiveDate,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactInfoDeclared {
    pub patient_id: PatientId,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDeceasedRecorded {
    pub patient_id: PatientId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientTransferredOut {
    pub patient_id: PatientId,
    pub destination: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatientEvent {
    Registered(PatientRegistered),
    IdentityCorrected(PatientIdentityCorrected),
    ContactInfoDeclared(ContactInfoDeclared),
    DeceasedRecorded(PatientDeceasedRecorded),
    TransferredOut(PatientTransferredOut),
}

impl Event for PatientEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Registered(_) => "patient.registered",
            Self::IdentityCorrected(_) => "patient.identity_corrected",
            Self::ContactInfoDeclared(_) => "patient.contact_info_declared",
            Self::DeceasedRecorded(_) => "patient.deceased_recorded",
            Self::TransferredOut(_) => "patient.transferred_out",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Registered(e) => e.occurred_at,
            Self::IdentityCorrected(e) => e.occurred_at,
            Self::ContactInfoDeclared(e) => e.occurred_at,
            Self::DeceasedRecorded(e) => e.occurred_at,
            Self::TransferredOut(e) => e.occurred_at,
        }
    }

    fn visibility(&self) -> Visibility {
        match self {
            // Demographics are visible to the patient portal; the death
            // record stays clinical-only.
            Self::Registered(_) | Self::IdentityCorrected(_) | Self::ContactInfoDeclared(_) => {
                Visibility::clinical().with(AudienceTag::PatientPortal)
            }
            Self::DeceasedRecorded(_) | Self::TransferredOut(_) => Visibility::clinical(),
        }
    }
}

impl Aggregate for PatientRegistration {
    type Command = PatientCommand;
    type Event = PatientEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::PatientRegistration;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PatientEvent::Registered(e) => {
                self.id = e.patient_id;
                self.stage = RegistrationStage::Active;
                self.legal_name = e.legal_name.clone();
                self.date_of_birth = Some(e.date_of_birth);
            }
            PatientEvent::IdentityCorrected(e) => {
                self.legal_name = e.legal_name.clone();
                self.date_of_birth = Some(e.date_of_birth);
            }
            PatientEvent::ContactInfoDeclared(_) => {}
            PatientEvent::DeceasedRecorded(_) => {
                self.stage = RegistrationStage::Deceased;
            }
            PatientEvent::TransferredOut(_) => {
                self.stage = RegistrationStage::TransferredOut;
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
            PatientCommand::Register(cmd) => self.decide_register(cmd, clock),
            PatientCommand::CorrectIdentity(cmd) => self.decide_correct(cmd, clock),
            PatientCommand::DeclareContactInfo(cmd) => self.decide_contact(cmd, clock),
            PatientCommand::RecordDeath(cmd) => self.decide_death(cmd, clock),
            PatientCommand::TransferOut(cmd) => self.decide_transfer(cmd, clock),
        }
    }
}

impl StateMachine for PatientRegistration {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        use RegistrationStage::*;
        match (self.stage, event) {
            (NotRegistered, PatientEvent::Registered(_)) => Ok(()),
            (Active, PatientEvent::IdentityCorrected(_)) => Ok(()),
            (Active, PatientEvent::ContactInfoDeclared(_)) => Ok(()),
            (Active, PatientEvent::DeceasedRecorded(_)) => Ok(()),
            (Active, PatientEvent::TransferredOut(_)) => Ok(()),
            (_, PatientEvent::Registered(_)) => Err(DomainError::invariant(
                InvariantCode::PatientAlreadyRegistered,
                "patient is already registered",
            )),
            (s, _) if s.is_terminal() => Err(DomainError::invariant(
                InvariantCode::PatientTerminal,
                "registration is in a terminal state",
            )),
            _ => Err(DomainError::not_found()),
        }
    }
}

impl PatientRegistration {
    fn decide_register(
        &self,
        cmd: &RegisterPatient,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
        if self.stage != RegistrationStage::NotRegistered {
            return Err(DomainError::invariant(
                InvariantCode::PatientAlreadyRegistered,
                format!("patient {} is already registered", cmd.patient_id),
            ));
        }
        if cmd.legal_name.trim().is_empty() {
            return Err(DomainError::validation("legal_name cannot be empty"));
        }
        Ok(vec![PatientEvent::Registered(PatientRegistered {
            patient_id: cmd.patient_id,
            legal_name: cmd.legal_name.clone(),
            date_of_birth: cmd.date_of_birth,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn decide_correct(
        &self,
        cmd: &CorrectPatientIdentity,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
        match self.stage {
            RegistrationStage::NotRegistered => Err(DomainError::not_found()),
            RegistrationStage::Active => {
                if cmd.legal_name.trim().is_empty() {
                    return Err(DomainError::validation("legal_name cannot be empty"));
                }
                Ok(vec![PatientEvent::IdentityCorrected(
                    PatientIdentityCorrected {
                        patient_id: cmd.patient_id,
                        legal_name: cmd.legal_name.clone(),
                        date_of_birth: cmd.date_of_birth,
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
            _ => Err(DomainError::invariant(
                InvariantCode::IdentityCorrectionInactive,
                "identity corrections require an active registration",
            )),
        }
    }

    fn decide_contact(
        &self,
        cmd: &DeclareContactInfo,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
        match self.stage {
            RegistrationStage::NotRegistered => Err(DomainError::not_found()),
            RegistrationStage::Active => {
                if cmd.phone.is_none() && cmd.email.is_none() && cmd.address.is_none() {
                    return Err(DomainError::validation(
                        "at least one contact field must be present",
                    ));
                }
                Ok(vec![PatientEvent::ContactInfoDeclared(ContactInfoDeclared {
                    patient_id: cmd.patient_id,
                    phone: cmd.phone.clone(),
                    email: cmd.email.clone(),
                    address: cmd.address.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            _ => Err(DomainError::invariant(
                InvariantCode::ContactDeclarationInactive,
                "contact declarations require an active registration",
            )),
        }
    }

    fn decide_death(
        &self,
        cmd: &RecordPatientDeath,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
        if cmd.performer_role != PerformerRole::Physician {
            return Err(DomainError::invariant(
                InvariantCode::RoleNotPermitted,
                "recording a death requires a physician",
            ));
        }
        match self.stage {
            RegistrationStage::NotRegistered => Err(DomainError::not_found()),
            RegistrationStage::Active => Ok(vec![PatientEvent::DeceasedRecorded(
                PatientDeceasedRecorded {
                    patient_id: cmd.patient_id,
                    occurred_at: cmd.occurred_at,
                },
            )]),
            _ => Err(DomainError::invariant(
                InvariantCode::PatientTerminal,
                "registration is already in a terminal state",
            )),
        }
    }

    fn decide_transfer(
        &self,
        cmd: &TransferPatientOut,
        clock: &dyn Clock,
    ) -> Result<Vec<PatientEvent>, DomainError> {
        ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
        if cmd.performer_role == PerformerRole::FrontDesk {
            return Err(DomainError::invariant(
                InvariantCode::RoleNotPermitted,
                "transfers cannot be recorded by front desk staff",
            ));
        }
        match self.stage {
            RegistrationStage::NotRegistered => Err(DomainError::not_found()),
            RegistrationStage::Active => {
                if cmd.destination.trim().is_empty() {
                    return Err(DomainError::validation("destination cannot be empty"));
                }
                Ok(vec![PatientEvent::TransferredOut(PatientTransferredOut {
                    patient_id: cmd.patient_id,
                    destination: cmd.destination.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            _ => Err(DomainError::invariant(
                InvariantCode::PatientTerminal,
                "registration is already in a terminal state",
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

    fn now(clock: &FixedClock) -> DateTime<FixedOffset> {
        clock.now().fixed_offset()
    }

    fn registered(clock: &FixedClock) -> PatientRegistration {
        let id = PatientId::new(AggregateId::new());
        let mut patient = PatientRegistration::empty(id);
        execute(
            &mut patient,
            &PatientCommand::Register(RegisterPatient {
                patient_id: id,
                legal_name: "Ada Byron".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(clock),
            }),
            clock,
        )
        .unwrap();
        patient
    }

    #[test]
    fn registration_activates_the_patient() {
        let clock = clock();
        let patient = registered(&clock);
        assert_eq!(patient.stage(), RegistrationStage::Active);
        assert_eq!(patient.version(), 1);
    }

    #[test]
    fn double_registration_is_rejected() {
        let clock = clock();
        let mut patient = registered(&clock);
        let id = *patient.id();
        let err = execute(
            &mut patient,
            &PatientCommand::Register(RegisterPatient {
                patient_id: id,
                legal_name: "Ada Byron".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(&clock),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::PatientAlreadyRegistered)
        );
    }

    #[test]
    fn death_requires_a_physician() {
        let clock = clock();
        let mut patient = registered(&clock);
        let id = *patient.id();
        let err = execute(
            &mut patient,
            &PatientCommand::RecordDeath(RecordPatientDeath {
                patient_id: id,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Nurse,
                occurred_at: now(&clock),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::RoleNotPermitted));
    }

    #[test]
    fn terminal_stage_rejects_everything_else() {
        let clock = clock();
        let mut patient = registered(&clock);
        let id = *patient.id();
        execute(
            &mut patient,
            &PatientCommand::RecordDeath(RecordPatientDeath {
                patient_id: id,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::Physician,
                occurred_at: now(&clock),
            }),
            &clock,
        )
        .unwrap();
        assert_eq!(patient.stage(), RegistrationStage::Deceased);

        let err = execute(
            &mut patient,
            &PatientCommand::CorrectIdentity(CorrectPatientIdentity {
                patient_id: id,
                legal_name: "A. Lovelace".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(&clock),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::IdentityCorrectionInactive)
        );

        let err = execute(
            &mut patient,
            &PatientCommand::DeclareContactInfo(DeclareContactInfo {
                patient_id: id,
                phone: Some("555-0100".to_string()),
                email: None,
                address: None,
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(&clock),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::ContactDeclarationInactive)
        );
    }

    #[test]
    fn far_future_registration_is_rejected() {
        let clock = clock();
        let id = PatientId::new(AggregateId::new());
        let patient = PatientRegistration::empty(id);
        let err = patient
            .decide(
                &PatientCommand::Register(RegisterPatient {
                    patient_id: id,
                    legal_name: "Ada Byron".to_string(),
                    date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::FrontDesk,
                    occurred_at: (clock.now() + chrono::Duration::minutes(10)).fixed_offset(),
                }),
                &clock,
            )
            .unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::OccurredAtTooFarAhead)
        );
    }

    use proptest::prelude::prop_assert;

    proptest::proptest! {
        /// Terminal means terminal: once the registration leaves Active, no
        /// command sequence brings it back or grows the stream.
        #[test]
        fn terminal_registrations_stay_terminal(ops in proptest::collection::vec(0u8..5, 1..20)) {
            let clock = clock();
            let mut patient = registered(&clock);
            let id = *patient.id();
            let mut terminal_version = None;
            for op in ops {
                let at = clock.now().fixed_offset();
                let actor = PerformerId::new();
                let dob = NaiveDate::from_ymd_opt(1989, 12, 10).unwrap();
                let cmd = match op {
                    0 => PatientCommand::Register(RegisterPatient {
                        patient_id: id,
                        legal_name: "Again".to_string(),
                        date_of_birth: dob,
                        performed_by: actor,
                        performer_role: PerformerRole::FrontDesk,
                        occurred_at: at,
                    }),
                    1 => PatientCommand::CorrectIdentity(CorrectPatientIdentity {
                        patient_id: id,
                        legal_name: "Corrected".to_string(),
                        date_of_birth: dob,
                        performed_by: actor,
                        performer_role: PerformerRole::FrontDesk,
                        occurred_at: at,
                    }),
                    2 => PatientCommand::DeclareContactInfo(DeclareContactInfo {
                        patient_id: id,
                        phone: Some("555-0101".to_string()),
                        email: None,
                        address: None,
                        performed_by: actor,
                        performer_role: PerformerRole::FrontDesk,
                        occurred_at: at,
                    }),
                    3 => PatientCommand::RecordDeath(RecordPatientDeath {
                        patient_id: id,
                        performed_by: actor,
                        performer_role: PerformerRole::Physician,
                        occurred_at: at,
                    }),
                    _ => PatientCommand::TransferOut(TransferPatientOut {
                        patient_id: id,
                        destination: "county hospital".to_string(),
                        performed_by: actor,
                        performer_role: PerformerRole::Physician,
                        occurred_at: at,
                    }),
                };
                let _ = execute(&mut patient, &cmd, &clock);
                if patient.stage().is_terminal() && terminal_version.is_none() {
                    terminal_version = Some(patient.version());
                }
                if let Some(frozen) = terminal_version {
                    prop_assert!(patient.stage().is_terminal());
                    prop_assert!(patient.version() == frozen);
                }
            }
        }
    }

    #[test]
    fn rehydration_equals_live_state() {
        let clock = clock();
        let id = PatientId::new(AggregateId::new());
        let mut live = PatientRegistration::empty(id);
        let mut log = Vec::new();
        for cmd in [
            PatientCommand::Register(RegisterPatient {
                patient_id: id,
                legal_name: "Ada Byron".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(&clock),
            }),
            PatientCommand::CorrectIdentity(CorrectPatientIdentity {
                patient_id: id,
                legal_name: "Ada Lovelace".to_string(),
                date_of_birth: NaiveDate::from_ymd_opt(1989, 12, 10).unwrap(),
                performed_by: PerformerId::new(),
                performer_role: PerformerRole::FrontDesk,
                occurred_at: now(&clock),
            }),
        ] {
            log.extend(execute(&mut live, &cmd, &clock).unwrap());
        }

        let mut replayed = PatientRegistration::empty(id);
        for ev in &log {
            replayed.apply(ev);
        }
        assert_eq!(live, replayed);
    }
}
