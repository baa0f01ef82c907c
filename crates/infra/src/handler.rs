//! Command execution pipeline.
//!
//! Flow per command: cross-aggregate precondition checks against the read
//! models → load stream → rehydrate → `decide` → stamp envelope metadata →
//! append (optimistic, retried) → post-commit dispatch. Aggregates stay
//! pure; all IO lives here.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use caresync_core::{
    Aggregate, AggregateId, Clock, CorrelationId, DomainError, EventId, InvariantCode,
};
use caresync_diagnostics::{AllergyCommand, AllergyRecord, AllergyRecordId, Diagnosis, DiagnosisCommand, DiagnosisId, DiagnosisStage};
use caresync_encounters::{ClinicalNote, ClinicalNoteId, Encounter, EncounterCommand, EncounterId, NoteCommand};
use caresync_events::{
    ActorContext, Command, CommandContext, DeviceContext, Event, EventEnvelope, OrgContext,
    StoredEnvelope, TraceContext,
};
use caresync_observations::{
    ExaminationFinding, ExaminationFindingId, LabResult, LabResultId, Procedure, ProcedureId,
    Referral, ReferralId, Symptom, SymptomId, TreatmentPlan, TreatmentPlanId, VitalSigns,
    VitalSignsId,
};
use caresync_patients::{DuplicateResolution, DuplicateResolutionId, PatientId, PatientRegistration};
use caresync_scheduling::{Appointment, AppointmentCommand, AppointmentId};

use caresync_core::OrganizationId;

use crate::commands::ClinicalCommand;
use crate::config::CoreConfig;
use crate::device::DeviceSession;
use crate::dispatcher::EventDispatcher;
use crate::event_store::{AppendOutcome, EventStore, EventStoreError, Sequenced};
use crate::read_models::ReadModels;

/// Sink for locally persisted but unsynced events; the device sync engine
/// plugs its outbox in here. Hub-side handlers run without one.
pub trait OutboxSink: Send + Sync {
    fn enqueue(&self, event_id: EventId, local_sequence_number: u64);
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// A cross-aggregate check failed against the read models.
    #[error("precondition failed: {0}")]
    Precondition(InvariantCode),

    /// The aggregate refused the command.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Optimistic-concurrency retries exhausted.
    #[error("concurrency retries exhausted after {retries} attempts")]
    Concurrency { retries: u32 },

    /// Storage or serialization trouble; retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The command's deadline expired between retries.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Executes typed commands against the event store.
pub struct ClinicalCommandHandler<S> {
    store: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    read_models: ReadModels,
    device: Arc<DeviceSession>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    outbox: Option<Arc<dyn OutboxSink>>,
}

impl<S: EventStore> ClinicalCommandHandler<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<EventDispatcher>,
        read_models: ReadModels,
        device: Arc<DeviceSession>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            read_models,
            device,
            clock,
            config,
            outbox: None,
        }
    }

    /// Wire in the device outbox; every locally appended envelope is
    /// enqueued for upload alongside the append.
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxSink>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn read_models(&self) -> &ReadModels {
        &self.read_models
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one command through the full pipeline.
    pub fn execute(
        &self,
        command: &ClinicalCommand,
        ctx: &CommandContext,
    ) -> Result<Vec<StoredEnvelope>, HandlerError> {
        self.check_preconditions(command, ctx)?;

        match command {
            ClinicalCommand::Patient(c) => {
                self.run::<PatientRegistration>(c, ctx, |id| {
                    PatientRegistration::empty(PatientId::new(id))
                })
            }
            ClinicalCommand::Duplicate(c) => self.run::<DuplicateResolution>(c, ctx, |id| {
                DuplicateResolution::empty(DuplicateResolutionId(id))
            }),
            ClinicalCommand::Encounter(c) => {
                self.run::<Encounter>(c, ctx, |id| Encounter::empty(EncounterId(id)))
            }
            ClinicalCommand::Note(c) => {
                self.run::<ClinicalNote>(c, ctx, |id| ClinicalNote::empty(ClinicalNoteId(id)))
            }
            ClinicalCommand::Diagnosis(c) => {
                self.run::<Diagnosis>(c, ctx, |id| Diagnosis::empty(DiagnosisId(id)))
            }
            ClinicalCommand::Allergy(c) => {
                self.run::<AllergyRecord>(c, ctx, |id| AllergyRecord::empty(AllergyRecordId(id)))
            }
            ClinicalCommand::Appointment(c) => {
                self.run::<Appointment>(c, ctx, |id| Appointment::empty(AppointmentId(id)))
            }
            ClinicalCommand::VitalSigns(c) => {
                self.run::<VitalSigns>(c, ctx, |id| VitalSigns::empty(VitalSignsId(id)))
            }
            ClinicalCommand::Symptom(c) => {
                self.run::<Symptom>(c, ctx, |id| Symptom::empty(SymptomId(id)))
            }
            ClinicalCommand::Examination(c) => self.run::<ExaminationFinding>(c, ctx, |id| {
                ExaminationFinding::empty(ExaminationFindingId(id))
            }),
            ClinicalCommand::LabResult(c) => {
                self.run::<LabResult>(c, ctx, |id| LabResult::empty(LabResultId(id)))
            }
            ClinicalCommand::Procedure(c) => {
                self.run::<Procedure>(c, ctx, |id| Procedure::empty(ProcedureId(id)))
            }
            ClinicalCommand::Referral(c) => {
                self.run::<Referral>(c, ctx, |id| Referral::empty(ReferralId(id)))
            }
            ClinicalCommand::TreatmentPlan(c) => {
                self.run::<TreatmentPlan>(c, ctx, |id| TreatmentPlan::empty(TreatmentPlanId(id)))
            }
        }
    }

    /// The generic pipeline body: single-writer per stream via the
    /// optimistic retry loop, no locks.
    fn run<A>(
        &self,
        command: &A::Command,
        ctx: &CommandContext,
        make: impl Fn(AggregateId) -> A,
    ) -> Result<Vec<StoredEnvelope>, HandlerError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id();
        let correlation = ctx.correlation_id.unwrap_or_else(CorrelationId::new);

        let mut attempt = 0u32;
        loop {
            if let Some(deadline) = ctx.deadline {
                if self.clock.now() > deadline {
                    return Err(HandlerError::DeadlineExceeded);
                }
            }

            // 1) Load + rehydrate.
            let stream = self
                .store
                .read_stream(A::KIND, aggregate_id)
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
            let mut aggregate = make(aggregate_id);
            for stored in &stream {
                let event: A::Event = stored
                    .typed_payload()
                    .map_err(|e| HandlerError::Transient(format!("corrupt history: {e}")))?;
                aggregate.apply(&event);
            }

            // 2) Decide.
            let events = aggregate.decide(command, &*self.clock)?;
            if events.is_empty() {
                return Ok(vec![]);
            }

            // 3) Stamp metadata. Within one command, each event is caused by
            // its predecessor; the first inherits the request causation.
            let recorded_at = self.clock.now().fixed_offset();
            let mut causation = ctx.causation_id;
            let mut envelopes: Vec<StoredEnvelope> = Vec::with_capacity(events.len());
            for (i, event) in events.iter().enumerate() {
                let envelope = EventEnvelope::new(
                    EventId::new(),
                    event.event_type(),
                    event.schema_version(),
                    aggregate_id,
                    A::KIND,
                    stream.len() as u64 + i as u64 + 1,
                    event.occurred_at(),
                    recorded_at,
                    ActorContext {
                        performed_by: ctx.performed_by,
                        performer_role: ctx.performer_role,
                    },
                    OrgContext {
                        organization_id: ctx.organization_id,
                        facility_id: ctx.facility_id,
                    },
                    DeviceContext {
                        device_id: self.device.device_id().to_string(),
                        connection_status: self.device.connection(),
                        device_clock_drift_ms: self.device.drift_ms(),
                        local_sequence_number: self.device.next_lsn(),
                        sync_batch_id: None,
                    },
                    TraceContext {
                        correlation_id: correlation,
                        causation_id: causation,
                    },
                    event.visibility(),
                    event,
                );
                let stored = envelope
                    .into_stored()
                    .map_err(|e| HandlerError::Transient(format!("payload serialization: {e}")))?;
                causation = Some(stored.event_id());
                envelopes.push(stored);
            }

            // 4) Append. The handler is the single local writer per stream,
            // so a conflict can only hit the first append of an attempt.
            let mut conflicted = false;
            let mut appended = Vec::with_capacity(envelopes.len());
            for envelope in &envelopes {
                match self.store.append(envelope) {
                    Ok(AppendOutcome::Appended { position }) => {
                        if let Some(outbox) = &self.outbox {
                            outbox.enqueue(
                                envelope.event_id(),
                                envelope.device().local_sequence_number,
                            );
                        }
                        appended.push(Sequenced {
                            position,
                            envelope: envelope.clone(),
                        });
                    }
                    Ok(AppendOutcome::AlreadyExists) => {}
                    Err(EventStoreError::VersionConflict { expected, actual }) => {
                        debug!(
                            aggregate = %aggregate_id,
                            expected,
                            actual,
                            attempt,
                            "append raced; reloading stream"
                        );
                        conflicted = true;
                        break;
                    }
                    Err(e) => return Err(HandlerError::Transient(e.to_string())),
                }
            }

            if conflicted {
                attempt += 1;
                if attempt > self.config.command_retries {
                    return Err(HandlerError::Concurrency {
                        retries: self.config.command_retries,
                    });
                }
                self.backoff(attempt);
                continue;
            }

            // 5) Post-commit dispatch. Failures here never affect
            // durability; catch-up polling covers missed notifications.
            for item in &appended {
                self.dispatcher.publish(item);
            }

            return Ok(envelopes);
        }
    }

    /// Exponential backoff with jitter between optimistic retries.
    fn backoff(&self, attempt: u32) {
        let base = self.config.retry_backoff_base_ms;
        if base == 0 {
            return;
        }
        let exp = base.saturating_mul(1 << attempt.min(10));
        let capped = exp.min(self.config.retry_backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=base);
        thread::sleep(Duration::from_millis(capped + jitter));
    }

    /// Cross-aggregate checks, one explicit list per command kind.
    ///
    /// Offline leniency: when the local read model has no row for the
    /// referenced aggregate, the command is allowed through and sync-time
    /// compensation has the final word. Hubs run strict.
    fn check_preconditions(
        &self,
        command: &ClinicalCommand,
        ctx: &CommandContext,
    ) -> Result<(), HandlerError> {
        let org = ctx.organization_id;
        match command {
            ClinicalCommand::Encounter(EncounterCommand::CheckIn(c)) => {
                self.require_active_patient(org, c.patient_id)?;
                if !self
                    .read_models
                    .active_encounters_for(org, c.patient_id, c.attending)
                    .is_empty()
                {
                    return Err(HandlerError::Precondition(
                        InvariantCode::ConcurrentEncounters,
                    ));
                }
                Ok(())
            }
            ClinicalCommand::Encounter(_) => Ok(()),

            ClinicalCommand::Note(NoteCommand::Author(c)) => {
                self.require_encounter_in_progress(org, c.encounter_id.0)
            }
            ClinicalCommand::Note(_) => Ok(()),

            ClinicalCommand::Diagnosis(DiagnosisCommand::Make(c)) => {
                self.require_active_patient(org, c.patient_id)?;
                self.require_encounter_in_progress(org, c.encounter_id)
            }
            ClinicalCommand::Diagnosis(_) => Ok(()),

            ClinicalCommand::Allergy(AllergyCommand::Identify(c)) => {
                self.require_active_patient(org, c.patient_id)
            }
            ClinicalCommand::Allergy(_) => Ok(()),

            ClinicalCommand::Appointment(AppointmentCommand::Request(c)) => {
                self.require_active_patient(org, c.patient_id)
            }
            ClinicalCommand::Appointment(AppointmentCommand::Confirm(c)) => {
                self.require_appointment_patient_active(org, c.appointment_id.0)
            }
            ClinicalCommand::Appointment(AppointmentCommand::Reschedule(c)) => {
                self.require_appointment_patient_active(org, c.appointment_id.0)
            }
            // Cancellations and no-shows must stay possible for terminal
            // patients; cancelling is the compensation action itself.
            ClinicalCommand::Appointment(_) => Ok(()),

            ClinicalCommand::Patient(_) | ClinicalCommand::Duplicate(_) => Ok(()),

            ClinicalCommand::VitalSigns(c) => self.fact_preconditions(org, c.patient_id, c.encounter_id),
            ClinicalCommand::Symptom(c) => self.fact_preconditions(org, c.patient_id, c.encounter_id),
            ClinicalCommand::Examination(c) => {
                self.fact_preconditions(org, c.patient_id, c.encounter_id)
            }
            ClinicalCommand::LabResult(c) => self.fact_preconditions(org, c.patient_id, c.encounter_id),
            ClinicalCommand::Procedure(c) => self.fact_preconditions(org, c.patient_id, c.encounter_id),
            ClinicalCommand::Referral(c) => self.fact_preconditions(org, c.patient_id, c.encounter_id),
            ClinicalCommand::TreatmentPlan(c) => {
                self.fact_preconditions(org, c.patient_id, c.encounter_id)?;
                match self.read_models.diagnosis_stage(org, c.payload.diagnosis_id) {
                    Some(DiagnosisStage::Resolved) => Err(HandlerError::Precondition(
                        InvariantCode::TreatmentPlanDiagnosisResolved,
                    )),
                    Some(_) => Ok(()),
                    None if self.config.strict_preconditions => Err(HandlerError::Precondition(
                        InvariantCode::DiagnosisNotMade,
                    )),
                    None => Ok(()),
                }
            }
        }
    }

    fn fact_preconditions(
        &self,
        org: OrganizationId,
        patient_id: AggregateId,
        encounter_id: AggregateId,
    ) -> Result<(), HandlerError> {
        self.require_active_patient(org, patient_id)?;
        self.require_encounter_in_progress(org, encounter_id)
    }

    fn require_active_patient(
        &self,
        org: OrganizationId,
        patient_id: AggregateId,
    ) -> Result<(), HandlerError> {
        match self.read_models.patient_stage(org, patient_id) {
            Some(stage) if stage.is_terminal() => {
                Err(HandlerError::Precondition(InvariantCode::PatientTerminal))
            }
            Some(_) => Ok(()),
            None if self.config.strict_preconditions => {
                Err(HandlerError::Precondition(InvariantCode::PatientUnknown))
            }
            None => {
                debug!(%patient_id, "patient unknown locally; deferring to sync-time checks");
                Ok(())
            }
        }
    }

    fn require_encounter_in_progress(
        &self,
        org: OrganizationId,
        encounter_id: AggregateId,
    ) -> Result<(), HandlerError> {
        match self.read_models.encounter_stage(org, encounter_id) {
            Some(stage) if stage.in_progress() => Ok(()),
            Some(_) => Err(HandlerError::Precondition(
                InvariantCode::EncounterNotInProgress,
            )),
            None if self.config.strict_preconditions => Err(HandlerError::Precondition(
                InvariantCode::EncounterNotInProgress,
            )),
            None => Ok(()),
        }
    }

    fn require_appointment_patient_active(
        &self,
        org: OrganizationId,
        appointment_id: AggregateId,
    ) -> Result<(), HandlerError> {
        if let Some(row) = self.read_models.appointment_status.get(org, appointment_id) {
            self.require_active_patient(org, row.patient_id)?;
        } else if self.config.strict_preconditions {
            warn!(%appointment_id, "appointment unknown to read model on strict node");
        }
        Ok(())
    }
}
