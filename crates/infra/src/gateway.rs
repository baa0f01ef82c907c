//! Untrusted request boundary.
//!
//! The gateway maps wire records to typed commands and wraps every handler
//! outcome in a result value. It never throws, never executes domain logic,
//! and never reads projections for business answers; its only lookup is the
//! command-type registry.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};

use caresync_core::InvariantCode;
use caresync_diagnostics::{AllergyCommand, DiagnosisCommand};
use caresync_encounters::{EncounterCommand, NoteCommand};
use caresync_events::{CommandContext, StoredEnvelope};
use caresync_patients::{DuplicateCommand, PatientCommand};
use caresync_scheduling::AppointmentCommand;

use crate::commands::ClinicalCommand;
use crate::event_store::EventStore;
use crate::handler::{ClinicalCommandHandler, HandlerError};

/// Wire shape every transport serializes commands into.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CommandRequest {
    pub command_type: String,
    pub payload: JsonValue,
}

/// Outcome taxonomy returned to callers. Always a value, never a panic.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Success {
        events: Vec<StoredEnvelope>,
    },
    ValidationError {
        field: String,
        reason: String,
    },
    UnknownCommandType {
        command_type: String,
    },
    PreconditionFailed {
        code: InvariantCode,
    },
    Domain {
        code: Option<InvariantCode>,
        detail: String,
    },
    ConcurrencyError {
        retries_exhausted: u32,
    },
    Transient {
        source: String,
    },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn events(&self) -> &[StoredEnvelope] {
        match self {
            Self::Success { events } => events,
            _ => &[],
        }
    }

    /// Wire response: `{success, events?, error?}`.
    pub fn into_response(self) -> CommandResponse {
        match self {
            Self::Success { events } => CommandResponse {
                success: true,
                events: Some(events),
                error: None,
            },
            other => {
                let (kind, detail) = match &other {
                    Self::ValidationError { field, reason } => {
                        ("validation_error", format!("{field}: {reason}"))
                    }
                    Self::UnknownCommandType { command_type } => {
                        ("unknown_command_type", command_type.clone())
                    }
                    Self::PreconditionFailed { code } => {
                        ("precondition_failed", code.as_str().to_string())
                    }
                    Self::Domain { code, detail } => (
                        "domain_error",
                        match code {
                            Some(code) => format!("{code}: {detail}"),
                            None => detail.clone(),
                        },
                    ),
                    Self::ConcurrencyError { retries_exhausted } => (
                        "concurrency_error",
                        format!("retries exhausted ({retries_exhausted})"),
                    ),
                    Self::Transient { source } => ("transient", source.clone()),
                    Self::Success { .. } => unreachable!(),
                };
                CommandResponse {
                    success: false,
                    events: None,
                    error: Some(ErrorBody {
                        kind: kind.to_string(),
                        detail,
                    }),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<StoredEnvelope>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug)]
struct MapFailure {
    field: String,
    reason: String,
}

type Mapper = fn(JsonValue, &CommandContext) -> Result<ClinicalCommand, MapFailure>;

/// Deserialize the payload into a typed command, injecting the actor from
/// the request context (actor identity is never trusted from the payload).
fn typed<T: DeserializeOwned>(mut payload: JsonValue, ctx: &CommandContext) -> Result<T, MapFailure> {
    let Some(map) = payload.as_object_mut() else {
        return Err(MapFailure {
            field: "payload".to_string(),
            reason: "payload must be an object".to_string(),
        });
    };
    map.insert("performed_by".to_string(), json!(ctx.performed_by));
    map.insert("performer_role".to_string(), json!(ctx.performer_role));
    serde_json::from_value(payload).map_err(|e| MapFailure {
        field: "payload".to_string(),
        reason: e.to_string(),
    })
}

macro_rules! mapper {
    ($name:ident, $outer:ident, $inner:path) => {
        fn $name(payload: JsonValue, ctx: &CommandContext) -> Result<ClinicalCommand, MapFailure> {
            Ok(ClinicalCommand::$outer($inner(typed(payload, ctx)?)))
        }
    };
    ($name:ident, $outer:ident) => {
        fn $name(payload: JsonValue, ctx: &CommandContext) -> Result<ClinicalCommand, MapFailure> {
            Ok(ClinicalCommand::$outer(typed(payload, ctx)?))
        }
    };
}

mapper!(map_register_patient, Patient, PatientCommand::Register);
mapper!(map_correct_identity, Patient, PatientCommand::CorrectIdentity);
mapper!(map_declare_contact, Patient, PatientCommand::DeclareContactInfo);
mapper!(map_record_death, Patient, PatientCommand::RecordDeath);
mapper!(map_transfer_out, Patient, PatientCommand::TransferOut);
mapper!(map_report_duplicate, Duplicate, DuplicateCommand::Report);
mapper!(map_confirm_duplicate, Duplicate, DuplicateCommand::ConfirmDuplicate);
mapper!(map_confirm_distinct, Duplicate, DuplicateCommand::ConfirmDistinct);
mapper!(map_check_in, Encounter, EncounterCommand::CheckIn);
mapper!(map_triage, Encounter, EncounterCommand::Triage);
mapper!(map_begin_encounter, Encounter, EncounterCommand::Begin);
mapper!(map_reopen_encounter, Encounter, EncounterCommand::Reopen);
mapper!(map_complete_encounter, Encounter, EncounterCommand::Complete);
mapper!(map_discharge, Encounter, EncounterCommand::Discharge);
mapper!(map_author_note, Note, NoteCommand::Author);
mapper!(map_add_addendum, Note, NoteCommand::AddAddendum);
mapper!(map_cosign_note, Note, NoteCommand::Cosign);
mapper!(map_make_diagnosis, Diagnosis, DiagnosisCommand::Make);
mapper!(map_revise_diagnosis, Diagnosis, DiagnosisCommand::Revise);
mapper!(map_resolve_diagnosis, Diagnosis, DiagnosisCommand::Resolve);
mapper!(map_identify_allergy, Allergy, AllergyCommand::Identify);
mapper!(map_refute_allergy, Allergy, AllergyCommand::Refute);
mapper!(map_request_appointment, Appointment, AppointmentCommand::Request);
mapper!(map_confirm_appointment, Appointment, AppointmentCommand::Confirm);
mapper!(map_reschedule_appointment, Appointment, AppointmentCommand::Reschedule);
mapper!(map_cancel_by_patient, Appointment, AppointmentCommand::CancelByPatient);
mapper!(map_cancel_by_practice, Appointment, AppointmentCommand::CancelByPractice);
mapper!(map_mark_no_show, Appointment, AppointmentCommand::MarkNoShow);
mapper!(map_record_vital_signs, VitalSigns);
mapper!(map_report_symptom, Symptom);
mapper!(map_record_examination, Examination);
mapper!(map_record_lab_result, LabResult);
mapper!(map_record_procedure, Procedure);
mapper!(map_issue_referral, Referral);
mapper!(map_prescribe_treatment_plan, TreatmentPlan);

fn standard_mappers() -> HashMap<&'static str, Mapper> {
    let entries: [(&'static str, Mapper); 35] = [
        ("patient.register", map_register_patient),
        ("patient.correct_identity", map_correct_identity),
        ("patient.declare_contact_info", map_declare_contact),
        ("patient.record_death", map_record_death),
        ("patient.transfer_out", map_transfer_out),
        ("duplicate.report", map_report_duplicate),
        ("duplicate.confirm_duplicate", map_confirm_duplicate),
        ("duplicate.confirm_distinct", map_confirm_distinct),
        ("encounter.check_in", map_check_in),
        ("encounter.triage", map_triage),
        ("encounter.begin", map_begin_encounter),
        ("encounter.reopen", map_reopen_encounter),
        ("encounter.complete", map_complete_encounter),
        ("encounter.discharge", map_discharge),
        ("note.author", map_author_note),
        ("note.add_addendum", map_add_addendum),
        ("note.cosign", map_cosign_note),
        ("diagnosis.make", map_make_diagnosis),
        ("diagnosis.revise", map_revise_diagnosis),
        ("diagnosis.resolve", map_resolve_diagnosis),
        ("allergy.identify", map_identify_allergy),
        ("allergy.refute", map_refute_allergy),
        ("appointment.request", map_request_appointment),
        ("appointment.confirm", map_confirm_appointment),
        ("appointment.reschedule", map_reschedule_appointment),
        ("appointment.cancel_by_patient", map_cancel_by_patient),
        ("appointment.cancel_by_practice", map_cancel_by_practice),
        ("appointment.mark_no_show", map_mark_no_show),
        ("observation.record_vital_signs", map_record_vital_signs),
        ("observation.report_symptom", map_report_symptom),
        ("observation.record_examination_finding", map_record_examination),
        ("observation.record_lab_result", map_record_lab_result),
        ("observation.record_procedure", map_record_procedure),
        ("observation.issue_referral", map_issue_referral),
        ("observation.prescribe_treatment_plan", map_prescribe_treatment_plan),
    ];
    entries.into_iter().collect()
}

/// Field-length bounds enforced at the boundary, before any IO.
fn check_bounds(command: &ClinicalCommand) -> Result<(), MapFailure> {
    fn bounded(field: &str, value: &str, max: usize) -> Result<(), MapFailure> {
        if value.len() > max {
            return Err(MapFailure {
                field: field.to_string(),
                reason: format!("exceeds {max} bytes"),
            });
        }
        Ok(())
    }

    match command {
        ClinicalCommand::Patient(PatientCommand::Register(c)) => {
            bounded("legal_name", &c.legal_name, 256)
        }
        ClinicalCommand::Patient(PatientCommand::CorrectIdentity(c)) => {
            bounded("legal_name", &c.legal_name, 256)
        }
        ClinicalCommand::Patient(PatientCommand::TransferOut(c)) => {
            bounded("destination", &c.destination, 256)
        }
        ClinicalCommand::Note(NoteCommand::Author(c)) => bounded("body", &c.body, 65_536),
        ClinicalCommand::Note(NoteCommand::AddAddendum(c)) => bounded("body", &c.body, 65_536),
        ClinicalCommand::Diagnosis(DiagnosisCommand::Make(c)) => {
            bounded("code", &c.code, 64)?;
            bounded("description", &c.description, 2_048)
        }
        ClinicalCommand::Diagnosis(DiagnosisCommand::Revise(c)) => {
            bounded("code", &c.code, 64)?;
            bounded("description", &c.description, 2_048)
        }
        ClinicalCommand::Allergy(AllergyCommand::Identify(c)) => {
            bounded("substance", &c.substance, 256)
        }
        ClinicalCommand::Symptom(c) => bounded("description", &c.payload.description, 2_048),
        ClinicalCommand::Encounter(EncounterCommand::Reopen(c)) => {
            bounded("reason", &c.reason, 1_024)
        }
        _ => Ok(()),
    }
}

/// Entry point for command traffic.
pub struct CommandGateway<S> {
    handler: ClinicalCommandHandler<S>,
    mappers: HashMap<&'static str, Mapper>,
}

impl<S: EventStore> CommandGateway<S> {
    pub fn new(handler: ClinicalCommandHandler<S>) -> Self {
        Self {
            handler,
            mappers: standard_mappers(),
        }
    }

    pub fn handler(&self) -> &ClinicalCommandHandler<S> {
        &self.handler
    }

    /// Validate, map, route, execute, and wrap. Infallible by construction.
    pub fn dispatch(&self, request: CommandRequest, ctx: CommandContext) -> CommandOutcome {
        let Some(mapper) = self.mappers.get(request.command_type.as_str()) else {
            return CommandOutcome::UnknownCommandType {
                command_type: request.command_type,
            };
        };

        let command = match mapper(request.payload, &ctx) {
            Ok(command) => command,
            Err(failure) => {
                return CommandOutcome::ValidationError {
                    field: failure.field,
                    reason: failure.reason,
                };
            }
        };

        if let Err(failure) = check_bounds(&command) {
            return CommandOutcome::ValidationError {
                field: failure.field,
                reason: failure.reason,
            };
        }

        match self.handler.execute(&command, &ctx) {
            Ok(events) => CommandOutcome::Success { events },
            Err(HandlerError::Precondition(code)) => CommandOutcome::PreconditionFailed { code },
            Err(HandlerError::Domain(err)) => match err {
                caresync_core::DomainError::Validation(reason) => CommandOutcome::ValidationError {
                    field: "payload".to_string(),
                    reason,
                },
                other => CommandOutcome::Domain {
                    code: other.invariant_code(),
                    detail: other.to_string(),
                },
            },
            Err(HandlerError::Concurrency { retries }) => CommandOutcome::ConcurrencyError {
                retries_exhausted: retries,
            },
            Err(HandlerError::Transient(source)) => CommandOutcome::Transient { source },
            Err(HandlerError::DeadlineExceeded) => CommandOutcome::Transient {
                source: "deadline".to_string(),
            },
        }
    }
}
