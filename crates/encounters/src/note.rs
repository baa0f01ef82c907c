use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use caresync_core::{
    Aggregate, AggregateId, AggregateKind, AggregateRoot, Clock, DomainError, InvariantCode,
    PerformerId, PerformerRole, StateMachine, ensure_occurred_at_plausible,
};
use caresync_events::{Command, Event};

use crate::encounter::EncounterId;

/// Upper bound on note and addendum bodies.
pub const MAX_NOTE_BODY: usize = 65_536;

/// Clinical note identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClinicalNoteId(pub AggregateId);

impl core::fmt::Display for ClinicalNoteId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStage {
    NotAuthored,
    Authored,
}

/// Aggregate root: ClinicalNote.
///
/// A note is authored once, may gather any number of addenda, and may be
/// cosigned at most once, by someone other than the author.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalNote {
    id: ClinicalNoteId,
    stage: NoteStage,
    author: Option<PerformerId>,
    cosigned: bool,
    addenda: u32,
    version: u64,
}

impl ClinicalNote {
    pub fn empty(id: ClinicalNoteId) -> Self {
        Self {
            id,
            stage: NoteStage::NotAuthored,
            author: None,
            cosigned: false,
            addenda: 0,
            version: 0,
        }
    }

    pub fn stage(&self) -> NoteStage {
        self.stage
    }

    pub fn author(&self) -> Option<PerformerId> {
        self.author
    }

    pub fn is_cosigned(&self) -> bool {
        self.cosigned
    }
}

impl AggregateRoot for ClinicalNote {
    type Id = ClinicalNoteId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AuthorNote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorNote {
    pub note_id: ClinicalNoteId,
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub body: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: AddNoteAddendum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNoteAddendum {
    pub note_id: ClinicalNoteId,
    pub body: String,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

/// Command: CosignNote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosignNote {
    pub note_id: ClinicalNoteId,
    pub performed_by: PerformerId,
    pub performer_role: PerformerRole,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoteCommand {
    Author(AuthorNote),
    AddAddendum(AddNoteAddendum),
    Cosign(CosignNote),
}

impl Command for NoteCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            Self::Author(c) => c.note_id.0,
            Self::AddAddendum(c) => c.note_id.0,
            Self::Cosign(c) => c.note_id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalNoteAuthored {
    pub note_id: ClinicalNoteId,
    pub encounter_id: EncounterId,
    pub patient_id: AggregateId,
    pub author: PerformerId,
    pub body: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteAddendumAdded {
    pub note_id: ClinicalNoteId,
    pub body: String,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteCosigned {
    pub note_id: ClinicalNoteId,
    pub cosigner: PerformerId,
    pub occurred_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoteEvent {
    Authored(ClinicalNoteAuthored),
    AddendumAdded(NoteAddendumAdded),
    Cosigned(NoteCosigned),
}

impl Event for NoteEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Authored(_) => "clinical_note.authored",
            Self::AddendumAdded(_) => "clinical_note.addendum_added",
            Self::Cosigned(_) => "clinical_note.cosigned",
        }
    }

    fn occurred_at(&self) -> DateTime<FixedOffset> {
        match self {
            Self::Authored(e) => e.occurred_at,
            Self::AddendumAdded(e) => e.occurred_at,
            Self::Cosigned(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ClinicalNote {
    type Command = NoteCommand;
    type Event = NoteEvent;
    type Error = DomainError;

    const KIND: AggregateKind = AggregateKind::ClinicalNote;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            NoteEvent::Authored(e) => {
                self.id = e.note_id;
                self.stage = NoteStage::Authored;
                self.author = Some(e.author);
            }
            NoteEvent::AddendumAdded(_) => {
                self.addenda += 1;
            }
            NoteEvent::Cosigned(_) => {
                self.cosigned = true;
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
            NoteCommand::Author(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != NoteStage::NotAuthored {
                    return Err(DomainError::invariant(
                        InvariantCode::NoteAlreadyAuthored,
                        "note is already authored",
                    ));
                }
                if !cmd.performer_role.is_clinical() {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "authoring a note requires a clinical role",
                    ));
                }
                check_body(&cmd.body)?;
                Ok(vec![NoteEvent::Authored(ClinicalNoteAuthored {
                    note_id: cmd.note_id,
                    encounter_id: cmd.encounter_id,
                    patient_id: cmd.patient_id,
                    author: cmd.performed_by,
                    body: cmd.body.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            NoteCommand::AddAddendum(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != NoteStage::Authored {
                    return Err(DomainError::invariant(
                        InvariantCode::NoteNotAuthored,
                        "cannot add an addendum before the note is authored",
                    ));
                }
                if !cmd.performer_role.is_clinical() {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "adding an addendum requires a clinical role",
                    ));
                }
                check_body(&cmd.body)?;
                Ok(vec![NoteEvent::AddendumAdded(NoteAddendumAdded {
                    note_id: cmd.note_id,
                    body: cmd.body.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            NoteCommand::Cosign(cmd) => {
                ensure_occurred_at_plausible(cmd.occurred_at, clock)?;
                if self.stage != NoteStage::Authored {
                    return Err(DomainError::invariant(
                        InvariantCode::NoteNotAuthored,
                        "cannot cosign before the note is authored",
                    ));
                }
                if cmd.performer_role != PerformerRole::Physician {
                    return Err(DomainError::invariant(
                        InvariantCode::RoleNotPermitted,
                        "cosigning requires a physician",
                    ));
                }
                if self.author == Some(cmd.performed_by) {
                    return Err(DomainError::invariant(
                        InvariantCode::SelfCosign,
                        "a note cannot be cosigned by its author",
                    ));
                }
                if self.cosigned {
                    return Err(DomainError::invariant(
                        InvariantCode::NoteAlreadyAuthored,
                        "note is already cosigned",
                    ));
                }
                Ok(vec![NoteEvent::Cosigned(NoteCosigned {
                    note_id: cmd.note_id,
                    cosigner: cmd.performed_by,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl StateMachine for ClinicalNote {
    fn permits(&self, event: &Self::Event) -> Result<(), DomainError> {
        match (self.stage, event) {
            (NoteStage::NotAuthored, NoteEvent::Authored(_)) => Ok(()),
            (NoteStage::Authored, NoteEvent::Authored(_)) => Err(DomainError::invariant(
                InvariantCode::NoteAlreadyAuthored,
                "note is already authored",
            )),
            (NoteStage::NotAuthored, _) => Err(DomainError::invariant(
                InvariantCode::NoteNotAuthored,
                "note is not authored yet",
            )),
            (NoteStage::Authored, NoteEvent::AddendumAdded(_)) => Ok(()),
            (NoteStage::Authored, NoteEvent::Cosigned(e)) => {
                if self.cosigned {
                    Err(DomainError::invariant(
                        InvariantCode::NoteAlreadyAuthored,
                        "note is already cosigned",
                    ))
                } else if self.author == Some(e.cosigner) {
                    Err(DomainError::invariant(
                        InvariantCode::SelfCosign,
                        "a note cannot be cosigned by its author",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn check_body(body: &str) -> Result<(), DomainError> {
    if body.trim().is_empty() {
        return Err(DomainError::validation("note body cannot be empty"));
    }
    if body.len() > MAX_NOTE_BODY {
        return Err(DomainError::validation("note body exceeds the size bound"));
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

    fn authored(clock: &FixedClock, author: PerformerId) -> ClinicalNote {
        let id = ClinicalNoteId(AggregateId::new());
        let mut note = ClinicalNote::empty(id);
        execute(
            &mut note,
            &NoteCommand::Author(AuthorNote {
                note_id: id,
                encounter_id: EncounterId(AggregateId::new()),
                patient_id: AggregateId::new(),
                body: "Subjective: headache for two days.".to_string(),
                performed_by: author,
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            clock,
        )
        .unwrap();
        note
    }

    #[test]
    fn self_cosign_is_rejected() {
        let clock = clock();
        let author = PerformerId::new();
        let mut note = authored(&clock, author);
        let id = *note.id();
        let err = execute(
            &mut note,
            &NoteCommand::Cosign(CosignNote {
                note_id: id,
                performed_by: author,
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            }),
            &clock,
        )
        .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::SelfCosign));
    }

    #[test]
    fn cosign_happens_at_most_once() {
        let clock = clock();
        let mut note = authored(&clock, PerformerId::new());
        let id = *note.id();
        let cosign = |by: PerformerId| {
            NoteCommand::Cosign(CosignNote {
                note_id: id,
                performed_by: by,
                performer_role: PerformerRole::Physician,
                occurred_at: clock.now().fixed_offset(),
            })
        };
        execute(&mut note, &cosign(PerformerId::new()), &clock).unwrap();
        assert!(note.is_cosigned());

        let err = execute(&mut note, &cosign(PerformerId::new()), &clock).unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::NoteAlreadyAuthored)
        );
    }

    #[test]
    fn addenda_accumulate_after_authoring() {
        let clock = clock();
        let mut note = authored(&clock, PerformerId::new());
        let id = *note.id();
        for _ in 0..3 {
            execute(
                &mut note,
                &NoteCommand::AddAddendum(AddNoteAddendum {
                    note_id: id,
                    body: "Addendum: lab results reviewed.".to_string(),
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::Nurse,
                    occurred_at: clock.now().fixed_offset(),
                }),
                &clock,
            )
            .unwrap();
        }
        assert_eq!(note.version(), 4);
    }

    #[test]
    fn addendum_before_authoring_is_rejected() {
        let clock = clock();
        let id = ClinicalNoteId(AggregateId::new());
        let note = ClinicalNote::empty(id);
        let err = note
            .decide(
                &NoteCommand::AddAddendum(AddNoteAddendum {
                    note_id: id,
                    body: "too early".to_string(),
                    performed_by: PerformerId::new(),
                    performer_role: PerformerRole::Nurse,
                    occurred_at: clock.now().fixed_offset(),
                }),
                &clock,
            )
            .unwrap_err();
        assert_eq!(err.invariant_code(), Some(InvariantCode::NoteNotAuthored));
    }
}
