use serde::{Deserialize, Serialize};

use caresync_core::{AudienceTag, DomainError, PerformerRole, Visibility};

use crate::fact::define_fact;

/// A performed procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedurePayload {
    /// Coded procedure, e.g. a CPT code.
    pub procedure_code: String,
    pub description: String,
    pub outcome: Option<String>,
}

impl ProcedurePayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.procedure_code.trim().is_empty() {
            return Err(DomainError::validation("procedure_code cannot be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(DomainError::validation("description cannot be empty"));
        }
        Ok(())
    }
}

define_fact! {
    kind: Procedure,
    aggregate: Procedure,
    id: ProcedureId,
    command: RecordProcedure,
    event: ProcedurePerformed,
    event_type: "procedure.performed",
    payload: ProcedurePayload,
    role_permitted: |role| role == PerformerRole::Physician,
    visibility: Visibility::clinical().with(AudienceTag::Billing),
}
