use serde::{Deserialize, Serialize};

use caresync_core::{DomainError, Visibility};

use crate::fact::define_fact;

/// A finding from physical examination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExaminationFindingPayload {
    pub body_site: String,
    pub finding: String,
}

impl ExaminationFindingPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.body_site.trim().is_empty() {
            return Err(DomainError::validation("body_site cannot be empty"));
        }
        if self.finding.trim().is_empty() {
            return Err(DomainError::validation("finding cannot be empty"));
        }
        Ok(())
    }
}

define_fact! {
    kind: ExaminationFinding,
    aggregate: ExaminationFinding,
    id: ExaminationFindingId,
    command: RecordExaminationFinding,
    event: ExaminationFindingRecorded,
    event_type: "examination_finding.recorded",
    payload: ExaminationFindingPayload,
    role_permitted: |role| role.is_clinical(),
    visibility: Visibility::clinical(),
}
