use serde::{Deserialize, Serialize};

use caresync_core::{AudienceTag, DomainError, Visibility};

use crate::fact::define_fact;

/// A resulted laboratory observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResultPayload {
    /// Coded test, e.g. a LOINC code.
    pub test_code: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    pub abnormal: bool,
}

impl LabResultPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.test_code.trim().is_empty() {
            return Err(DomainError::validation("test_code cannot be empty"));
        }
        if self.value.trim().is_empty() {
            return Err(DomainError::validation("value cannot be empty"));
        }
        Ok(())
    }
}

define_fact! {
    kind: LabResult,
    aggregate: LabResult,
    id: LabResultId,
    command: RecordLabResult,
    event: LabResultRecorded,
    event_type: "lab_result.recorded",
    payload: LabResultPayload,
    role_permitted: |role| role.is_clinical(),
    visibility: Visibility::clinical().with(AudienceTag::Billing),
}
