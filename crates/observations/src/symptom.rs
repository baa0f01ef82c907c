use serde::{Deserialize, Serialize};

use caresync_core::{DomainError, Visibility};

use crate::fact::define_fact;

/// A patient-reported symptom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymptomPayload {
    pub description: String,
    /// 1 (mild) to 10 (worst imaginable), when graded.
    pub severity: Option<u8>,
    pub onset: Option<chrono::DateTime<chrono::FixedOffset>>,
}

impl SymptomPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.description.trim().is_empty() {
            return Err(DomainError::validation(
                "symptom description cannot be empty",
            ));
        }
        if let Some(severity) = self.severity {
            if !(1..=10).contains(&severity) {
                return Err(DomainError::validation("severity must be between 1 and 10"));
            }
        }
        Ok(())
    }
}

define_fact! {
    kind: Symptom,
    aggregate: Symptom,
    id: SymptomId,
    command: ReportSymptom,
    event: SymptomReported,
    event_type: "symptom.reported",
    payload: SymptomPayload,
    role_permitted: |role| role.is_clinical(),
    visibility: Visibility::clinical(),
}
