use serde::{Deserialize, Serialize};

use caresync_core::{DomainError, PerformerRole, Visibility};

use crate::fact::define_fact;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralUrgency {
    Routine,
    Urgent,
    Emergent,
}

/// A referral to an external specialty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralPayload {
    pub to_specialty: String,
    pub reason: String,
    pub urgency: ReferralUrgency,
}

impl ReferralPayload {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.to_specialty.trim().is_empty() {
            return Err(DomainError::validation("to_specialty cannot be empty"));
        }
        if self.reason.trim().is_empty() {
            return Err(DomainError::validation("reason cannot be empty"));
        }
        Ok(())
    }
}

define_fact! {
    kind: Referral,
    aggregate: Referral,
    id: ReferralId,
    command: IssueReferral,
    event: ReferralIssued,
    event_type: "referral.issued",
    payload: ReferralPayload,
    role_permitted: |role| role == PerformerRole::Physician,
    visibility: Visibility::clinical(),
}
