use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use caresync_core::{AggregateId, AggregateKind, OrganizationId, Visibility};
use caresync_events::StoredEnvelope;

/// An envelope paired with its store-local insertion position.
///
/// Positions are per-store (hub and device number independently); they feed
/// dispatcher checkpoints and sync download cursors, never semantic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced {
    pub position: u64,
    pub envelope: StoredEnvelope,
}

/// Filter for cross-stream reads.
///
/// Empty fields match everything; set fields are conjunctive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_types: Option<BTreeSet<String>>,
    pub aggregate_types: Option<BTreeSet<AggregateKind>>,
    pub organization_id: Option<OrganizationId>,
    /// Matches the `patient_id` field inside payloads.
    pub patient_id: Option<AggregateId>,
    /// Non-empty mask: at least one audience tag must be shared.
    pub visibility_mask: Visibility,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_organization(organization_id: OrganizationId) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..Self::default()
        }
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_aggregate_types(mut self, kinds: impl IntoIterator<Item = AggregateKind>) -> Self {
        self.aggregate_types = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_patient(mut self, patient_id: AggregateId) -> Self {
        self.patient_id = Some(patient_id);
        self
    }

    pub fn with_visibility_mask(mut self, mask: Visibility) -> Self {
        self.visibility_mask = mask;
        self
    }

    pub fn matches(&self, envelope: &StoredEnvelope) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(envelope.event_type()) {
                return false;
            }
        }
        if let Some(kinds) = &self.aggregate_types {
            if !kinds.contains(&envelope.aggregate_type()) {
                return false;
            }
        }
        if let Some(org) = self.organization_id {
            if envelope.organization_id() != org {
                return false;
            }
        }
        if let Some(patient) = self.patient_id {
            if envelope.patient_id_in_payload() != Some(patient) {
                return false;
            }
        }
        envelope.visibility().intersects(&self.visibility_mask)
    }
}
