//! Wire messages for the four sync phases.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use caresync_core::{EventId, InvariantCode, OrganizationId, SyncBatchId};
use caresync_events::StoredEnvelope;

/// Single supported protocol version; anything else is refused at
/// handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Phase 1, device → hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandshake {
    pub device_id: String,
    pub organization_id: OrganizationId,
    pub protocol_version: u32,
    pub last_downloaded_position: u64,
    pub device_lsn: u64,
    pub pending_count: u32,
    /// Device wall clock at send time; the hub derives the drift estimate
    /// from it.
    pub device_clock: DateTime<FixedOffset>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Ready,
    DeviceRevoked,
    OrgMismatch,
    ProtocolUnsupported,
}

/// Phase 1, hub → device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHandshakeAck {
    pub status: HandshakeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_clock: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_drift_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_current_position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_available: Option<u64>,
}

impl SyncHandshakeAck {
    pub fn refused(status: HandshakeStatus) -> Self {
        Self {
            status,
            hub_clock: None,
            computed_drift_ms: None,
            hub_current_position: None,
            events_available: None,
        }
    }
}

/// Phase 3a, device → hub. Events travel in LSN order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpload {
    pub sync_batch_id: SyncBatchId,
    pub events: Vec<StoredEnvelope>,
}

/// Per-event verdict when an upload hit a version conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictResolutionOutcome {
    /// Causal replay admitted the event at a new stream slot.
    AcceptedRenumbered { new_version: u64 },
    /// Another event already performs this transition from the same state.
    Duplicate,
    /// The state machine refuses the event; its content is preserved in a
    /// compensation record, never discarded.
    Rejected { code: InvariantCode },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictedEvent {
    pub event_id: EventId,
    pub resolution: ConflictResolutionOutcome,
}

/// Phase 3a, hub → device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncUploadAck {
    pub accepted: Vec<EventId>,
    pub duplicate: Vec<EventId>,
    pub conflicted: Vec<ConflictedEvent>,
    /// Compensation events emitted while processing this batch (review
    /// items and auto-compensations); also delivered through download.
    pub compensations: Vec<StoredEnvelope>,
}

/// Phase 3b, hub → device. One page, hub insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDownload {
    pub events: Vec<StoredEnvelope>,
    /// Cursor to acknowledge once the page is applied.
    pub hub_current_position: u64,
}

/// Phase 3b, device → hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDownloadAck {
    pub received_count: u64,
    pub last_hub_position: u64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("handshake refused: {0:?}")]
    HandshakeRefused(HandshakeStatus),

    #[error("device {0} is not registered")]
    UnknownDevice(String),

    #[error("storage failure during sync: {0}")]
    Storage(String),

    #[error("sync state corrupt: {0}")]
    State(String),
}
