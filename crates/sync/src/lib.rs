//! Hub/spoke synchronization: the four-phase protocol, conflict
//! resolution over the causal order, and the compensation engine.
//!
//! Devices never talk to each other; every exchange is device ↔ hub.
//! Transports are external collaborators — both engine halves operate on
//! the wire message values directly, so any carrier (HTTP, queue, or an
//! in-process call in tests) works unchanged.

pub mod compensation;
pub mod conflict;
pub mod device;
pub mod hub;
pub mod messages;
pub mod outbox;
pub mod registry;

pub use compensation::{COMPENSATION_EVENT_TYPE, CompensationEngine, CompensationRequired};
pub use conflict::{ResolvedStream, resolve_set};
pub use device::{DeviceSyncEngine, SyncReport};
pub use hub::HubSyncEngine;
pub use messages::{
    ConflictResolutionOutcome, ConflictedEvent, HandshakeStatus, PROTOCOL_VERSION, SyncDownload,
    SyncDownloadAck, SyncError, SyncHandshake, SyncHandshakeAck, SyncUpload, SyncUploadAck,
};
pub use outbox::Outbox;
pub use registry::{DeviceRecord, DeviceRegistry, SyncState};
