//! Hub half of the four-phase protocol.
//!
//! The hub is the authority: it validates devices at handshake, computes
//! clock drift, absorbs uploads idempotently, arbitrates contested streams
//! through causal replay, runs the compensation engine after each accepted
//! event, and pages downloads per device cursor. Every phase is re-runnable
//! with the same result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use caresync_core::Clock;
use caresync_events::StoredEnvelope;
use caresync_infra::{
    CoreConfig, DeviceSession, EventDispatcher, EventFilter, EventStore, EventStoreError,
    ReadModels, Sequenced,
};
use caresync_infra::event_store::AppendOutcome;

use crate::compensation::CompensationEngine;
use crate::conflict::resolve_set;
use crate::messages::{
    ConflictResolutionOutcome, ConflictedEvent, HandshakeStatus, PROTOCOL_VERSION, SyncDownload,
    SyncDownloadAck, SyncError, SyncHandshake, SyncHandshakeAck, SyncUpload, SyncUploadAck,
};
use crate::registry::{DeviceRegistry, SyncState};

pub struct HubSyncEngine<S> {
    store: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    read_models: ReadModels,
    registry: Arc<DeviceRegistry>,
    compensation: CompensationEngine,
    sessions: Mutex<HashMap<String, SyncState>>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl<S: EventStore> HubSyncEngine<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<EventDispatcher>,
        read_models: ReadModels,
        registry: Arc<DeviceRegistry>,
        hub_session: Arc<DeviceSession>,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        let compensation =
            CompensationEngine::new(read_models.clone(), hub_session, clock.clone());
        Self {
            store,
            dispatcher,
            read_models,
            registry,
            compensation,
            sessions: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    pub fn sync_state(&self, device_id: &str) -> SyncState {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(device_id).cloned())
            .unwrap_or_default()
    }

    /// Phase 1: validate the device and estimate its clock drift.
    pub fn handle_handshake(&self, handshake: SyncHandshake) -> SyncHandshakeAck {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return SyncHandshakeAck::refused(HandshakeStatus::ProtocolUnsupported);
        }
        let Some(record) = self.registry.get(&handshake.device_id) else {
            return SyncHandshakeAck::refused(HandshakeStatus::DeviceRevoked);
        };
        if record.revoked {
            return SyncHandshakeAck::refused(HandshakeStatus::DeviceRevoked);
        }
        if record.organization_id != handshake.organization_id {
            return SyncHandshakeAck::refused(HandshakeStatus::OrgMismatch);
        }

        let hub_now = self.clock.now();
        let drift_ms = handshake
            .device_clock
            .with_timezone(&Utc)
            .signed_duration_since(hub_now)
            .num_milliseconds();
        if drift_ms.abs() > self.config.drift_warn_ms {
            // Accepted but annotated; the drift rides on every envelope the
            // device stamps and surfaces in the documentation audit.
            warn!(
                device = %handshake.device_id,
                drift_ms,
                "device clock drift exceeds the warning threshold"
            );
        }

        let hub_current_position = self.store.current_position().unwrap_or(0);
        let events_available = self
            .count_available(&record.organization_id, &record.audience, handshake.last_downloaded_position);

        info!(
            device = %handshake.device_id,
            pending = handshake.pending_count,
            drift_ms,
            "sync handshake accepted"
        );

        SyncHandshakeAck {
            status: HandshakeStatus::Ready,
            hub_clock: Some(hub_now.fixed_offset()),
            computed_drift_ms: Some(drift_ms),
            hub_current_position: Some(hub_current_position),
            events_available: Some(events_available),
        }
    }

    /// Phase 3a: absorb one upload batch, event by event, in LSN order.
    pub fn handle_upload(
        &self,
        device_id: &str,
        upload: SyncUpload,
    ) -> Result<SyncUploadAck, SyncError> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;

        let mut ack = SyncUploadAck::default();
        let mut highest_lsn = 0u64;

        for event in upload.events {
            let event = event.with_sync_batch(upload.sync_batch_id);
            highest_lsn = highest_lsn.max(event.device().local_sequence_number);

            if event.organization_id() != record.organization_id {
                warn!(device = device_id, event = %event.event_id(), "upload crosses organizations");
                return Err(SyncError::State(
                    "upload batch crosses organizations".to_string(),
                ));
            }

            if self
                .store
                .exists(event.event_id())
                .map_err(storage_err)?
            {
                ack.duplicate.push(event.event_id());
                continue;
            }

            match self.store.append(&event) {
                Ok(AppendOutcome::Appended { position }) => {
                    self.dispatcher.publish(&Sequenced {
                        position,
                        envelope: event.clone(),
                    });
                    self.dispatcher.catch_up_all();
                    ack.accepted.push(event.event_id());
                    self.run_compensation(&event, &mut ack)?;
                }
                Ok(AppendOutcome::AlreadyExists) => {
                    ack.duplicate.push(event.event_id());
                }
                Err(EventStoreError::VersionConflict { .. }) => {
                    self.resolve_contested(event, &mut ack)?;
                }
                Err(e) => return Err(storage_err(e)),
            }
        }

        if let Ok(mut sessions) = self.sessions.lock() {
            let state = sessions.entry(device_id.to_string()).or_default();
            state.last_uploaded_lsn = state.last_uploaded_lsn.max(highest_lsn);
            state.last_sync_at = Some(self.clock.now());
        }

        Ok(ack)
    }

    /// Phase 3b: one download page after the device's cursor.
    pub fn handle_download(&self, device_id: &str) -> Result<SyncDownload, SyncError> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;

        let cursor = self.sync_state(device_id).last_downloaded_position;
        let filter = EventFilter::for_organization(record.organization_id)
            .with_visibility_mask(record.audience.clone());

        let (page, next_cursor) = self
            .store
            .read_after(&filter, cursor, self.config.sync_page_size)
            .map_err(storage_err)?;

        Ok(SyncDownload {
            events: page.into_iter().map(|s| s.envelope).collect(),
            hub_current_position: next_cursor,
        })
    }

    /// Phase 4: the device acknowledged a page; cursors only move forward.
    pub fn handle_download_ack(&self, device_id: &str, ack: &SyncDownloadAck) {
        if let Ok(mut sessions) = self.sessions.lock() {
            let state = sessions.entry(device_id.to_string()).or_default();
            state.last_downloaded_position =
                state.last_downloaded_position.max(ack.last_hub_position);
            state.last_sync_at = Some(self.clock.now());
        }
    }

    /// Version conflict: rebuild the contested stream from the causal order
    /// of its full event set, then report the uploaded event's fate.
    fn resolve_contested(
        &self,
        event: StoredEnvelope,
        ack: &mut SyncUploadAck,
    ) -> Result<(), SyncError> {
        let kind = event.aggregate_type();
        let aggregate_id = event.aggregate_id();
        let event_id = event.event_id();

        let existing = self
            .store
            .read_stream(kind, aggregate_id)
            .map_err(storage_err)?;

        let mut union = existing;
        union.push(event.clone());

        let resolution = match resolve_set(union) {
            Ok(resolution) => resolution,
            Err(cycle) => {
                // Provenance violation: preserve the event for review, touch
                // nothing.
                warn!(event = %event_id, error = %cycle, "causal cycle in contested stream");
                for compensation in
                    self.compensation
                        .review_for_rejection(&event, caresync_core::InvariantCode::CausationCycle, &*self.store)
                {
                    self.append_compensation(compensation, ack)?;
                }
                ack.conflicted.push(ConflictedEvent {
                    event_id,
                    resolution: ConflictResolutionOutcome::Rejected {
                        code: caresync_core::InvariantCode::CausationCycle,
                    },
                });
                return Ok(());
            }
        };

        // Preserve displaced events before restructuring drops them from
        // the read path.
        for (displaced, code) in &resolution.rejected {
            for compensation in
                self.compensation
                    .review_for_rejection(displaced, *code, &*self.store)
            {
                self.append_compensation(compensation, ack)?;
            }
        }

        let fresh = self
            .store
            .restructure_stream(kind, aggregate_id, resolution.accepted.clone())
            .map_err(storage_err)?;
        self.read_models
            .rebuild_stream(&*self.store, kind, aggregate_id);
        for item in &fresh {
            self.dispatcher.publish(item);
        }
        self.dispatcher.catch_up_all();

        let outcome = if let Some(new_version) = resolution.version_of(event_id) {
            ConflictResolutionOutcome::AcceptedRenumbered { new_version }
        } else if resolution.duplicates.contains(&event_id) {
            ConflictResolutionOutcome::Duplicate
        } else {
            let code = resolution
                .rejected
                .iter()
                .find(|(e, _)| e.event_id() == event_id)
                .map(|(_, code)| *code)
                .unwrap_or(caresync_core::InvariantCode::CausationCycle);
            ConflictResolutionOutcome::Rejected { code }
        };
        info!(event = %event_id, ?outcome, "contested upload resolved");
        ack.conflicted.push(ConflictedEvent {
            event_id,
            resolution: outcome,
        });

        Ok(())
    }

    fn run_compensation(
        &self,
        event: &StoredEnvelope,
        ack: &mut SyncUploadAck,
    ) -> Result<(), SyncError> {
        for compensation in self.compensation.check(event, &*self.store) {
            self.append_compensation(compensation, ack)?;
        }
        Ok(())
    }

    fn append_compensation(
        &self,
        compensation: StoredEnvelope,
        ack: &mut SyncUploadAck,
    ) -> Result<(), SyncError> {
        match self.store.append(&compensation) {
            Ok(AppendOutcome::Appended { position }) => {
                self.dispatcher.publish(&Sequenced {
                    position,
                    envelope: compensation.clone(),
                });
                self.dispatcher.catch_up_all();
                ack.compensations.push(compensation);
                Ok(())
            }
            Ok(AppendOutcome::AlreadyExists) => Ok(()),
            Err(EventStoreError::VersionConflict { .. }) => {
                // Another upload already advanced this stream; the
                // deterministic event id makes the retry a no-op or the
                // next sync emits it against the fresh version.
                Ok(())
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    fn count_available(
        &self,
        organization_id: &caresync_core::OrganizationId,
        audience: &caresync_core::Visibility,
        cursor: u64,
    ) -> u64 {
        let filter = EventFilter::for_organization(*organization_id)
            .with_visibility_mask(audience.clone());
        let mut remaining = 0u64;
        let mut cursor = cursor;
        loop {
            match self
                .store
                .read_after(&filter, cursor, self.config.sync_page_size)
            {
                Ok((page, next)) => {
                    if page.is_empty() {
                        return remaining;
                    }
                    remaining += page.len() as u64;
                    cursor = next;
                }
                Err(_) => return remaining,
            }
        }
    }
}

fn storage_err(e: EventStoreError) -> SyncError {
    SyncError::Storage(e.to_string())
}
