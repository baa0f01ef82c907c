//! Device half of the four-phase protocol.
//!
//! The device builds each request from its own durable state (outbox, LSN
//! counter, cursors) and folds the hub's replies back in. Aborting between
//! any two steps leaves everything resumable: the outbox only shrinks on
//! acknowledgement, appends are idempotent, and cursors are monotonic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use caresync_core::{AggregateId, AggregateKind, Clock, ConnectionStatus, SyncBatchId};
use caresync_events::StoredEnvelope;
use caresync_infra::event_store::AppendOutcome;
use caresync_infra::{
    CoreConfig, DeviceSession, EventDispatcher, EventStore, EventStoreError, ReadModels, Sequenced,
};

use crate::conflict::resolve_set;
use crate::hub::HubSyncEngine;
use crate::messages::{
    HandshakeStatus, PROTOCOL_VERSION, SyncDownload, SyncDownloadAck, SyncError, SyncHandshake,
    SyncHandshakeAck, SyncUpload, SyncUploadAck,
};
use crate::outbox::Outbox;
use crate::registry::SyncState;

/// What one full sync cycle did; mostly for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub uploaded: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub conflicted: usize,
    pub compensations: usize,
    pub downloaded: u64,
}

#[derive(Debug, Default)]
struct DeviceCursors {
    last_downloaded_position: u64,
    last_sync_at: Option<DateTime<Utc>>,
}

pub struct DeviceSyncEngine<S> {
    store: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    read_models: ReadModels,
    session: Arc<DeviceSession>,
    outbox: Arc<Outbox>,
    cursors: Mutex<DeviceCursors>,
    clock: Arc<dyn Clock>,
}

impl<S: EventStore> DeviceSyncEngine<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<EventDispatcher>,
        read_models: ReadModels,
        session: Arc<DeviceSession>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        _config: CoreConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            read_models,
            session,
            outbox,
            cursors: Mutex::new(DeviceCursors::default()),
            clock,
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// The device's mirror of the hub-side cursors.
    pub fn mirrored_state(&self) -> SyncState {
        let cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        SyncState {
            last_uploaded_lsn: self.session.last_lsn(),
            last_downloaded_position: cursors.last_downloaded_position,
            last_sync_at: cursors.last_sync_at,
        }
    }

    /// Phase 1 request.
    pub fn build_handshake(&self) -> SyncHandshake {
        let cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        SyncHandshake {
            device_id: self.session.device_id().to_string(),
            organization_id: self.session.organization_id(),
            protocol_version: PROTOCOL_VERSION,
            last_downloaded_position: cursors.last_downloaded_position,
            device_lsn: self.session.last_lsn(),
            pending_count: self.outbox.len() as u32,
            device_clock: self.clock.now().fixed_offset(),
        }
    }

    /// Phase 1 reply: persist the drift estimate for subsequent stamping.
    pub fn apply_handshake_ack(&self, ack: &SyncHandshakeAck) -> Result<(), SyncError> {
        if ack.status != HandshakeStatus::Ready {
            self.session.set_connection(ConnectionStatus::Offline);
            return Err(SyncError::HandshakeRefused(ack.status));
        }
        if let Some(drift) = ack.computed_drift_ms {
            self.session.set_drift_ms(drift);
        }
        self.session.set_connection(ConnectionStatus::Online);
        Ok(())
    }

    /// Phase 3a request: the outbox in LSN order, as one batch.
    pub fn build_upload(&self) -> Result<Option<SyncUpload>, SyncError> {
        let pending = self.outbox.pending();
        if pending.is_empty() {
            return Ok(None);
        }
        let mut events = Vec::with_capacity(pending.len());
        for (event_id, lsn) in pending {
            match self.store.get_event(event_id) {
                Ok(Some(envelope)) => events.push(envelope),
                Ok(None) => {
                    // Outbox points at an event the store no longer serves
                    // (displaced by a merge); drop the entry, the content is
                    // preserved hub-side.
                    warn!(%event_id, lsn, "outbox entry without stored event; dropping");
                    self.outbox.prune([event_id]);
                }
                Err(e) => return Err(SyncError::Storage(e.to_string())),
            }
        }
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(SyncUpload {
            sync_batch_id: SyncBatchId::new(),
            events,
        }))
    }

    /// Phase 3a reply: prune everything the hub settled, one way or
    /// another. Pruning is idempotent, so replayed acks are harmless.
    pub fn apply_upload_ack(&self, ack: &SyncUploadAck) {
        let settled = ack
            .accepted
            .iter()
            .chain(ack.duplicate.iter())
            .copied()
            .chain(ack.conflicted.iter().map(|c| c.event_id));
        self.outbox.prune(settled);
    }

    /// Phase 3b: fold one downloaded page into the local store.
    pub fn apply_download(&self, download: &SyncDownload) -> Result<SyncDownloadAck, SyncError> {
        // Preserve arrival order but work stream by stream, so divergent
        // streams can be merged wholesale.
        let mut order: Vec<(AggregateKind, AggregateId)> = Vec::new();
        let mut groups: HashMap<(AggregateKind, AggregateId), Vec<StoredEnvelope>> = HashMap::new();
        for envelope in &download.events {
            let key = (envelope.aggregate_type(), envelope.aggregate_id());
            if !groups.contains_key(&key) {
                order.push(key);
            }
            groups.entry(key).or_default().push(envelope.clone());
        }

        let mut received = 0u64;
        for key in order {
            let events = groups.remove(&key).unwrap_or_default();
            received += events.len() as u64;
            self.apply_stream_page(key.0, key.1, events)?;
        }

        {
            let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
            cursors.last_downloaded_position = cursors
                .last_downloaded_position
                .max(download.hub_current_position);
            cursors.last_sync_at = Some(self.clock.now());
        }
        self.dispatcher.catch_up_all();

        Ok(SyncDownloadAck {
            received_count: received,
            last_hub_position: download.hub_current_position,
        })
    }

    /// Drive a full cycle against an in-process hub. Transports replace
    /// this loop with their own carrier; the message flow is identical.
    pub fn sync_with<H: EventStore>(
        &self,
        hub: &HubSyncEngine<H>,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        let ack = hub.handle_handshake(self.build_handshake());
        self.apply_handshake_ack(&ack)?;

        if let Some(upload) = self.build_upload()? {
            report.uploaded = upload.events.len();
            let upload_ack = hub.handle_upload(self.session.device_id(), upload)?;
            report.accepted = upload_ack.accepted.len();
            report.duplicates = upload_ack.duplicate.len();
            report.conflicted = upload_ack.conflicted.len();
            report.compensations = upload_ack.compensations.len();
            self.apply_upload_ack(&upload_ack);
        }

        loop {
            let download = hub.handle_download(self.session.device_id())?;
            if download.events.is_empty() {
                // Still advance past filtered-out positions.
                self.advance_cursor(download.hub_current_position);
                hub.handle_download_ack(
                    self.session.device_id(),
                    &SyncDownloadAck {
                        received_count: 0,
                        last_hub_position: download.hub_current_position,
                    },
                );
                break;
            }
            let download_ack = self.apply_download(&download)?;
            report.downloaded += download_ack.received_count;
            hub.handle_download_ack(self.session.device_id(), &download_ack);
        }

        info!(
            device = self.session.device_id(),
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            conflicted = report.conflicted,
            "sync cycle complete"
        );
        Ok(report)
    }

    fn advance_cursor(&self, to: u64) {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.last_downloaded_position = cursors.last_downloaded_position.max(to);
        cursors.last_sync_at = Some(self.clock.now());
    }

    fn apply_stream_page(
        &self,
        kind: AggregateKind,
        aggregate_id: AggregateId,
        events: Vec<StoredEnvelope>,
    ) -> Result<(), SyncError> {
        // Divergence check: a downloaded event we already hold at a
        // different stream slot means the hub restructured this stream.
        let mut merge = false;
        for envelope in &events {
            if let Some(local) = self
                .store
                .get_event(envelope.event_id())
                .map_err(|e| SyncError::Storage(e.to_string()))?
            {
                if local.aggregate_version() != envelope.aggregate_version() {
                    merge = true;
                    break;
                }
            }
        }

        if !merge {
            for envelope in &events {
                match self.store.append(envelope) {
                    Ok(AppendOutcome::Appended { position }) => {
                        self.dispatcher.publish(&Sequenced {
                            position,
                            envelope: envelope.clone(),
                        });
                    }
                    Ok(AppendOutcome::AlreadyExists) => {}
                    Err(EventStoreError::VersionConflict { .. }) => {
                        merge = true;
                        break;
                    }
                    Err(e) => return Err(SyncError::Storage(e.to_string())),
                }
            }
        }

        if merge {
            self.merge_stream(kind, aggregate_id, events)?;
        }
        Ok(())
    }

    /// Same resolver as the hub over the same event set: the device
    /// converges on the hub's stream composition without further dialogue.
    fn merge_stream(
        &self,
        kind: AggregateKind,
        aggregate_id: AggregateId,
        downloaded: Vec<StoredEnvelope>,
    ) -> Result<(), SyncError> {
        let mut union = self
            .store
            .read_stream(kind, aggregate_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        union.extend(downloaded);

        let resolution = match resolve_set(union) {
            Ok(resolution) => resolution,
            Err(cycle) => {
                // The hub flags provenance violations; locally we leave the
                // stream as-is rather than guess.
                warn!(aggregate = %aggregate_id, error = %cycle, "skipping merge of cyclic stream");
                return Ok(());
            }
        };

        let fresh = self
            .store
            .restructure_stream(kind, aggregate_id, resolution.accepted)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        self.read_models
            .rebuild_stream(&*self.store, kind, aggregate_id);
        for item in &fresh {
            self.dispatcher.publish(item);
        }
        Ok(())
    }
}
