//! Two-node harness: a hub and any number of device nodes sharing one
//! pinned clock, wired exactly like production minus the transport.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::Value as JsonValue;

use caresync_core::{
    AggregateId, AggregateKind, EventId, FacilityId, FixedClock, OrganizationId, PerformerId,
    PerformerRole,
};
use caresync_events::CommandContext;
use caresync_infra::{
    ClinicalCommandHandler, CommandGateway, CommandOutcome, CommandRequest, CoreConfig,
    DeviceSession, DeliveryMode, EventDispatcher, EventStore, InMemoryEventStore, ReadModels,
};
use caresync_sync::{DeviceRegistry, DeviceSyncEngine, HubSyncEngine, Outbox};

pub struct DeviceNode {
    pub store: Arc<InMemoryEventStore>,
    pub dispatcher: Arc<EventDispatcher>,
    pub read_models: ReadModels,
    pub session: Arc<DeviceSession>,
    pub outbox: Arc<Outbox>,
    pub gateway: CommandGateway<InMemoryEventStore>,
    pub sync: DeviceSyncEngine<InMemoryEventStore>,
    pub clock: Arc<FixedClock>,
    pub org: OrganizationId,
}

impl DeviceNode {
    pub fn new(device_id: &str, org: OrganizationId, clock: Arc<FixedClock>) -> Self {
        let config = CoreConfig::immediate();
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            store.clone() as Arc<dyn EventStore>,
            config.clone(),
        ));
        let read_models = ReadModels::new();
        for projection in read_models.projections() {
            dispatcher.register(projection, DeliveryMode::OnDemand);
        }
        let session = Arc::new(DeviceSession::new(device_id, org));
        let outbox = Arc::new(Outbox::new());
        let handler = ClinicalCommandHandler::new(
            store.clone(),
            dispatcher.clone(),
            read_models.clone(),
            session.clone(),
            clock.clone(),
            config.clone(),
        )
        .with_outbox(outbox.clone());
        let sync = DeviceSyncEngine::new(
            store.clone(),
            dispatcher.clone(),
            read_models.clone(),
            session.clone(),
            outbox.clone(),
            clock.clone(),
            config,
        );
        Self {
            gateway: CommandGateway::new(handler),
            store,
            dispatcher,
            read_models,
            session,
            outbox,
            sync,
            clock,
            org,
        }
    }

    pub fn dispatch(
        &self,
        command_type: &str,
        payload: JsonValue,
        role: PerformerRole,
    ) -> CommandOutcome {
        let outcome = self.gateway.dispatch(
            CommandRequest {
                command_type: command_type.to_string(),
                payload,
            },
            CommandContext::new(PerformerId::new(), role, self.org, FacilityId::new()),
        );
        self.dispatcher.catch_up_all();
        outcome
    }

    pub fn must(&self, command_type: &str, payload: JsonValue, role: PerformerRole) {
        let outcome = self.dispatch(command_type, payload, role);
        assert!(
            outcome.is_success(),
            "{command_type} failed on {}: {outcome:?}",
            self.session.device_id()
        );
    }
}

pub struct HubNode {
    pub store: Arc<InMemoryEventStore>,
    pub dispatcher: Arc<EventDispatcher>,
    pub read_models: ReadModels,
    pub registry: Arc<DeviceRegistry>,
    pub engine: HubSyncEngine<InMemoryEventStore>,
    pub gateway: CommandGateway<InMemoryEventStore>,
    pub clock: Arc<FixedClock>,
    pub org: OrganizationId,
}

impl HubNode {
    pub fn new(org: OrganizationId, clock: Arc<FixedClock>) -> Self {
        let config = CoreConfig {
            strict_preconditions: true,
            ..CoreConfig::immediate()
        };
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(
            store.clone() as Arc<dyn EventStore>,
            config.clone(),
        ));
        let read_models = ReadModels::new();
        for projection in read_models.projections() {
            dispatcher.register(projection, DeliveryMode::OnDemand);
        }
        let hub_session = Arc::new(DeviceSession::new("hub", org));
        let handler = ClinicalCommandHandler::new(
            store.clone(),
            dispatcher.clone(),
            read_models.clone(),
            hub_session.clone(),
            clock.clone(),
            config.clone(),
        );
        let registry = Arc::new(DeviceRegistry::new());
        let engine = HubSyncEngine::new(
            store.clone(),
            dispatcher.clone(),
            read_models.clone(),
            registry.clone(),
            hub_session,
            clock.clone(),
            config,
        );
        Self {
            gateway: CommandGateway::new(handler),
            store,
            dispatcher,
            read_models,
            registry,
            engine,
            clock,
            org,
        }
    }

    pub fn dispatch(
        &self,
        command_type: &str,
        payload: JsonValue,
        role: PerformerRole,
    ) -> CommandOutcome {
        let outcome = self.gateway.dispatch(
            CommandRequest {
                command_type: command_type.to_string(),
                payload,
            },
            CommandContext::new(PerformerId::new(), role, self.org, FacilityId::new()),
        );
        self.dispatcher.catch_up_all();
        outcome
    }

    pub fn must(&self, command_type: &str, payload: JsonValue, role: PerformerRole) {
        let outcome = self.dispatch(command_type, payload, role);
        assert!(outcome.is_success(), "{command_type} failed on hub: {outcome:?}");
    }

    /// Dispatch as a specific performer (self-cosign tests and friends).
    pub fn dispatch_as(
        &self,
        performer: PerformerId,
        command_type: &str,
        payload: JsonValue,
        role: PerformerRole,
    ) -> CommandOutcome {
        let outcome = self.gateway.dispatch(
            CommandRequest {
                command_type: command_type.to_string(),
                payload,
            },
            CommandContext::new(performer, role, self.org, FacilityId::new()),
        );
        self.dispatcher.catch_up_all();
        outcome
    }
}

pub fn pinned_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::at(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ))
}

/// Identity + placement of a stream, for cross-node convergence asserts.
/// (Batch markers differ between a device's original and the hub's synced
/// copy, so full envelope equality is deliberately not used.)
pub fn fingerprint(
    store: &InMemoryEventStore,
    kind: AggregateKind,
    id: AggregateId,
) -> Vec<(EventId, u64)> {
    store
        .read_stream(kind, id)
        .unwrap()
        .iter()
        .map(|e| (e.event_id(), e.aggregate_version()))
        .collect()
}
