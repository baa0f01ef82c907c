//! Write-side infrastructure: event store, command pipeline, dispatcher,
//! and the handler-internal read models.

pub mod commands;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod event_store;
pub mod gateway;
pub mod handler;
pub mod query;
pub mod read_model;
pub mod read_models;


pub use commands::ClinicalCommand;
pub use config::CoreConfig;
pub use device::DeviceSession;
pub use dispatcher::{DeadLetter, DeliveryMode, EventDispatcher};
pub use event_store::{
    AppendOutcome, EventFilter, EventStore, EventStoreError, InMemoryEventStore, Sequenced,
};
pub use gateway::{CommandGateway, CommandOutcome, CommandRequest};
pub use handler::{ClinicalCommandHandler, HandlerError, OutboxSink};
pub use query::{QueryGateway, QueryRequest, QueryResult};
pub use read_models::ReadModels;
