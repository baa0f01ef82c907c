//! Shared kernel for fact aggregates.
//!
//! A fact holds exactly one event, ever: the recording. State after creation
//! is frozen, which makes facts contention-free across devices; concurrent
//! offline work only ever creates new streams. `define_fact!` stamps out the
//! id, aggregate, command, and event types plus the trait wiring for one
//! fact kind; the payload type and its validation stay hand-written per
//! module.

macro_rules! define_fact {
    (
        kind: $kind:ident,
        aggregate: $aggregate:ident,
        id: $id:ident,
        command: $command:ident,
        event: $event:ident,
        event_type: $event_type:literal,
        payload: $payload:ty,
        role_permitted: $role_permitted:expr,
        visibility: $visibility:expr $(,)?
    ) => {
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $id(pub caresync_core::AggregateId);

        impl core::fmt::Display for $id {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct $aggregate {
            id: $id,
            recorded: bool,
            version: u64,
        }

        impl $aggregate {
            pub fn empty(id: $id) -> Self {
                Self {
                    id,
                    recorded: false,
                    version: 0,
                }
            }

            pub fn is_recorded(&self) -> bool {
                self.recorded
            }
        }

        impl caresync_core::AggregateRoot for $aggregate {
            type Id = $id;

            fn id(&self) -> &Self::Id {
                &self.id
            }

            fn version(&self) -> u64 {
                self.version
            }
        }

        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        pub struct $command {
            pub fact_id: $id,
            pub patient_id: caresync_core::AggregateId,
            pub encounter_id: caresync_core::AggregateId,
            pub payload: $payload,
            pub performed_by: caresync_core::PerformerId,
            pub performer_role: caresync_core::PerformerRole,
            pub occurred_at: chrono::DateTime<chrono::FixedOffset>,
        }

        impl caresync_events::Command for $command {
            fn target_aggregate_id(&self) -> caresync_core::AggregateId {
                self.fact_id.0
            }
        }

        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        pub struct $event {
            pub fact_id: $id,
            pub patient_id: caresync_core::AggregateId,
            pub encounter_id: caresync_core::AggregateId,
            pub payload: $payload,
            pub recorded_by: caresync_core::PerformerId,
            pub occurred_at: chrono::DateTime<chrono::FixedOffset>,
        }

        impl caresync_events::Event for $event {
            fn event_type(&self) -> &'static str {
                $event_type
            }

            fn occurred_at(&self) -> chrono::DateTime<chrono::FixedOffset> {
                self.occurred_at
            }

            fn visibility(&self) -> caresync_core::Visibility {
                $visibility
            }
        }

        impl caresync_core::Aggregate for $aggregate {
            type Command = $command;
            type Event = $event;
            type Error = caresync_core::DomainError;

            const KIND: caresync_core::AggregateKind = caresync_core::AggregateKind::$kind;

            fn apply(&mut self, event: &Self::Event) {
                self.id = event.fact_id;
                self.recorded = true;
                self.version += 1;
            }

            fn decide(
                &self,
                command: &Self::Command,
                clock: &dyn caresync_core::Clock,
            ) -> Result<Vec<Self::Event>, Self::Error> {
                caresync_core::ensure_occurred_at_plausible(command.occurred_at, clock)?;
                let role_permitted: fn(caresync_core::PerformerRole) -> bool = $role_permitted;
                if !role_permitted(command.performer_role) {
                    return Err(caresync_core::DomainError::invariant(
                        caresync_core::InvariantCode::RoleNotPermitted,
                        concat!("role not permitted to record ", $event_type),
                    ));
                }
                if self.recorded {
                    return Err(caresync_core::DomainError::invariant(
                        caresync_core::InvariantCode::FactAlreadyRecorded,
                        concat!($event_type, " is already recorded"),
                    ));
                }
                command.payload.validate()?;
                Ok(vec![$event {
                    fact_id: command.fact_id,
                    patient_id: command.patient_id,
                    encounter_id: command.encounter_id,
                    payload: command.payload.clone(),
                    recorded_by: command.performed_by,
                    occurred_at: command.occurred_at,
                }])
            }
        }

        impl caresync_core::StateMachine for $aggregate {
            fn permits(&self, _event: &Self::Event) -> Result<(), caresync_core::DomainError> {
                if self.recorded {
                    return Err(caresync_core::DomainError::invariant(
                        caresync_core::InvariantCode::FactAlreadyRecorded,
                        concat!($event_type, " is already recorded"),
                    ));
                }
                Ok(())
            }
        }
    };
}

pub(crate) use define_fact;
