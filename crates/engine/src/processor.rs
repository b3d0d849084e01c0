//! Command execution pipeline.
//!
//! One [`CommandProcessor`] run covers the full lifecycle of a single
//! command: identifier resolution, aggregate load (or creation), domain
//! function invocation, event recording, transactional save, and the
//! per-dispatch cache update.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use keelson_core::AggregateId;
use keelson_messaging::{Message, MessageError};

use crate::aggregate::{AggregateError, AggregateRoot, AggregateTypeDescription, Repository, RepositoryError};
use crate::document_store::DocumentStoreError;
use crate::event_store::EventStoreError;
use crate::flavour::{Flavour, FlavourError};
use crate::projection::ProjectionError;
use crate::store::EngineStore;

/// A service looked up by id and passed to domain functions as an extra
/// call argument.
pub type ServiceFn = Arc<dyn Fn() -> JsonValue + Send + Sync>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no routing configured for command '{0}'")]
    NoRouting(String),

    /// Defensive routing check: a processor only accepts its own command.
    #[error("command '{got}' reached the processor of '{expected}'")]
    WrongRouting { expected: String, got: String },

    #[error("aggregate of type '{aggregate_type}' with id '{aggregate_id}' not found")]
    AggregateNotFound {
        aggregate_type: String,
        aggregate_id: AggregateId,
    },

    #[error("no query resolver registered for '{0}'")]
    UnknownQuery(String),

    #[error("no projection registered under name '{0}'")]
    UnknownProjection(String),

    #[error("no service registered under id '{0}'")]
    UnknownService(String),

    #[error("pre-processor for command '{command}' failed: {detail}")]
    PreProcessor { command: String, detail: String },

    #[error("engine misconfiguration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Flavour(#[from] FlavourError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Documents(#[from] DocumentStoreError),
}

/// Static routing description for one command, compiled at engine build
/// time.
#[derive(Debug, Clone)]
pub struct CommandProcessorDescription {
    pub command_name: String,
    pub aggregate_type: String,
    /// `true` for factory commands that bring a new aggregate to life.
    pub create_aggregate: bool,
    /// Payload key the aggregate identifier is resolved from.
    pub aggregate_identifier: String,
    /// Id of the domain function the flavour invokes.
    pub function_id: String,
    /// Context providers invoked in declared order before the domain
    /// function.
    pub context_providers: Vec<String>,
    /// Services resolved and passed after the context provider outputs.
    pub services: Vec<String>,
    /// Merge the triggering command's metadata into each produced event.
    pub forward_metadata: bool,
}

impl CommandProcessorDescription {
    /// Describe a command that creates a new aggregate.
    pub fn new_aggregate(
        command_name: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_identifier: impl Into<String>,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            command_name: command_name.into(),
            aggregate_type: aggregate_type.into(),
            create_aggregate: true,
            aggregate_identifier: aggregate_identifier.into(),
            function_id: function_id.into(),
            context_providers: Vec::new(),
            services: Vec::new(),
            forward_metadata: false,
        }
    }

    /// Describe a command handled by an existing aggregate.
    pub fn existing_aggregate(
        command_name: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_identifier: impl Into<String>,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            create_aggregate: false,
            ..Self::new_aggregate(command_name, aggregate_type, aggregate_identifier, function_id)
        }
    }

    pub fn with_context_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.context_providers.push(provider_id.into());
        self
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.services.push(service_id.into());
        self
    }

    pub fn with_forward_metadata(mut self) -> Self {
        self.forward_metadata = true;
        self
    }
}

/// Result of one successfully handled command.
#[derive(Debug, Clone)]
pub struct CommandDispatchResult {
    dispatched_command: Message,
    aggregate_id: AggregateId,
    recorded_events: Vec<Message>,
}

impl CommandDispatchResult {
    pub fn new(
        dispatched_command: Message,
        aggregate_id: AggregateId,
        recorded_events: Vec<Message>,
    ) -> Self {
        Self {
            dispatched_command,
            aggregate_id,
            recorded_events,
        }
    }

    pub fn dispatched_command(&self) -> &Message {
        &self.dispatched_command
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn recorded_events(&self) -> &[Message] {
        &self.recorded_events
    }
}

/// Per-dispatch aggregate cache keyed by (type, id) → (version, state).
///
/// Scoped to one top-level dispatch and cleared at its start; avoids
/// redundant reloads when listeners fan follow-up commands back into the
/// same aggregates. Never a cross-request cache.
#[derive(Debug, Default)]
pub struct DispatchCache {
    entries: HashMap<(String, AggregateId), (u64, JsonValue)>,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, aggregate_type: &str, aggregate_id: &AggregateId) -> Option<&(u64, JsonValue)> {
        self.entries
            .get(&(aggregate_type.to_string(), aggregate_id.clone()))
    }

    pub fn put(
        &mut self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        version: u64,
        state: JsonValue,
    ) {
        self.entries.insert(
            (aggregate_type.to_string(), aggregate_id.clone()),
            (version, state),
        );
    }
}

/// Executes one command against one aggregate. Borrowed from the engine per
/// dispatch.
pub(crate) struct CommandProcessor<'e, F: Flavour> {
    pub desc: &'e CommandProcessorDescription,
    pub aggregate: &'e AggregateTypeDescription,
    pub flavour: &'e F,
    pub store: &'e EngineStore,
    pub services: &'e HashMap<String, ServiceFn>,
}

impl<'e, F: Flavour> CommandProcessor<'e, F> {
    fn repository(&self) -> Repository<'e> {
        Repository::new(
            self.store,
            &self.aggregate.stream,
            &self.aggregate.aggregate_type,
            &self.aggregate.event_names,
            self.aggregate.storage_mode,
            self.aggregate.collection.as_deref(),
        )
    }

    pub(crate) fn process(
        &self,
        command: Message,
        cache: &mut DispatchCache,
    ) -> Result<CommandDispatchResult, DispatchError> {
        if command.name() != self.desc.command_name {
            return Err(DispatchError::WrongRouting {
                expected: self.desc.command_name.clone(),
                got: command.name().to_string(),
            });
        }

        let aggregate_id = self
            .flavour
            .get_aggregate_id_from_command(&self.desc.aggregate_identifier, &command)?;
        debug!(command = command.name(), aggregate_id = %aggregate_id, "processing command");

        let aggregate_type = &self.aggregate.aggregate_type;
        let mut root = if self.desc.create_aggregate {
            AggregateRoot::new(
                aggregate_id.clone(),
                aggregate_type,
                self.aggregate.event_names.clone(),
            )
        } else if let Some((version, state)) = cache.get(aggregate_type, &aggregate_id) {
            AggregateRoot::reconstitute(
                aggregate_id.clone(),
                aggregate_type,
                self.aggregate.event_names.clone(),
                *version,
                state.clone(),
            )
        } else {
            self.repository()
                .get_aggregate_root(self.flavour, &aggregate_id, None)?
                .ok_or_else(|| DispatchError::AggregateNotFound {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                })?
        };

        // Context providers first, then services, in declared order.
        let mut context = Vec::new();
        for provider_id in &self.desc.context_providers {
            context.push(self.flavour.call_context_provider(provider_id, &command)?);
        }
        for service_id in &self.desc.services {
            let service = self
                .services
                .get(service_id)
                .ok_or_else(|| DispatchError::UnknownService(service_id.clone()))?;
            context.push(service());
        }

        let produced = if self.desc.create_aggregate {
            self.flavour
                .call_aggregate_factory(&self.desc.function_id, &command, &context)?
        } else {
            // Loaded roots always carry state; a stateless one is as good as
            // missing.
            let state = root.state().cloned().ok_or_else(|| {
                DispatchError::AggregateNotFound {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                }
            })?;
            self.flavour.call_subsequent_aggregate_function(
                &self.desc.function_id,
                &state,
                &command,
                &context,
            )?
        };

        for item in produced {
            // `None` items are explicit no-op markers.
            let Some(new_event) = item else { continue };

            let event = Message::event(new_event.name, new_event.payload)?;
            let mut metadata = if self.desc.forward_metadata {
                command.metadata().clone()
            } else {
                serde_json::Map::new()
            };
            // Event-specific metadata wins over forwarded command metadata.
            metadata.extend(new_event.metadata);
            let event = event.with_metadata(metadata);

            root.record_that(self.flavour, &command, event)?;
        }

        let committed = self
            .repository()
            .save_aggregate_root(self.flavour, &mut root)?;

        if let Some(state) = root.state() {
            cache.put(aggregate_type, &aggregate_id, root.version(), state.clone());
        }

        Ok(CommandDispatchResult::new(command, aggregate_id, committed))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn cache_is_keyed_by_type_and_id() {
        let mut cache = DispatchCache::new();
        let id = AggregateId::new("A1").unwrap();

        cache.put("User", &id, 3, json!({"name": "Alice"}));
        assert_eq!(cache.get("User", &id), Some(&(3, json!({"name": "Alice"}))));
        assert_eq!(cache.get("Order", &id), None);

        cache.clear();
        assert_eq!(cache.get("User", &id), None);
    }

    #[test]
    fn description_builders_accumulate_call_arguments() {
        let desc = CommandProcessorDescription::existing_aggregate("ChangeName", "User", "id", "f")
            .with_context_provider("policy")
            .with_service("clock")
            .with_forward_metadata();

        assert!(!desc.create_aggregate);
        assert_eq!(desc.context_providers, vec!["policy"]);
        assert_eq!(desc.services, vec!["clock"]);
        assert!(desc.forward_metadata);
    }
}
