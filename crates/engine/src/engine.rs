//! The dispatch router — top-level entry point of the engine.
//!
//! An [`EngineBuilder`] collects every registration (aggregate
//! descriptions, command routings, pre-processors, listeners, resolvers,
//! services, projections), validates the cross references once, and compiles
//! an immutable [`Engine`]. Dispatch routes by message type: commands run
//! the full processing pipeline, events fan out to listeners, queries go to
//! their resolver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use keelson_core::Stream;
use keelson_messaging::{Message, MessageType};

use crate::aggregate::AggregateTypeDescription;
use crate::event_store::EventStore;
use crate::flavour::Flavour;
use crate::processor::{
    CommandDispatchResult, CommandProcessor, CommandProcessorDescription, DispatchCache,
    DispatchError, ServiceFn,
};
use crate::projection::{Projection, ProjectionDescription};
use crate::store::EngineStore;

/// Outcome of a pre-processor step.
pub enum PreProcessed {
    /// Continue the chain with this (possibly modified) command.
    Command(Message),
    /// The command is already handled; the chain short-circuits.
    Handled(CommandDispatchResult),
}

pub type PreProcessorFn = Arc<dyn Fn(Message) -> Result<PreProcessed, anyhow::Error> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineBuildError {
    #[error("duplicate command routing for '{0}'")]
    DuplicateCommand(String),

    #[error("duplicate aggregate type description '{0}'")]
    DuplicateAggregate(String),

    #[error("duplicate projection name '{0}'")]
    DuplicateProjection(String),

    #[error("command '{command}' references unknown aggregate type '{aggregate_type}'")]
    UnknownAggregate {
        command: String,
        aggregate_type: String,
    },

    #[error("aggregate type '{0}' declares an empty apply map")]
    EmptyApplyMap(String),

    #[error("projections require a store with a document model")]
    ProjectionsNeedDocuments,

    #[error("aggregate type '{0}' persists snapshots but the store has no document model")]
    SnapshotsNeedDocuments(String),
}

/// Collects registrations and compiles them into an [`Engine`].
pub struct EngineBuilder<F: Flavour> {
    flavour: F,
    store: EngineStore,
    aggregates: Vec<AggregateTypeDescription>,
    commands: Vec<CommandProcessorDescription>,
    pre_processors: HashMap<String, Vec<PreProcessorFn>>,
    listeners: Vec<(String, String)>,
    resolvers: HashMap<String, String>,
    services: HashMap<String, ServiceFn>,
    projections: Vec<ProjectionDescription>,
    auto_publish: bool,
    auto_project: bool,
}

impl<F: Flavour> EngineBuilder<F> {
    pub fn new(flavour: F, store: EngineStore) -> Self {
        Self {
            flavour,
            store,
            aggregates: Vec::new(),
            commands: Vec::new(),
            pre_processors: HashMap::new(),
            listeners: Vec::new(),
            resolvers: HashMap::new(),
            services: HashMap::new(),
            projections: Vec::new(),
            auto_publish: true,
            auto_project: true,
        }
    }

    pub fn describe_aggregate(mut self, description: AggregateTypeDescription) -> Self {
        self.aggregates.push(description);
        self
    }

    /// Route a command through the processing pipeline.
    pub fn process(mut self, description: CommandProcessorDescription) -> Self {
        self.commands.push(description);
        self
    }

    /// Append a pre-processor to a command's chain (runs in registration
    /// order).
    pub fn pre_process(
        mut self,
        command_name: impl Into<String>,
        pre_processor: impl Fn(Message) -> Result<PreProcessed, anyhow::Error> + Send + Sync + 'static,
    ) -> Self {
        self.pre_processors
            .entry(command_name.into())
            .or_default()
            .push(Arc::new(pre_processor));
        self
    }

    /// Register an event listener (invoked in registration order).
    pub fn on_event(mut self, event_name: impl Into<String>, listener_id: impl Into<String>) -> Self {
        self.listeners.push((event_name.into(), listener_id.into()));
        self
    }

    /// Register a query resolver.
    pub fn resolve(mut self, query_name: impl Into<String>, resolver_id: impl Into<String>) -> Self {
        self.resolvers.insert(query_name.into(), resolver_id.into());
        self
    }

    pub fn add_service(
        mut self,
        service_id: impl Into<String>,
        service: impl Fn() -> JsonValue + Send + Sync + 'static,
    ) -> Self {
        self.services.insert(service_id.into(), Arc::new(service));
        self
    }

    pub fn register_projection(mut self, description: ProjectionDescription) -> Self {
        self.projections.push(description);
        self
    }

    /// Hand event publication to the caller instead of running listeners
    /// inside the dispatch.
    pub fn disable_auto_publish(mut self) -> Self {
        self.auto_publish = false;
        self
    }

    /// Hand projection runs to the caller instead of running them inside
    /// the dispatch.
    pub fn disable_auto_project(mut self) -> Self {
        self.auto_project = false;
        self
    }

    /// Validate all cross references and compile the immutable engine.
    pub fn build(self) -> Result<Engine<F>, EngineBuildError> {
        let mut aggregates = HashMap::new();
        for description in self.aggregates {
            if description.event_names.is_empty() {
                return Err(EngineBuildError::EmptyApplyMap(description.aggregate_type));
            }
            if description.storage_mode.stores_state()
                && description.collection.is_some()
                && self.store.documents().is_none()
            {
                return Err(EngineBuildError::SnapshotsNeedDocuments(
                    description.aggregate_type,
                ));
            }
            if aggregates.contains_key(&description.aggregate_type) {
                return Err(EngineBuildError::DuplicateAggregate(
                    description.aggregate_type,
                ));
            }
            aggregates.insert(description.aggregate_type.clone(), description);
        }

        let mut commands = HashMap::new();
        for description in self.commands {
            if !aggregates.contains_key(&description.aggregate_type) {
                return Err(EngineBuildError::UnknownAggregate {
                    command: description.command_name,
                    aggregate_type: description.aggregate_type,
                });
            }
            let name = description.command_name.clone();
            if commands.insert(name.clone(), description).is_some() {
                return Err(EngineBuildError::DuplicateCommand(name));
            }
        }

        if !self.projections.is_empty() && self.store.documents().is_none() {
            return Err(EngineBuildError::ProjectionsNeedDocuments);
        }
        let mut projections = Vec::new();
        for description in self.projections {
            if projections
                .iter()
                .any(|p: &Projection| p.name() == description.name)
            {
                return Err(EngineBuildError::DuplicateProjection(description.name));
            }
            projections.push(Projection::new(description));
        }

        let mut listeners: HashMap<String, Vec<String>> = HashMap::new();
        for (event_name, listener_id) in self.listeners {
            listeners.entry(event_name).or_default().push(listener_id);
        }

        Ok(Engine {
            flavour: self.flavour,
            store: self.store,
            aggregates,
            commands,
            pre_processors: self.pre_processors,
            listeners,
            resolvers: self.resolvers,
            services: self.services,
            projections,
            auto_publish: self.auto_publish,
            auto_project: self.auto_project,
            cache: Mutex::new(DispatchCache::new()),
        })
    }
}

/// What a dispatch returned.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Root command result first, follow-up results in dispatch order.
    Commands(Vec<CommandDispatchResult>),
    /// Listeners ran; an event dispatch returns nothing to the caller.
    Event,
    Query(JsonValue),
}

/// The compiled engine. Routing is immutable after build; the only mutable
/// state is the per-dispatch cache.
///
/// Dispatches must be serialized per engine instance — the cache is scoped
/// to one top-level dispatch at a time.
pub struct Engine<F: Flavour> {
    flavour: F,
    store: EngineStore,
    aggregates: HashMap<String, AggregateTypeDescription>,
    commands: HashMap<String, CommandProcessorDescription>,
    pre_processors: HashMap<String, Vec<PreProcessorFn>>,
    listeners: HashMap<String, Vec<String>>,
    resolvers: HashMap<String, String>,
    services: HashMap<String, ServiceFn>,
    projections: Vec<Projection>,
    auto_publish: bool,
    auto_project: bool,
    cache: Mutex<DispatchCache>,
}

impl<F: Flavour> Engine<F> {
    /// Create missing streams and collections, and prepare every registered
    /// projection. Idempotent.
    pub fn bootstrap(&self) -> Result<(), DispatchError> {
        let mut streams: Vec<&Stream> = self.aggregates.values().map(|a| &a.stream).collect();
        streams.sort_by_key(|s| (s.service_name().to_string(), s.stream_name().to_string()));
        streams.dedup();
        for stream in streams {
            if !self.store.has_stream(stream)? {
                self.store.create_stream(stream)?;
            }
        }

        if let Some(documents) = self.store.documents() {
            for aggregate in self.aggregates.values() {
                if aggregate.storage_mode.stores_state() {
                    if let Some(collection) = &aggregate.collection {
                        if !documents.has_collection(collection)? {
                            documents.add_collection(collection, &[])?;
                        }
                    }
                }
            }
            for projection in &self.projections {
                projection.prepare_for_run(documents)?;
            }
        }

        Ok(())
    }

    /// Dispatch a message, routing by its type.
    #[instrument(skip(self, message), fields(message = message.name(), message_type = %message.message_type()))]
    pub fn dispatch(&self, message: Message) -> Result<DispatchOutcome, DispatchError> {
        let message = self.flavour.convert_message_received_from_network(message)?;

        match message.message_type() {
            MessageType::Command => {
                let mut cache = self.lock_cache();
                // Per-dispatch scope: cleared at the start of every
                // top-level dispatch.
                cache.clear();
                let mut results = Vec::new();
                self.dispatch_command(message, &mut cache, &mut results)?;
                Ok(DispatchOutcome::Commands(results))
            }
            MessageType::Event => {
                let mut cache = self.lock_cache();
                cache.clear();
                // Follow-up commands still run; their results are not
                // returned to the original caller.
                self.deliver_to_listeners(&message, &mut cache, &mut Vec::new())?;
                Ok(DispatchOutcome::Event)
            }
            MessageType::Query => {
                let resolver_id = self
                    .resolvers
                    .get(message.name())
                    .ok_or_else(|| DispatchError::UnknownQuery(message.name().to_string()))?;
                let value = self.flavour.call_query_resolver(resolver_id, &message)?;
                Ok(DispatchOutcome::Query(value))
            }
        }
    }

    fn dispatch_command(
        &self,
        command: Message,
        cache: &mut DispatchCache,
        results: &mut Vec<CommandDispatchResult>,
    ) -> Result<(), DispatchError> {
        let command_name = command.name().to_string();
        let Some(desc) = self.commands.get(&command_name) else {
            return Err(DispatchError::NoRouting(command_name));
        };

        let mut command = command;
        if let Some(chain) = self.pre_processors.get(&command_name) {
            for pre_processor in chain {
                match pre_processor(command).map_err(|e| DispatchError::PreProcessor {
                    command: command_name.clone(),
                    detail: e.to_string(),
                })? {
                    PreProcessed::Command(next) => command = next,
                    PreProcessed::Handled(result) => {
                        debug!(command = command_name, "pre-processor short-circuited dispatch");
                        results.push(result);
                        return Ok(());
                    }
                }
            }
        }

        let aggregate = self.aggregates.get(&desc.aggregate_type).ok_or_else(|| {
            DispatchError::Configuration(format!(
                "command '{command_name}' routed to unknown aggregate type '{}'",
                desc.aggregate_type
            ))
        })?;

        let processor = CommandProcessor {
            desc,
            aggregate,
            flavour: &self.flavour,
            store: &self.store,
            services: &self.services,
        };
        let result = processor.process(command, cache)?;

        let events = result.recorded_events().to_vec();
        let source_stream = aggregate.stream.clone();
        results.push(result);

        if self.auto_project {
            self.project(&source_stream, &events)?;
        }

        if self.auto_publish {
            for event in &events {
                self.deliver_to_listeners(event, cache, results)?;
            }
        }

        Ok(())
    }

    /// Run every registered projection against `events` coming from
    /// `source_stream`. Invoked automatically after each command unless
    /// auto-projection is disabled.
    pub fn project(&self, source_stream: &Stream, events: &[Message]) -> Result<(), DispatchError> {
        for projection in &self.projections {
            for event in events {
                if projection.is_interested_in(source_stream, event) {
                    projection.handle(&self.flavour, event)?;
                }
            }
        }
        Ok(())
    }

    fn deliver_to_listeners(
        &self,
        event: &Message,
        cache: &mut DispatchCache,
        results: &mut Vec<CommandDispatchResult>,
    ) -> Result<(), DispatchError> {
        let Some(listener_ids) = self.listeners.get(event.name()) else {
            return Ok(());
        };
        for listener_id in listener_ids {
            let follow_ups = self.flavour.call_event_listener(listener_id, event)?;
            for command in follow_ups {
                self.dispatch_command(command, cache, results)?;
            }
        }
        Ok(())
    }

    /// Tear down one projection's versioned storage (blue/green cutover).
    pub fn delete_projection(&self, name: &str) -> Result<(), DispatchError> {
        let projection = self
            .projections
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| DispatchError::UnknownProjection(name.to_string()))?;
        let documents = self.store.documents().ok_or_else(|| {
            DispatchError::Configuration(
                "projection storage requires a document model".to_string(),
            )
        })?;
        projection.delete(documents)?;
        Ok(())
    }

    /// Hand a message to the flavour's outbound network hook.
    pub fn prepare_for_transmission(&self, message: Message) -> Result<Message, DispatchError> {
        Ok(self.flavour.prepare_network_transmission(message)?)
    }

    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, DispatchCache> {
        // A poisoned cache is harmless: it is cleared at the start of every
        // top-level dispatch anyway.
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use keelson_core::StorageMode;

    use super::*;
    use crate::flavour::FunctionalFlavour;
    use crate::multi_model::InMemoryMultiModelStore;

    fn builder() -> EngineBuilder<FunctionalFlavour> {
        EngineBuilder::new(
            FunctionalFlavour::new(),
            EngineStore::multi_model(InMemoryMultiModelStore::new()),
        )
    }

    fn user_aggregate() -> AggregateTypeDescription {
        AggregateTypeDescription::new("User", ["UserRegistered"])
    }

    #[test]
    fn build_rejects_commands_for_unknown_aggregates() {
        let err = builder()
            .process(CommandProcessorDescription::new_aggregate(
                "RegisterUser",
                "User",
                "id",
                "register_user",
            ))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineBuildError::UnknownAggregate { .. }));
    }

    #[test]
    fn build_rejects_duplicate_command_routing() {
        let desc = CommandProcessorDescription::new_aggregate("RegisterUser", "User", "id", "f");
        let err = builder()
            .describe_aggregate(user_aggregate())
            .process(desc.clone())
            .process(desc)
            .build()
            .err()
            .unwrap();
        assert_eq!(err, EngineBuildError::DuplicateCommand("RegisterUser".to_string()));
    }

    #[test]
    fn build_rejects_empty_apply_maps() {
        let err = builder()
            .describe_aggregate(AggregateTypeDescription::new("User", Vec::<String>::new()))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, EngineBuildError::EmptyApplyMap("User".to_string()));
    }

    #[test]
    fn build_rejects_duplicate_projection_names() {
        let err = builder()
            .register_projection(ProjectionDescription::new("users", "1", "p"))
            .register_projection(ProjectionDescription::new("users", "2", "p"))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, EngineBuildError::DuplicateProjection("users".to_string()));
    }

    #[test]
    fn build_rejects_projections_without_document_model() {
        let err = EngineBuilder::new(
            FunctionalFlavour::new(),
            EngineStore::events_only(crate::event_store::InMemoryEventStore::new()),
        )
        .register_projection(ProjectionDescription::new("users", "1", "p"))
        .build()
        .err()
        .unwrap();
        assert_eq!(err, EngineBuildError::ProjectionsNeedDocuments);
    }

    #[test]
    fn build_rejects_snapshots_without_document_model() {
        let err = EngineBuilder::new(
            FunctionalFlavour::new(),
            EngineStore::events_only(crate::event_store::InMemoryEventStore::new()),
        )
        .describe_aggregate(
            AggregateTypeDescription::new("User", ["UserRegistered"])
                .with_storage_mode(StorageMode::EventsAndState)
                .with_collection("users_state"),
        )
        .build()
        .err()
        .unwrap();
        assert_eq!(err, EngineBuildError::SnapshotsNeedDocuments("User".to_string()));
    }

    #[test]
    fn dispatching_an_unrouted_command_is_fatal() {
        let engine = builder().build().unwrap();
        let command = Message::command("Nope", json!({})).unwrap();
        assert!(matches!(
            engine.dispatch(command),
            Err(DispatchError::NoRouting(_))
        ));
    }

    #[test]
    fn dispatching_an_unknown_query_is_fatal() {
        let engine = builder().build().unwrap();
        let query = Message::query("Nope", json!({})).unwrap();
        assert!(matches!(
            engine.dispatch(query),
            Err(DispatchError::UnknownQuery(_))
        ));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let engine = builder()
            .describe_aggregate(user_aggregate().with_snapshots("users_state"))
            .register_projection(ProjectionDescription::new("users", "1", "p"))
            .build()
            .unwrap();
        engine.bootstrap().unwrap();
        engine.bootstrap().unwrap();
        assert!(engine.store().has_stream(&Stream::of_write_model()).unwrap());
    }
}
