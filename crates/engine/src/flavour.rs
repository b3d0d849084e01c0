//! Flavours adapt generic messages to a domain call convention.
//!
//! The engine never calls domain code directly: identifier resolution,
//! factories, subsequent functions, apply functions, projectors, listeners
//! and query resolvers are all invoked through a [`Flavour`]. The convention
//! is picked once at composition time via a generic parameter — there is no
//! runtime strategy switching.
//!
//! [`FunctionalFlavour`] is the convention shipped with the engine: domain
//! code is plain closures over JSON values, registered under string ids.
//! Typed-message and stateful-object conventions live outside this crate.

use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use keelson_core::AggregateId;
use keelson_messaging::{Message, MessageError};

#[derive(Debug, Error)]
pub enum FlavourError {
    #[error("command '{command}' does not carry aggregate identifier key '{key}'")]
    MissingAggregateIdentifier { command: String, key: String },

    #[error("no {kind} registered under id '{id}'")]
    UnknownFunction { kind: &'static str, id: String },

    #[error("no apply function registered for event '{event}' of aggregate type '{aggregate_type}'")]
    UnknownApplyFunction {
        aggregate_type: String,
        event: String,
    },

    /// A domain function did not produce an event sequence. An explicit
    /// empty sequence signals "no events"; producing nothing at all is a
    /// programmer error.
    #[error("domain function '{id}' did not produce an event sequence")]
    NoGenerator { id: String },

    #[error("domain function '{id}' failed: {source}")]
    Function {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot rebuild state of aggregate type '{0}' from a snapshot")]
    StateNotBuildable(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// One event produced by a domain function, before it becomes a recorded
/// [`Message`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub payload: JsonValue,
    pub metadata: Map<String, JsonValue>,
}

impl NewEvent {
    pub fn new(name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            name: name.into(),
            payload,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Finite, strictly-ordered, consumed-once sequence of produced events.
///
/// `None` items are explicit no-op markers and are skipped by the command
/// processor. "No events" is an explicit empty sequence ([`no_events`]),
/// never the absence of a sequence.
pub type DomainEvents = Box<dyn Iterator<Item = Option<NewEvent>>>;

pub fn domain_events(events: Vec<NewEvent>) -> DomainEvents {
    Box::new(events.into_iter().map(Some))
}

pub fn no_events() -> DomainEvents {
    Box::new(std::iter::empty())
}

/// Adapts generic messages to typed domain calls.
///
/// All methods are blocking; the engine is single-threaded and synchronous
/// by design.
pub trait Flavour: Send + Sync {
    /// Resolve the aggregate identifier from a command payload.
    fn get_aggregate_id_from_command(
        &self,
        identifier_key: &str,
        command: &Message,
    ) -> Result<AggregateId, FlavourError>;

    /// Cross-cutting read-only lookup derived from the command.
    fn call_context_provider(
        &self,
        provider_id: &str,
        command: &Message,
    ) -> Result<JsonValue, FlavourError>;

    /// Invoke the factory function for a brand-new aggregate.
    fn call_aggregate_factory(
        &self,
        function_id: &str,
        command: &Message,
        context: &[JsonValue],
    ) -> Result<DomainEvents, FlavourError>;

    /// Invoke the domain function for an existing aggregate.
    fn call_subsequent_aggregate_function(
        &self,
        function_id: &str,
        state: &JsonValue,
        command: &Message,
        context: &[JsonValue],
    ) -> Result<DomainEvents, FlavourError>;

    /// Apply the first event of an aggregate (no prior state exists).
    fn call_apply_first_event(
        &self,
        aggregate_type: &str,
        event: &Message,
    ) -> Result<JsonValue, FlavourError>;

    /// Apply a subsequent event to existing state.
    fn call_apply_subsequent_event(
        &self,
        aggregate_type: &str,
        state: &JsonValue,
        event: &Message,
    ) -> Result<JsonValue, FlavourError>;

    /// Convert opaque aggregate state into its snapshot representation.
    fn convert_aggregate_state_to_value(
        &self,
        aggregate_type: &str,
        state: &JsonValue,
    ) -> Result<JsonValue, FlavourError>;

    /// Whether snapshots of this aggregate type can be turned back into
    /// state. Types that cannot are loaded by pure event replay.
    fn can_build_aggregate_state(&self, aggregate_type: &str) -> bool;

    fn build_aggregate_state(
        &self,
        aggregate_type: &str,
        raw: JsonValue,
    ) -> Result<JsonValue, FlavourError>;

    fn can_provide_aggregate_metadata(&self, aggregate_type: &str) -> bool;

    /// Extra metadata stored alongside a snapshot document.
    fn provide_aggregate_metadata(
        &self,
        aggregate_type: &str,
        version: u64,
        state: &JsonValue,
    ) -> Result<Map<String, JsonValue>, FlavourError>;

    /// Invoke a projector against its versioned collection.
    fn call_projector(
        &self,
        projector_id: &str,
        collection: &str,
        event: &Message,
    ) -> Result<(), FlavourError>;

    /// Invoke an event listener; returned messages are follow-up commands
    /// the dispatcher recursively dispatches.
    fn call_event_listener(
        &self,
        listener_id: &str,
        event: &Message,
    ) -> Result<Vec<Message>, FlavourError>;

    fn call_query_resolver(
        &self,
        resolver_id: &str,
        query: &Message,
    ) -> Result<JsonValue, FlavourError>;

    /// Hook for messages leaving towards a transport.
    fn prepare_network_transmission(&self, message: Message) -> Result<Message, FlavourError> {
        Ok(message)
    }

    /// Hook for messages arriving from a transport.
    fn convert_message_received_from_network(
        &self,
        message: Message,
    ) -> Result<Message, FlavourError> {
        Ok(message)
    }
}

type FactoryFn = Box<dyn Fn(&Message, &[JsonValue]) -> Result<DomainEvents, anyhow::Error> + Send + Sync>;
type SubsequentFn =
    Box<dyn Fn(&JsonValue, &Message, &[JsonValue]) -> Result<DomainEvents, anyhow::Error> + Send + Sync>;
type ApplyFn = Box<dyn Fn(Option<&JsonValue>, &Message) -> JsonValue + Send + Sync>;
type ContextProviderFn = Box<dyn Fn(&Message) -> Result<JsonValue, anyhow::Error> + Send + Sync>;
type ProjectorFn = Box<dyn Fn(&str, &Message) -> Result<(), anyhow::Error> + Send + Sync>;
type ListenerFn = Box<dyn Fn(&Message) -> Result<Vec<Message>, anyhow::Error> + Send + Sync>;
type ResolverFn = Box<dyn Fn(&Message) -> Result<JsonValue, anyhow::Error> + Send + Sync>;
type MetadataProviderFn = Box<dyn Fn(u64, &JsonValue) -> Map<String, JsonValue> + Send + Sync>;

/// The functional call convention: domain code is plain closures over JSON
/// values, registered under string ids before the engine is built.
///
/// Aggregate state in this convention *is* its JSON representation, so
/// snapshots can always be rebuilt (`can_build_aggregate_state` is `true`
/// for every type).
#[derive(Default)]
pub struct FunctionalFlavour {
    factories: HashMap<String, FactoryFn>,
    subsequent: HashMap<String, SubsequentFn>,
    apply_fns: HashMap<(String, String), ApplyFn>,
    context_providers: HashMap<String, ContextProviderFn>,
    projectors: HashMap<String, ProjectorFn>,
    listeners: HashMap<String, ListenerFn>,
    resolvers: HashMap<String, ResolverFn>,
    metadata_providers: HashMap<String, MetadataProviderFn>,
}

impl FunctionalFlavour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_aggregate_factory(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&Message, &[JsonValue]) -> Result<DomainEvents, anyhow::Error> + Send + Sync + 'static,
    ) {
        self.factories.insert(id.into(), Box::new(f));
    }

    pub fn register_subsequent_function(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&JsonValue, &Message, &[JsonValue]) -> Result<DomainEvents, anyhow::Error>
            + Send
            + Sync
            + 'static,
    ) {
        self.subsequent.insert(id.into(), Box::new(f));
    }

    /// Register the apply function for one event of one aggregate type.
    ///
    /// The closure receives `None` on first apply and `Some(state)` on
    /// subsequent applies; it must return the new state. Returning JSON
    /// null is treated as a fatal invariant violation by the state machine.
    pub fn register_apply_function(
        &mut self,
        aggregate_type: impl Into<String>,
        event_name: impl Into<String>,
        f: impl Fn(Option<&JsonValue>, &Message) -> JsonValue + Send + Sync + 'static,
    ) {
        self.apply_fns
            .insert((aggregate_type.into(), event_name.into()), Box::new(f));
    }

    pub fn register_context_provider(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&Message) -> Result<JsonValue, anyhow::Error> + Send + Sync + 'static,
    ) {
        self.context_providers.insert(id.into(), Box::new(f));
    }

    pub fn register_projector(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&str, &Message) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    ) {
        self.projectors.insert(id.into(), Box::new(f));
    }

    pub fn register_event_listener(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&Message) -> Result<Vec<Message>, anyhow::Error> + Send + Sync + 'static,
    ) {
        self.listeners.insert(id.into(), Box::new(f));
    }

    pub fn register_query_resolver(
        &mut self,
        id: impl Into<String>,
        f: impl Fn(&Message) -> Result<JsonValue, anyhow::Error> + Send + Sync + 'static,
    ) {
        self.resolvers.insert(id.into(), Box::new(f));
    }

    pub fn register_metadata_provider(
        &mut self,
        aggregate_type: impl Into<String>,
        f: impl Fn(u64, &JsonValue) -> Map<String, JsonValue> + Send + Sync + 'static,
    ) {
        self.metadata_providers.insert(aggregate_type.into(), Box::new(f));
    }

    fn unknown(kind: &'static str, id: &str) -> FlavourError {
        FlavourError::UnknownFunction {
            kind,
            id: id.to_string(),
        }
    }
}

impl core::fmt::Debug for FunctionalFlavour {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FunctionalFlavour")
            .field("factories", &self.factories.len())
            .field("subsequent", &self.subsequent.len())
            .field("apply_fns", &self.apply_fns.len())
            .field("context_providers", &self.context_providers.len())
            .field("projectors", &self.projectors.len())
            .field("listeners", &self.listeners.len())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

impl Flavour for FunctionalFlavour {
    fn get_aggregate_id_from_command(
        &self,
        identifier_key: &str,
        command: &Message,
    ) -> Result<AggregateId, FlavourError> {
        let missing = || FlavourError::MissingAggregateIdentifier {
            command: command.name().to_string(),
            key: identifier_key.to_string(),
        };
        let raw = command
            .get(identifier_key)
            .and_then(JsonValue::as_str)
            .ok_or_else(missing)?;
        AggregateId::new(raw).map_err(|_| missing())
    }

    fn call_context_provider(
        &self,
        provider_id: &str,
        command: &Message,
    ) -> Result<JsonValue, FlavourError> {
        let f = self
            .context_providers
            .get(provider_id)
            .ok_or_else(|| Self::unknown("context provider", provider_id))?;
        f(command).map_err(|source| FlavourError::Function {
            id: provider_id.to_string(),
            source,
        })
    }

    fn call_aggregate_factory(
        &self,
        function_id: &str,
        command: &Message,
        context: &[JsonValue],
    ) -> Result<DomainEvents, FlavourError> {
        let f = self
            .factories
            .get(function_id)
            .ok_or_else(|| Self::unknown("aggregate factory", function_id))?;
        f(command, context).map_err(|source| FlavourError::Function {
            id: function_id.to_string(),
            source,
        })
    }

    fn call_subsequent_aggregate_function(
        &self,
        function_id: &str,
        state: &JsonValue,
        command: &Message,
        context: &[JsonValue],
    ) -> Result<DomainEvents, FlavourError> {
        let f = self
            .subsequent
            .get(function_id)
            .ok_or_else(|| Self::unknown("aggregate function", function_id))?;
        f(state, command, context).map_err(|source| FlavourError::Function {
            id: function_id.to_string(),
            source,
        })
    }

    fn call_apply_first_event(
        &self,
        aggregate_type: &str,
        event: &Message,
    ) -> Result<JsonValue, FlavourError> {
        let f = self
            .apply_fns
            .get(&(aggregate_type.to_string(), event.name().to_string()))
            .ok_or_else(|| FlavourError::UnknownApplyFunction {
                aggregate_type: aggregate_type.to_string(),
                event: event.name().to_string(),
            })?;
        Ok(f(None, event))
    }

    fn call_apply_subsequent_event(
        &self,
        aggregate_type: &str,
        state: &JsonValue,
        event: &Message,
    ) -> Result<JsonValue, FlavourError> {
        let f = self
            .apply_fns
            .get(&(aggregate_type.to_string(), event.name().to_string()))
            .ok_or_else(|| FlavourError::UnknownApplyFunction {
                aggregate_type: aggregate_type.to_string(),
                event: event.name().to_string(),
            })?;
        Ok(f(Some(state), event))
    }

    fn convert_aggregate_state_to_value(
        &self,
        _aggregate_type: &str,
        state: &JsonValue,
    ) -> Result<JsonValue, FlavourError> {
        // State already is its JSON representation in this convention.
        Ok(state.clone())
    }

    fn can_build_aggregate_state(&self, _aggregate_type: &str) -> bool {
        true
    }

    fn build_aggregate_state(
        &self,
        _aggregate_type: &str,
        raw: JsonValue,
    ) -> Result<JsonValue, FlavourError> {
        Ok(raw)
    }

    fn can_provide_aggregate_metadata(&self, aggregate_type: &str) -> bool {
        self.metadata_providers.contains_key(aggregate_type)
    }

    fn provide_aggregate_metadata(
        &self,
        aggregate_type: &str,
        version: u64,
        state: &JsonValue,
    ) -> Result<Map<String, JsonValue>, FlavourError> {
        let f = self
            .metadata_providers
            .get(aggregate_type)
            .ok_or_else(|| Self::unknown("metadata provider", aggregate_type))?;
        Ok(f(version, state))
    }

    fn call_projector(
        &self,
        projector_id: &str,
        collection: &str,
        event: &Message,
    ) -> Result<(), FlavourError> {
        let f = self
            .projectors
            .get(projector_id)
            .ok_or_else(|| Self::unknown("projector", projector_id))?;
        f(collection, event).map_err(|source| FlavourError::Function {
            id: projector_id.to_string(),
            source,
        })
    }

    fn call_event_listener(
        &self,
        listener_id: &str,
        event: &Message,
    ) -> Result<Vec<Message>, FlavourError> {
        let f = self
            .listeners
            .get(listener_id)
            .ok_or_else(|| Self::unknown("event listener", listener_id))?;
        f(event).map_err(|source| FlavourError::Function {
            id: listener_id.to_string(),
            source,
        })
    }

    fn call_query_resolver(
        &self,
        resolver_id: &str,
        query: &Message,
    ) -> Result<JsonValue, FlavourError> {
        let f = self
            .resolvers
            .get(resolver_id)
            .ok_or_else(|| Self::unknown("query resolver", resolver_id))?;
        f(query).map_err(|source| FlavourError::Function {
            id: resolver_id.to_string(),
            source,
        })
    }
}
