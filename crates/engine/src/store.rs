//! Store binding used by the engine.
//!
//! Fixed at composition time: either a plain append-only event store, or a
//! multi-model store that additionally carries the document model (snapshots,
//! projections) under a transaction boundary.

use std::sync::Arc;

use keelson_core::{AggregateId, MessageId, Stream};
use keelson_messaging::Message;

use crate::event_store::{EventStore, EventStoreError};
use crate::multi_model::MultiModelStore;

#[derive(Clone)]
pub enum EngineStore {
    /// Append-only event log, no document model.
    Events(Arc<dyn EventStore>),
    /// Event log + document store under one transaction boundary.
    MultiModel(Arc<dyn MultiModelStore>),
}

impl EngineStore {
    pub fn events_only(store: impl EventStore + 'static) -> Self {
        Self::Events(Arc::new(store))
    }

    pub fn multi_model(store: impl MultiModelStore + 'static) -> Self {
        Self::MultiModel(Arc::new(store))
    }

    /// The document-model half, when the binding has one.
    pub fn documents(&self) -> Option<&Arc<dyn MultiModelStore>> {
        match self {
            Self::Events(_) => None,
            Self::MultiModel(store) => Some(store),
        }
    }
}

impl core::fmt::Debug for EngineStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Events(_) => f.write_str("EngineStore::Events"),
            Self::MultiModel(_) => f.write_str("EngineStore::MultiModel"),
        }
    }
}

impl EventStore for EngineStore {
    fn create_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        match self {
            Self::Events(s) => s.create_stream(stream),
            Self::MultiModel(s) => s.create_stream(stream),
        }
    }

    fn delete_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        match self {
            Self::Events(s) => s.delete_stream(stream),
            Self::MultiModel(s) => s.delete_stream(stream),
        }
    }

    fn has_stream(&self, stream: &Stream) -> Result<bool, EventStoreError> {
        match self {
            Self::Events(s) => s.has_stream(stream),
            Self::MultiModel(s) => s.has_stream(stream),
        }
    }

    fn append_to(&self, stream: &Stream, events: Vec<Message>) -> Result<(), EventStoreError> {
        match self {
            Self::Events(s) => s.append_to(stream, events),
            Self::MultiModel(s) => s.append_to(stream, events),
        }
    }

    fn load_aggregate_events(
        &self,
        stream: &Stream,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        min_version: u64,
    ) -> Result<Vec<Message>, EventStoreError> {
        match self {
            Self::Events(s) => s.load_aggregate_events(stream, aggregate_type, aggregate_id, min_version),
            Self::MultiModel(s) => {
                s.load_aggregate_events(stream, aggregate_type, aggregate_id, min_version)
            }
        }
    }

    fn load_events_by_correlation_id(
        &self,
        stream: &Stream,
        correlation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        match self {
            Self::Events(s) => s.load_events_by_correlation_id(stream, correlation_id),
            Self::MultiModel(s) => s.load_events_by_correlation_id(stream, correlation_id),
        }
    }

    fn load_events_by_causation_id(
        &self,
        stream: &Stream,
        causation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        match self {
            Self::Events(s) => s.load_events_by_causation_id(stream, causation_id),
            Self::MultiModel(s) => s.load_events_by_causation_id(stream, causation_id),
        }
    }
}
