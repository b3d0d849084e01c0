//! Append-only event store boundary.
//!
//! Defines the storage-facing abstraction for event streams without making
//! any backend assumptions. Events are full [`Message`] envelopes; the store
//! indexes them by the aggregate metadata stamped during recording and
//! enforces the (aggregate type, aggregate id, version) uniqueness constraint
//! that backs optimistic concurrency.

use std::sync::Arc;

use thiserror::Error;

use keelson_core::{AggregateId, MessageId, Stream};
use keelson_messaging::Message;

pub mod in_memory;

pub use in_memory::InMemoryEventStore;

/// Event store operation error.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("stream '{0}' does not exist")]
    StreamNotFound(String),

    #[error("stream '{0}' already exists")]
    StreamExists(String),

    /// The (aggregate type, aggregate id, version) uniqueness constraint was
    /// violated — a concurrent writer got there first.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Append-only event store keyed by (stream, aggregate type, aggregate id,
/// version).
///
/// Implementations must:
/// - keep events of one aggregate strictly version-ordered on read and write
/// - reject appends that reuse an already-taken (type, id, version) slot
/// - never reorder or drop events
pub trait EventStore: Send + Sync {
    fn create_stream(&self, stream: &Stream) -> Result<(), EventStoreError>;

    fn delete_stream(&self, stream: &Stream) -> Result<(), EventStoreError>;

    fn has_stream(&self, stream: &Stream) -> Result<bool, EventStoreError>;

    /// Append events to a stream. Every event must carry aggregate metadata
    /// (`_aggregate_type`, `_aggregate_id`, `_aggregate_version`).
    fn append_to(&self, stream: &Stream, events: Vec<Message>) -> Result<(), EventStoreError>;

    /// Load events of one aggregate, version-ascending, starting at
    /// `min_version`.
    fn load_aggregate_events(
        &self,
        stream: &Stream,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        min_version: u64,
    ) -> Result<Vec<Message>, EventStoreError>;

    /// Load all events of a stream sharing a correlation id, in insertion
    /// order.
    fn load_events_by_correlation_id(
        &self,
        stream: &Stream,
        correlation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError>;

    /// Load all events of a stream caused by one message, in insertion order.
    fn load_events_by_causation_id(
        &self,
        stream: &Stream,
        causation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn create_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        (**self).create_stream(stream)
    }

    fn delete_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        (**self).delete_stream(stream)
    }

    fn has_stream(&self, stream: &Stream) -> Result<bool, EventStoreError> {
        (**self).has_stream(stream)
    }

    fn append_to(&self, stream: &Stream, events: Vec<Message>) -> Result<(), EventStoreError> {
        (**self).append_to(stream, events)
    }

    fn load_aggregate_events(
        &self,
        stream: &Stream,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        min_version: u64,
    ) -> Result<Vec<Message>, EventStoreError> {
        (**self).load_aggregate_events(stream, aggregate_type, aggregate_id, min_version)
    }

    fn load_events_by_correlation_id(
        &self,
        stream: &Stream,
        correlation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        (**self).load_events_by_correlation_id(stream, correlation_id)
    }

    fn load_events_by_causation_id(
        &self,
        stream: &Stream,
        causation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        (**self).load_events_by_causation_id(stream, causation_id)
    }
}
