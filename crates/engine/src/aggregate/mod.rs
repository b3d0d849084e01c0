//! Aggregate machinery: state machine, repository and type descriptions.

use std::collections::BTreeSet;

use keelson_core::{StorageMode, Stream};

pub mod repository;
pub mod root;

pub use repository::{Repository, RepositoryError};
pub use root::{AggregateError, AggregateRoot};

/// Static description of one aggregate type, compiled at engine build time.
#[derive(Debug, Clone)]
pub struct AggregateTypeDescription {
    pub aggregate_type: String,
    /// Apply-map keys: the event names this aggregate can record.
    pub event_names: BTreeSet<String>,
    /// Stream its events are written to.
    pub stream: Stream,
    pub storage_mode: StorageMode,
    /// Snapshot collection, when state is persisted.
    pub collection: Option<String>,
}

impl AggregateTypeDescription {
    pub fn new(
        aggregate_type: impl Into<String>,
        event_names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_names: event_names.into_iter().map(Into::into).collect(),
            stream: Stream::of_write_model(),
            storage_mode: StorageMode::Events,
            collection: None,
        }
    }

    pub fn with_stream(mut self, stream: Stream) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Persist snapshots to `collection` in addition to events.
    pub fn with_snapshots(mut self, collection: impl Into<String>) -> Self {
        self.storage_mode = StorageMode::EventsAndState;
        self.collection = Some(collection.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }
}
