//! Read-model projections.
//!
//! A projection matches committed events against its configured filters and
//! hands them to an idempotent projector writing into a versioned document
//! collection. Storage names are namespaced `<name>_<version>` so two
//! projection versions can coexist during a rolling deploy; the old version
//! is torn down only by an explicit delete, never automatically.

use std::collections::BTreeSet;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use keelson_core::{MessageId, Stream};
use keelson_messaging::Message;

use crate::document_store::{DocumentStore, DocumentStoreError, Index};
use crate::flavour::{Flavour, FlavourError};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Projector failure, wrapped with enough context to operate on without
    /// hiding the root cause.
    #[error("projection '{projection}' (projector '{projector}') failed handling event '{event_name}' ({event_id}): {source}")]
    Projector {
        projection: String,
        projector: String,
        event_name: String,
        event_id: MessageId,
        #[source]
        source: FlavourError,
    },

    #[error(transparent)]
    Documents(#[from] DocumentStoreError),
}

/// Registration-time description of a projection.
#[derive(Debug, Clone)]
pub struct ProjectionDescription {
    pub name: String,
    /// Namespaces the storage (`<name>_<version>`) to allow blue/green
    /// redeploys.
    pub version: String,
    pub source_streams: Vec<Stream>,
    pub aggregate_type_filter: Option<String>,
    /// Allow-list of event names; `None` accepts every name.
    pub event_name_filter: Option<BTreeSet<String>>,
    pub projector_id: String,
    pub indices: Vec<Index>,
    /// Free-form options handed to the projector implementation.
    pub options: Map<String, JsonValue>,
}

impl ProjectionDescription {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        projector_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            source_streams: vec![Stream::of_write_model()],
            aggregate_type_filter: None,
            event_name_filter: None,
            projector_id: projector_id.into(),
            indices: Vec::new(),
            options: Map::new(),
        }
    }

    /// Replace the source streams (the default is the write-model stream).
    pub fn with_source_streams(mut self, streams: Vec<Stream>) -> Self {
        self.source_streams = streams;
        self
    }

    pub fn with_aggregate_type_filter(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type_filter = Some(aggregate_type.into());
        self
    }

    pub fn with_event_names(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.event_name_filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indices.push(index);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// A compiled projection.
#[derive(Debug, Clone)]
pub struct Projection {
    desc: ProjectionDescription,
}

impl Projection {
    pub fn new(desc: ProjectionDescription) -> Self {
        Self { desc }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn projector_id(&self) -> &str {
        &self.desc.projector_id
    }

    /// Versioned storage name, `<name>_<version>` with dots flattened.
    pub fn storage_name(&self) -> String {
        format!("{}_{}", self.desc.name, self.desc.version.replace('.', "_"))
    }

    /// Whether this projection wants `event` from `source_stream`.
    ///
    /// Streams match exactly (no prefixing); the aggregate-type filter and
    /// the event-name allow-list must both pass when configured.
    pub fn is_interested_in(&self, source_stream: &Stream, event: &Message) -> bool {
        if !self.desc.source_streams.iter().any(|s| s == source_stream) {
            return false;
        }
        if let Some(wanted) = &self.desc.aggregate_type_filter {
            if event.aggregate_type() != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(allowed) = &self.desc.event_name_filter {
            if !allowed.contains(event.name()) {
                return false;
            }
        }
        true
    }

    /// Idempotently ensure the versioned storage exists, creating the
    /// configured indices.
    pub fn prepare_for_run<D>(&self, store: &D) -> Result<(), ProjectionError>
    where
        D: DocumentStore + ?Sized,
    {
        let storage = self.storage_name();
        if !store.has_collection(&storage)? {
            debug!(projection = self.desc.name, collection = storage, "creating projection storage");
            store.add_collection(&storage, &self.desc.indices)?;
        }
        Ok(())
    }

    /// Hand one event to the projector.
    ///
    /// Projectors re-derive read-model documents from current authoritative
    /// state, so handling the same event twice is idempotent. Failures are
    /// wrapped with projection, projector and event context.
    pub fn handle<F: Flavour>(&self, flavour: &F, event: &Message) -> Result<(), ProjectionError> {
        flavour
            .call_projector(&self.desc.projector_id, &self.storage_name(), event)
            .map_err(|source| ProjectionError::Projector {
                projection: self.desc.name.clone(),
                projector: self.desc.projector_id.clone(),
                event_name: event.name().to_string(),
                event_id: event.id(),
                source,
            })
    }

    /// Drop the versioned storage. Used during blue/green cutover once the
    /// old projection version is retired.
    pub fn delete<D>(&self, store: &D) -> Result<(), ProjectionError>
    where
        D: DocumentStore + ?Sized,
    {
        store.drop_collection(&self.storage_name())?;
        Ok(())
    }
}
