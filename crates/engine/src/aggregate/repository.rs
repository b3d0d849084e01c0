//! The aggregate repository.
//!
//! Owns the translation between [`AggregateRoot`] and the two backing
//! stores: reads reconstruct a root from snapshot + catch-up replay or pure
//! event replay, writes persist recorded events plus an optional snapshot
//! atomically.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, instrument};

use keelson_core::{AggregateId, StorageMode, Stream};
use keelson_messaging::Message;

use crate::document_store::DocumentStoreError;
use crate::event_store::{EventStore, EventStoreError};
use crate::flavour::{Flavour, FlavourError};
use crate::multi_model::{MultiModelStore, TransactionError};
use crate::store::EngineStore;

use super::root::{AggregateError, AggregateRoot};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Events(#[from] EventStoreError),

    #[error(transparent)]
    Documents(#[from] DocumentStoreError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Flavour(#[from] FlavourError),

    /// The storage mode requires state persistence but no document store /
    /// collection is configured. Surfaced at the first save instead of
    /// silently dropping writes.
    #[error("storage mode requires a document store but none is configured for aggregate type '{0}'")]
    MisconfiguredStorage(String),

    #[error("aggregate '{aggregate_type}' with id '{aggregate_id}' has a malformed snapshot: {detail}")]
    CorruptSnapshot {
        aggregate_type: String,
        aggregate_id: String,
        detail: String,
    },

    #[error("aggregate '{0}' has no state to snapshot")]
    MissingState(String),
}

/// Snapshot documents with this flag set delete the snapshot instead of
/// upserting it.
fn state_reports_deleted(state: &JsonValue) -> bool {
    state
        .get("deleted")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

/// Loads and saves aggregate roots for one aggregate type.
///
/// Borrowed from the engine per dispatch; holds no state of its own.
#[derive(Debug)]
pub struct Repository<'e> {
    store: &'e EngineStore,
    stream: &'e Stream,
    aggregate_type: &'e str,
    event_names: &'e BTreeSet<String>,
    storage_mode: StorageMode,
    collection: Option<&'e str>,
}

impl<'e> Repository<'e> {
    pub fn new(
        store: &'e EngineStore,
        stream: &'e Stream,
        aggregate_type: &'e str,
        event_names: &'e BTreeSet<String>,
        storage_mode: StorageMode,
        collection: Option<&'e str>,
    ) -> Self {
        Self {
            store,
            stream,
            aggregate_type,
            event_names,
            storage_mode,
            collection,
        }
    }

    /// Load an aggregate root, or `None` when no trace of it exists.
    ///
    /// Prefers a snapshot lookup (when the configuration and the flavour
    /// allow it), replaying events past the snapshot only when
    /// `expected_version` exceeds it. Falls back to a full replay from
    /// version 1. Never returns a partially-initialized root.
    #[instrument(skip(self, flavour), fields(aggregate_type = self.aggregate_type, aggregate_id = %aggregate_id))]
    pub fn get_aggregate_root<F: Flavour>(
        &self,
        flavour: &F,
        aggregate_id: &AggregateId,
        expected_version: Option<u64>,
    ) -> Result<Option<AggregateRoot>, RepositoryError> {
        if self.storage_mode.stores_state() && flavour.can_build_aggregate_state(self.aggregate_type)
        {
            if let (Some(documents), Some(collection)) = (self.store.documents(), self.collection) {
                if let Some(doc) = documents.get_doc(collection, aggregate_id.as_str())? {
                    debug!("reconstructing from snapshot");
                    return self
                        .from_snapshot(flavour, aggregate_id, doc, expected_version)
                        .map(Some);
                }
            }
        }

        let history =
            self.store
                .load_aggregate_events(self.stream, self.aggregate_type, aggregate_id, 1)?;
        if history.is_empty() {
            return Ok(None);
        }

        let mut root = AggregateRoot::new(
            aggregate_id.clone(),
            self.aggregate_type,
            self.event_names.clone(),
        );
        root.replay(flavour, history)?;
        Ok(Some(root))
    }

    fn from_snapshot<F: Flavour>(
        &self,
        flavour: &F,
        aggregate_id: &AggregateId,
        doc: JsonValue,
        expected_version: Option<u64>,
    ) -> Result<AggregateRoot, RepositoryError> {
        let corrupt = |detail: &str| RepositoryError::CorruptSnapshot {
            aggregate_type: self.aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            detail: detail.to_string(),
        };
        let version = doc
            .get("version")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| corrupt("missing numeric 'version'"))?;
        let raw_state = doc
            .get("state")
            .cloned()
            .ok_or_else(|| corrupt("missing 'state'"))?;

        let state = flavour.build_aggregate_state(self.aggregate_type, raw_state)?;
        let mut root = AggregateRoot::reconstitute(
            aggregate_id.clone(),
            self.aggregate_type,
            self.event_names.clone(),
            version,
            state,
        );

        if let Some(expected) = expected_version {
            if expected > version && self.storage_mode.stores_events() {
                let catch_up = self.store.load_aggregate_events(
                    self.stream,
                    self.aggregate_type,
                    aggregate_id,
                    version + 1,
                )?;
                root.replay(flavour, catch_up)?;
            }
        }

        Ok(root)
    }

    /// Persist the root's buffered events, plus a snapshot when the storage
    /// mode asks for one.
    ///
    /// With a multi-model store and a configured collection, event append
    /// and snapshot write happen inside one transaction: any failure rolls
    /// back both and the error is re-raised unchanged. Zero buffered events
    /// return immediately without touching the store.
    #[instrument(skip(self, flavour, root), fields(aggregate_type = self.aggregate_type, aggregate_id = %root.aggregate_id()))]
    pub fn save_aggregate_root<F: Flavour>(
        &self,
        flavour: &F,
        root: &mut AggregateRoot,
    ) -> Result<Vec<Message>, RepositoryError> {
        let events = root.pop_recorded_events();
        if events.is_empty() {
            return Ok(events);
        }
        debug!(count = events.len(), "persisting recorded events");

        match (self.store.documents(), self.collection) {
            (Some(documents), Some(collection)) => {
                let connection = documents.connection();
                connection.begin_transaction()?;
                match self.save_within_transaction(flavour, documents, collection, root, &events) {
                    Ok(()) => {
                        connection.commit()?;
                        Ok(events)
                    }
                    Err(err) => {
                        connection.roll_back()?;
                        Err(err)
                    }
                }
            }
            _ => {
                if !self.storage_mode.stores_events() {
                    return Err(RepositoryError::MisconfiguredStorage(
                        self.aggregate_type.to_string(),
                    ));
                }
                self.store.append_to(self.stream, events.clone())?;
                Ok(events)
            }
        }
    }

    fn save_within_transaction<F: Flavour>(
        &self,
        flavour: &F,
        documents: &std::sync::Arc<dyn MultiModelStore>,
        collection: &str,
        root: &AggregateRoot,
        events: &[Message],
    ) -> Result<(), RepositoryError> {
        if self.storage_mode.stores_events() {
            documents.append_to(self.stream, events.to_vec())?;
        }

        if self.storage_mode.stores_state() {
            let state = root
                .state()
                .ok_or_else(|| RepositoryError::MissingState(self.aggregate_type.to_string()))?;

            if state_reports_deleted(state) {
                documents.delete_doc(collection, root.aggregate_id().as_str())?;
            } else {
                let mut doc = Map::new();
                doc.insert(
                    "state".to_string(),
                    flavour.convert_aggregate_state_to_value(self.aggregate_type, state)?,
                );
                doc.insert("version".to_string(), json!(root.version()));
                if flavour.can_provide_aggregate_metadata(self.aggregate_type) {
                    doc.insert(
                        "metadata".to_string(),
                        JsonValue::Object(flavour.provide_aggregate_metadata(
                            self.aggregate_type,
                            root.version(),
                            state,
                        )?),
                    );
                }
                documents.upsert_doc(
                    collection,
                    root.aggregate_id().as_str(),
                    JsonValue::Object(doc),
                )?;
            }
        }

        Ok(())
    }
}
