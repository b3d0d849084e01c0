//! Multi-model store: event log + document store under one transaction
//! boundary.
//!
//! A transaction covers exactly one aggregate save (event append + snapshot
//! write). Begin/commit/rollback are strictly paired and non-nested; opening
//! a second transaction while one is active is a fatal error.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use keelson_core::{AggregateId, MessageId, Stream};
use keelson_messaging::{meta, Message};

use crate::document_store::{
    add_collection_in, collection_in, collection_in_mut, drop_collection_in, CollectionMap,
    DocumentStore, DocumentStoreError, Index,
};
use crate::event_store::in_memory::{
    append_to_in, create_stream_in, delete_stream_in, load_aggregate_events_in, load_by_meta_id_in,
    stream_key, StreamMap,
};
use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("a transaction is already active")]
    AlreadyInTransaction,

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("transaction state poisoned")]
    Poisoned,
}

/// Transaction control surface of a multi-model store.
pub trait Connection {
    fn begin_transaction(&self) -> Result<(), TransactionError>;

    fn commit(&self) -> Result<(), TransactionError>;

    fn roll_back(&self) -> Result<(), TransactionError>;

    fn in_transaction(&self) -> bool;
}

/// A store exposing both an event log and a document store under one
/// transaction boundary.
pub trait MultiModelStore: EventStore + DocumentStore {
    fn connection(&self) -> &dyn Connection;
}

impl<S> MultiModelStore for Arc<S>
where
    S: MultiModelStore + ?Sized,
{
    fn connection(&self) -> &dyn Connection {
        (**self).connection()
    }
}

#[derive(Debug, Default, Clone)]
struct Models {
    streams: StreamMap,
    collections: CollectionMap,
}

#[derive(Debug, Default)]
struct MultiModelState {
    models: Models,
    /// Copy of `models` taken at `begin_transaction`, restored on rollback.
    backup: Option<Models>,
}

/// In-memory multi-model store for tests/dev.
///
/// Transactions snapshot both models at begin; rollback restores the
/// snapshot wholesale, giving strict all-or-nothing semantics across the
/// event append and the document write.
#[derive(Debug, Default)]
pub struct InMemoryMultiModelStore {
    state: Mutex<MultiModelState>,
}

impl InMemoryMultiModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T, E>(
        &self,
        poisoned: E,
        f: impl FnOnce(&mut MultiModelState) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.state.lock().map_err(|_| poisoned)?;
        f(&mut guard)
    }
}

fn es_poisoned() -> EventStoreError {
    EventStoreError::Storage("lock poisoned".to_string())
}

fn ds_poisoned() -> DocumentStoreError {
    DocumentStoreError::Storage("lock poisoned".to_string())
}

impl EventStore for InMemoryMultiModelStore {
    fn create_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        self.with_state(es_poisoned(), |s| create_stream_in(&mut s.models.streams, stream))
    }

    fn delete_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        self.with_state(es_poisoned(), |s| delete_stream_in(&mut s.models.streams, stream))
    }

    fn has_stream(&self, stream: &Stream) -> Result<bool, EventStoreError> {
        self.with_state(es_poisoned(), |s| {
            Ok(s.models.streams.contains_key(&stream_key(stream)))
        })
    }

    fn append_to(&self, stream: &Stream, events: Vec<Message>) -> Result<(), EventStoreError> {
        self.with_state(es_poisoned(), |s| append_to_in(&mut s.models.streams, stream, events))
    }

    fn load_aggregate_events(
        &self,
        stream: &Stream,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        min_version: u64,
    ) -> Result<Vec<Message>, EventStoreError> {
        self.with_state(es_poisoned(), |s| {
            load_aggregate_events_in(&s.models.streams, stream, aggregate_type, aggregate_id, min_version)
        })
    }

    fn load_events_by_correlation_id(
        &self,
        stream: &Stream,
        correlation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        self.with_state(es_poisoned(), |s| {
            load_by_meta_id_in(&s.models.streams, stream, meta::CORRELATION_ID, correlation_id)
        })
    }

    fn load_events_by_causation_id(
        &self,
        stream: &Stream,
        causation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        self.with_state(es_poisoned(), |s| {
            load_by_meta_id_in(&s.models.streams, stream, meta::CAUSATION_ID, causation_id)
        })
    }
}

impl DocumentStore for InMemoryMultiModelStore {
    fn has_collection(&self, collection: &str) -> Result<bool, DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            Ok(s.models.collections.contains_key(collection))
        })
    }

    fn add_collection(&self, collection: &str, indices: &[Index]) -> Result<(), DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            add_collection_in(&mut s.models.collections, collection, indices)
        })
    }

    fn drop_collection(&self, collection: &str) -> Result<(), DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            drop_collection_in(&mut s.models.collections, collection)
        })
    }

    fn get_doc(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<serde_json::Value>, DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            Ok(collection_in(&s.models.collections, collection)?
                .docs
                .get(doc_id)
                .cloned())
        })
    }

    fn upsert_doc(
        &self,
        collection: &str,
        doc_id: &str,
        doc: serde_json::Value,
    ) -> Result<(), DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            collection_in_mut(&mut s.models.collections, collection)?
                .docs
                .insert(doc_id.to_string(), doc);
            Ok(())
        })
    }

    fn delete_doc(&self, collection: &str, doc_id: &str) -> Result<(), DocumentStoreError> {
        self.with_state(ds_poisoned(), |s| {
            collection_in_mut(&mut s.models.collections, collection)?
                .docs
                .remove(doc_id);
            Ok(())
        })
    }
}

impl Connection for InMemoryMultiModelStore {
    fn begin_transaction(&self) -> Result<(), TransactionError> {
        self.with_state(TransactionError::Poisoned, |s| {
            if s.backup.is_some() {
                return Err(TransactionError::AlreadyInTransaction);
            }
            s.backup = Some(s.models.clone());
            Ok(())
        })
    }

    fn commit(&self) -> Result<(), TransactionError> {
        self.with_state(TransactionError::Poisoned, |s| {
            if s.backup.take().is_none() {
                return Err(TransactionError::NoActiveTransaction);
            }
            Ok(())
        })
    }

    fn roll_back(&self) -> Result<(), TransactionError> {
        self.with_state(TransactionError::Poisoned, |s| {
            match s.backup.take() {
                Some(models) => {
                    s.models = models;
                    Ok(())
                }
                None => Err(TransactionError::NoActiveTransaction),
            }
        })
    }

    fn in_transaction(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.backup.is_some())
            .unwrap_or(false)
    }
}

impl MultiModelStore for InMemoryMultiModelStore {
    fn connection(&self) -> &dyn Connection {
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stamped_event(aggregate_id: &str, version: u64) -> Message {
        Message::event("E", json!({}))
            .unwrap()
            .with_added_metadata(meta::AGGREGATE_TYPE, json!("User"))
            .with_added_metadata(meta::AGGREGATE_ID, json!(aggregate_id))
            .with_added_metadata(meta::AGGREGATE_VERSION, json!(version))
    }

    #[test]
    fn rollback_restores_both_models() {
        let store = InMemoryMultiModelStore::new();
        let stream = Stream::of_write_model();
        store.create_stream(&stream).unwrap();
        store.add_collection("users_state", &[]).unwrap();

        store.connection().begin_transaction().unwrap();
        store.append_to(&stream, vec![stamped_event("U1", 1)]).unwrap();
        store
            .upsert_doc("users_state", "U1", json!({"state": {}, "version": 1}))
            .unwrap();
        store.connection().roll_back().unwrap();

        let id = AggregateId::new("U1").unwrap();
        assert!(store.load_aggregate_events(&stream, "User", &id, 1).unwrap().is_empty());
        assert_eq!(store.get_doc("users_state", "U1").unwrap(), None);
        assert!(!store.connection().in_transaction());
    }

    #[test]
    fn commit_keeps_both_models() {
        let store = InMemoryMultiModelStore::new();
        let stream = Stream::of_write_model();
        store.create_stream(&stream).unwrap();
        store.add_collection("users_state", &[]).unwrap();

        store.connection().begin_transaction().unwrap();
        store.append_to(&stream, vec![stamped_event("U1", 1)]).unwrap();
        store
            .upsert_doc("users_state", "U1", json!({"state": {}, "version": 1}))
            .unwrap();
        store.connection().commit().unwrap();

        let id = AggregateId::new("U1").unwrap();
        assert_eq!(store.load_aggregate_events(&stream, "User", &id, 1).unwrap().len(), 1);
        assert!(store.get_doc("users_state", "U1").unwrap().is_some());
    }

    #[test]
    fn transactions_do_not_nest() {
        let store = InMemoryMultiModelStore::new();
        store.connection().begin_transaction().unwrap();
        assert_eq!(
            store.connection().begin_transaction(),
            Err(TransactionError::AlreadyInTransaction)
        );
        store.connection().roll_back().unwrap();

        assert_eq!(
            store.connection().commit(),
            Err(TransactionError::NoActiveTransaction)
        );
        assert_eq!(
            store.connection().roll_back(),
            Err(TransactionError::NoActiveTransaction)
        );
    }
}
