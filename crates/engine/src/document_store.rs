//! Document store boundary (snapshot + read-model storage).
//!
//! The engine uses the document model for two things: aggregate state
//! snapshots and projection read models. Both are disposable — events stay
//! the source of truth — so the abstraction is a thin schema-less key/value
//! surface with named collections and declared indices.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Index declared on a collection.
///
/// In-memory stores only record indices; real backends are expected to
/// create them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl Index {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn unique(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("collection '{0}' does not exist")]
    UnknownCollection(String),

    #[error("collection '{0}' already exists")]
    CollectionExists(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Schema-less document storage with named collections.
pub trait DocumentStore: Send + Sync {
    fn has_collection(&self, collection: &str) -> Result<bool, DocumentStoreError>;

    fn add_collection(&self, collection: &str, indices: &[Index]) -> Result<(), DocumentStoreError>;

    fn drop_collection(&self, collection: &str) -> Result<(), DocumentStoreError>;

    fn get_doc(&self, collection: &str, doc_id: &str)
        -> Result<Option<JsonValue>, DocumentStoreError>;

    fn upsert_doc(
        &self,
        collection: &str,
        doc_id: &str,
        doc: JsonValue,
    ) -> Result<(), DocumentStoreError>;

    /// Deleting an absent document is a no-op; the collection must exist.
    fn delete_doc(&self, collection: &str, doc_id: &str) -> Result<(), DocumentStoreError>;
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn has_collection(&self, collection: &str) -> Result<bool, DocumentStoreError> {
        (**self).has_collection(collection)
    }

    fn add_collection(&self, collection: &str, indices: &[Index]) -> Result<(), DocumentStoreError> {
        (**self).add_collection(collection, indices)
    }

    fn drop_collection(&self, collection: &str) -> Result<(), DocumentStoreError> {
        (**self).drop_collection(collection)
    }

    fn get_doc(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<JsonValue>, DocumentStoreError> {
        (**self).get_doc(collection, doc_id)
    }

    fn upsert_doc(
        &self,
        collection: &str,
        doc_id: &str,
        doc: JsonValue,
    ) -> Result<(), DocumentStoreError> {
        (**self).upsert_doc(collection, doc_id, doc)
    }

    fn delete_doc(&self, collection: &str, doc_id: &str) -> Result<(), DocumentStoreError> {
        (**self).delete_doc(collection, doc_id)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Collection {
    pub indices: Vec<Index>,
    pub docs: BTreeMap<String, JsonValue>,
}

pub(crate) type CollectionMap = HashMap<String, Collection>;

pub(crate) fn add_collection_in(
    map: &mut CollectionMap,
    collection: &str,
    indices: &[Index],
) -> Result<(), DocumentStoreError> {
    if map.contains_key(collection) {
        return Err(DocumentStoreError::CollectionExists(collection.to_string()));
    }
    map.insert(
        collection.to_string(),
        Collection {
            indices: indices.to_vec(),
            docs: BTreeMap::new(),
        },
    );
    Ok(())
}

pub(crate) fn drop_collection_in(
    map: &mut CollectionMap,
    collection: &str,
) -> Result<(), DocumentStoreError> {
    map.remove(collection)
        .map(|_| ())
        .ok_or_else(|| DocumentStoreError::UnknownCollection(collection.to_string()))
}

pub(crate) fn collection_in<'a>(
    map: &'a CollectionMap,
    collection: &str,
) -> Result<&'a Collection, DocumentStoreError> {
    map.get(collection)
        .ok_or_else(|| DocumentStoreError::UnknownCollection(collection.to_string()))
}

pub(crate) fn collection_in_mut<'a>(
    map: &'a mut CollectionMap,
    collection: &str,
) -> Result<&'a mut Collection, DocumentStoreError> {
    map.get_mut(collection)
        .ok_or_else(|| DocumentStoreError::UnknownCollection(collection.to_string()))
}

/// In-memory document store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<CollectionMap>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DocumentStoreError {
    DocumentStoreError::Storage("lock poisoned".to_string())
}

impl DocumentStore for InMemoryDocumentStore {
    fn has_collection(&self, collection: &str) -> Result<bool, DocumentStoreError> {
        let map = self.collections.read().map_err(|_| poisoned())?;
        Ok(map.contains_key(collection))
    }

    fn add_collection(&self, collection: &str, indices: &[Index]) -> Result<(), DocumentStoreError> {
        let mut map = self.collections.write().map_err(|_| poisoned())?;
        add_collection_in(&mut map, collection, indices)
    }

    fn drop_collection(&self, collection: &str) -> Result<(), DocumentStoreError> {
        let mut map = self.collections.write().map_err(|_| poisoned())?;
        drop_collection_in(&mut map, collection)
    }

    fn get_doc(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> Result<Option<JsonValue>, DocumentStoreError> {
        let map = self.collections.read().map_err(|_| poisoned())?;
        Ok(collection_in(&map, collection)?.docs.get(doc_id).cloned())
    }

    fn upsert_doc(
        &self,
        collection: &str,
        doc_id: &str,
        doc: JsonValue,
    ) -> Result<(), DocumentStoreError> {
        let mut map = self.collections.write().map_err(|_| poisoned())?;
        collection_in_mut(&mut map, collection)?
            .docs
            .insert(doc_id.to_string(), doc);
        Ok(())
    }

    fn delete_doc(&self, collection: &str, doc_id: &str) -> Result<(), DocumentStoreError> {
        let mut map = self.collections.write().map_err(|_| poisoned())?;
        collection_in_mut(&mut map, collection)?.docs.remove(doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn collection_lifecycle() {
        let store = InMemoryDocumentStore::new();
        assert!(!store.has_collection("users").unwrap());

        store
            .add_collection("users", &[Index::unique("users_id", vec!["id".to_string()])])
            .unwrap();
        assert!(store.has_collection("users").unwrap());
        assert!(matches!(
            store.add_collection("users", &[]),
            Err(DocumentStoreError::CollectionExists(_))
        ));

        store.drop_collection("users").unwrap();
        assert!(matches!(
            store.drop_collection("users"),
            Err(DocumentStoreError::UnknownCollection(_))
        ));
    }

    #[test]
    fn doc_roundtrip_and_delete() {
        let store = InMemoryDocumentStore::new();
        store.add_collection("users", &[]).unwrap();

        assert_eq!(store.get_doc("users", "U1").unwrap(), None);
        store.upsert_doc("users", "U1", json!({"name": "Alice"})).unwrap();
        assert_eq!(
            store.get_doc("users", "U1").unwrap(),
            Some(json!({"name": "Alice"}))
        );

        store.upsert_doc("users", "U1", json!({"name": "Bob"})).unwrap();
        assert_eq!(
            store.get_doc("users", "U1").unwrap(),
            Some(json!({"name": "Bob"}))
        );

        store.delete_doc("users", "U1").unwrap();
        assert_eq!(store.get_doc("users", "U1").unwrap(), None);
        // Deleting an absent doc stays a no-op.
        store.delete_doc("users", "U1").unwrap();
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let store = InMemoryDocumentStore::new();
        assert!(matches!(
            store.get_doc("nope", "U1"),
            Err(DocumentStoreError::UnknownCollection(_))
        ));
    }
}
