//! In-memory append-only event store.
//!
//! Intended for tests/dev. Not optimized for performance. The stream-map
//! helpers are shared with the in-memory multi-model store so both enforce
//! identical append semantics.

use std::collections::HashMap;
use std::sync::RwLock;

use keelson_core::{AggregateId, MessageId, Stream};
use keelson_messaging::{meta, Message};

use super::{EventStore, EventStoreError};

pub(crate) type StreamKey = (String, String);

pub(crate) type StreamMap = HashMap<StreamKey, Vec<Message>>;

pub(crate) fn stream_key(stream: &Stream) -> StreamKey {
    (
        stream.service_name().to_string(),
        stream.stream_name().to_string(),
    )
}

pub(crate) fn create_stream_in(map: &mut StreamMap, stream: &Stream) -> Result<(), EventStoreError> {
    let key = stream_key(stream);
    if map.contains_key(&key) {
        return Err(EventStoreError::StreamExists(stream.to_string()));
    }
    map.insert(key, Vec::new());
    Ok(())
}

pub(crate) fn delete_stream_in(map: &mut StreamMap, stream: &Stream) -> Result<(), EventStoreError> {
    map.remove(&stream_key(stream))
        .map(|_| ())
        .ok_or_else(|| EventStoreError::StreamNotFound(stream.to_string()))
}

fn aggregate_key(event: &Message) -> Result<(String, AggregateId, u64), EventStoreError> {
    let missing = |key: &str| {
        EventStoreError::InvalidAppend(format!(
            "event '{}' is missing metadata key '{key}'",
            event.name()
        ))
    };
    let aggregate_type = event
        .aggregate_type()
        .ok_or_else(|| missing(meta::AGGREGATE_TYPE))?
        .to_string();
    let aggregate_id = event.aggregate_id().ok_or_else(|| missing(meta::AGGREGATE_ID))?;
    let version = event
        .aggregate_version()
        .ok_or_else(|| missing(meta::AGGREGATE_VERSION))?;
    Ok((aggregate_type, aggregate_id, version))
}

pub(crate) fn append_to_in(
    map: &mut StreamMap,
    stream: &Stream,
    events: Vec<Message>,
) -> Result<(), EventStoreError> {
    let stored = map
        .get_mut(&stream_key(stream))
        .ok_or_else(|| EventStoreError::StreamNotFound(stream.to_string()))?;

    // Enforce the (type, id, version) uniqueness constraint against stored
    // events and within the batch itself.
    let mut taken: Vec<(String, AggregateId, u64)> = stored
        .iter()
        .map(aggregate_key)
        .collect::<Result<_, _>>()?;

    for event in &events {
        let slot = aggregate_key(event)?;
        if taken.contains(&slot) {
            return Err(EventStoreError::Concurrency(format!(
                "version {} of aggregate '{}' with id '{}' is already taken",
                slot.2, slot.0, slot.1
            )));
        }
        taken.push(slot);
    }

    stored.extend(events);
    Ok(())
}

pub(crate) fn load_aggregate_events_in(
    map: &StreamMap,
    stream: &Stream,
    aggregate_type: &str,
    aggregate_id: &AggregateId,
    min_version: u64,
) -> Result<Vec<Message>, EventStoreError> {
    let events = map
        .get(&stream_key(stream))
        .ok_or_else(|| EventStoreError::StreamNotFound(stream.to_string()))?;

    let mut matching: Vec<Message> = events
        .iter()
        .filter(|e| {
            e.aggregate_type() == Some(aggregate_type)
                && e.aggregate_id().as_ref() == Some(aggregate_id)
                && e.aggregate_version().is_some_and(|v| v >= min_version)
        })
        .cloned()
        .collect();
    matching.sort_by_key(|e| e.aggregate_version().unwrap_or(0));
    Ok(matching)
}

pub(crate) fn load_by_meta_id_in(
    map: &StreamMap,
    stream: &Stream,
    meta_key: &str,
    id: MessageId,
) -> Result<Vec<Message>, EventStoreError> {
    let events = map
        .get(&stream_key(stream))
        .ok_or_else(|| EventStoreError::StreamNotFound(stream.to_string()))?;
    let id = id.to_string();

    Ok(events
        .iter()
        .filter(|e| {
            e.get_meta(meta_key)
                .and_then(serde_json::Value::as_str)
                .is_some_and(|v| v == id)
        })
        .cloned()
        .collect())
}

/// In-memory append-only event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<StreamMap>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("lock poisoned".to_string())
}

impl EventStore for InMemoryEventStore {
    fn create_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        let mut map = self.streams.write().map_err(|_| poisoned())?;
        create_stream_in(&mut map, stream)
    }

    fn delete_stream(&self, stream: &Stream) -> Result<(), EventStoreError> {
        let mut map = self.streams.write().map_err(|_| poisoned())?;
        delete_stream_in(&mut map, stream)
    }

    fn has_stream(&self, stream: &Stream) -> Result<bool, EventStoreError> {
        let map = self.streams.read().map_err(|_| poisoned())?;
        Ok(map.contains_key(&stream_key(stream)))
    }

    fn append_to(&self, stream: &Stream, events: Vec<Message>) -> Result<(), EventStoreError> {
        let mut map = self.streams.write().map_err(|_| poisoned())?;
        append_to_in(&mut map, stream, events)
    }

    fn load_aggregate_events(
        &self,
        stream: &Stream,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        min_version: u64,
    ) -> Result<Vec<Message>, EventStoreError> {
        let map = self.streams.read().map_err(|_| poisoned())?;
        load_aggregate_events_in(&map, stream, aggregate_type, aggregate_id, min_version)
    }

    fn load_events_by_correlation_id(
        &self,
        stream: &Stream,
        correlation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        let map = self.streams.read().map_err(|_| poisoned())?;
        load_by_meta_id_in(&map, stream, meta::CORRELATION_ID, correlation_id)
    }

    fn load_events_by_causation_id(
        &self,
        stream: &Stream,
        causation_id: MessageId,
    ) -> Result<Vec<Message>, EventStoreError> {
        let map = self.streams.read().map_err(|_| poisoned())?;
        load_by_meta_id_in(&map, stream, meta::CAUSATION_ID, causation_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stamped_event(name: &str, aggregate_id: &str, version: u64) -> Message {
        Message::event(name, json!({}))
            .unwrap()
            .with_added_metadata(meta::AGGREGATE_TYPE, json!("User"))
            .with_added_metadata(meta::AGGREGATE_ID, json!(aggregate_id))
            .with_added_metadata(meta::AGGREGATE_VERSION, json!(version))
    }

    fn store_with_stream() -> (InMemoryEventStore, Stream) {
        let store = InMemoryEventStore::new();
        let stream = Stream::of_write_model();
        store.create_stream(&stream).unwrap();
        (store, stream)
    }

    #[test]
    fn create_is_not_idempotent() {
        let (store, stream) = store_with_stream();
        assert!(matches!(
            store.create_stream(&stream),
            Err(EventStoreError::StreamExists(_))
        ));
        store.delete_stream(&stream).unwrap();
        assert!(!store.has_stream(&stream).unwrap());
    }

    #[test]
    fn append_requires_aggregate_metadata() {
        let (store, stream) = store_with_stream();
        let bare = Message::event("E", json!({})).unwrap();
        assert!(matches!(
            store.append_to(&stream, vec![bare]),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[test]
    fn append_rejects_taken_version_slot() {
        let (store, stream) = store_with_stream();
        store
            .append_to(&stream, vec![stamped_event("E", "A1", 1)])
            .unwrap();

        assert!(matches!(
            store.append_to(&stream, vec![stamped_event("E", "A1", 1)]),
            Err(EventStoreError::Concurrency(_))
        ));
        // Other aggregates are unaffected.
        store
            .append_to(&stream, vec![stamped_event("E", "A2", 1)])
            .unwrap();
    }

    #[test]
    fn loads_version_ordered_from_min_version() {
        let (store, stream) = store_with_stream();
        // Insert out of order; loads must sort by version.
        store
            .append_to(
                &stream,
                vec![
                    stamped_event("E", "A1", 2),
                    stamped_event("E", "A1", 1),
                    stamped_event("E", "A1", 3),
                ],
            )
            .unwrap();

        let id = AggregateId::new("A1").unwrap();
        let all = store.load_aggregate_events(&stream, "User", &id, 1).unwrap();
        assert_eq!(
            all.iter().map(|e| e.aggregate_version().unwrap()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let tail = store.load_aggregate_events(&stream, "User", &id, 3).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].aggregate_version(), Some(3));
    }

    #[test]
    fn loads_by_correlation_and_causation() {
        let (store, stream) = store_with_stream();
        let cause = MessageId::new();
        let correlation = MessageId::new();

        let event = stamped_event("E", "A1", 1)
            .with_added_metadata(meta::CAUSATION_ID, json!(cause.to_string()))
            .with_added_metadata(meta::CORRELATION_ID, json!(correlation.to_string()));
        store.append_to(&stream, vec![event]).unwrap();

        assert_eq!(
            store.load_events_by_causation_id(&stream, cause).unwrap().len(),
            1
        );
        assert_eq!(
            store
                .load_events_by_correlation_id(&stream, correlation)
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .load_events_by_causation_id(&stream, MessageId::new())
            .unwrap()
            .is_empty());
    }
}
