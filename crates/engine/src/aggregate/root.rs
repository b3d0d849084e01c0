//! The aggregate state machine.

use std::collections::BTreeSet;

use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use keelson_core::AggregateId;
use keelson_messaging::{meta, Message};

use crate::flavour::{Flavour, FlavourError};

#[derive(Debug, Error)]
pub enum AggregateError {
    /// The event name is not a key of the aggregate's apply map.
    #[error("aggregate type '{aggregate_type}' cannot record unknown event '{event}'")]
    UnknownEvent {
        aggregate_type: String,
        event: String,
    },

    /// An apply function returned no state. Fatal — never silently
    /// tolerated, a missing result would corrupt the aggregate.
    #[error("applying '{event}' to aggregate type '{aggregate_type}' yielded no state")]
    NullApplyResult {
        aggregate_type: String,
        event: String,
    },

    #[error("event '{event}' is missing aggregate metadata key '{key}'")]
    MissingEventMetadata { event: String, key: &'static str },

    /// The stored history skipped a version. The store contract promises
    /// gap-free streams; a hole means the store is broken.
    #[error("version gap while replaying '{aggregate_type}': expected {expected}, found {found}")]
    VersionGap {
        aggregate_type: String,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Flavour(#[from] FlavourError),
}

/// In-memory state machine of one aggregate instance.
///
/// Holds identity, version, current state and the buffer of events recorded
/// but not yet persisted. All storage interaction goes through the
/// repository; the root itself never touches a store.
#[derive(Debug)]
pub struct AggregateRoot {
    aggregate_id: AggregateId,
    aggregate_type: String,
    version: u64,
    state: Option<JsonValue>,
    recorded_events: Vec<Message>,
    event_names: BTreeSet<String>,
}

impl AggregateRoot {
    /// A brand-new aggregate: version 0, no state.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_names: BTreeSet<String>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version: 0,
            state: None,
            recorded_events: Vec::new(),
            event_names,
        }
    }

    /// Rebuild a root from a snapshot (version + state), ready for catch-up
    /// replay.
    pub fn reconstitute(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_names: BTreeSet<String>,
        version: u64,
        state: JsonValue,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            state: Some(state),
            recorded_events: Vec::new(),
            event_names,
        }
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> Option<&JsonValue> {
        self.state.as_ref()
    }

    /// Record a produced event: increment the version, stamp aggregate and
    /// causation metadata, buffer the event and immediately apply it.
    ///
    /// `cause` is the message that produced the event; its id becomes the
    /// event's causation id, and its correlation id (or, absent one, its own
    /// id) is forwarded as the event's correlation id.
    pub fn record_that<F: Flavour>(
        &mut self,
        flavour: &F,
        cause: &Message,
        event: Message,
    ) -> Result<(), AggregateError> {
        if !self.event_names.contains(event.name()) {
            return Err(AggregateError::UnknownEvent {
                aggregate_type: self.aggregate_type.clone(),
                event: event.name().to_string(),
            });
        }

        self.version += 1;
        let correlation_id = cause.correlation_id().unwrap_or_else(|| cause.id());
        let event = event
            .with_added_metadata(meta::AGGREGATE_ID, json!(self.aggregate_id.as_str()))
            .with_added_metadata(meta::AGGREGATE_TYPE, json!(self.aggregate_type))
            .with_added_metadata(meta::AGGREGATE_VERSION, json!(self.version))
            .with_added_metadata(meta::CAUSATION_ID, json!(cause.id().to_string()))
            .with_added_metadata(meta::CAUSATION_NAME, json!(cause.name()))
            .with_added_metadata(meta::CORRELATION_ID, json!(correlation_id.to_string()));

        self.recorded_events.push(event.clone());
        self.apply(flavour, &event)
    }

    /// Replay a strictly version-ordered history on top of the current
    /// version (0 for a full replay, the snapshot version for catch-up).
    pub fn replay<F: Flavour>(
        &mut self,
        flavour: &F,
        events: impl IntoIterator<Item = Message>,
    ) -> Result<(), AggregateError> {
        for event in events {
            let found = event.aggregate_version().ok_or_else(|| {
                AggregateError::MissingEventMetadata {
                    event: event.name().to_string(),
                    key: meta::AGGREGATE_VERSION,
                }
            })?;
            let expected = self.version + 1;
            if found != expected {
                return Err(AggregateError::VersionGap {
                    aggregate_type: self.aggregate_type.clone(),
                    expected,
                    found,
                });
            }
            // Resync to the stored version rather than blindly incrementing.
            self.version = found;
            self.apply(flavour, &event)?;
        }
        Ok(())
    }

    /// Drain the buffer of recorded-but-unpersisted events.
    ///
    /// Idempotent: a second call with nothing recorded in between returns
    /// an empty vector.
    pub fn pop_recorded_events(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.recorded_events)
    }

    fn apply<F: Flavour>(&mut self, flavour: &F, event: &Message) -> Result<(), AggregateError> {
        let new_state = match &self.state {
            None => flavour.call_apply_first_event(&self.aggregate_type, event)?,
            Some(state) => flavour.call_apply_subsequent_event(&self.aggregate_type, state, event)?,
        };
        if new_state.is_null() {
            return Err(AggregateError::NullApplyResult {
                aggregate_type: self.aggregate_type.clone(),
                event: event.name().to_string(),
            });
        }
        self.state = Some(new_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::flavour::FunctionalFlavour;

    fn user_flavour() -> FunctionalFlavour {
        let mut flavour = FunctionalFlavour::new();
        flavour.register_apply_function("User", "UserRegistered", |_state, event| {
            json!({"id": event.get("id"), "name": event.get("name")})
        });
        flavour.register_apply_function("User", "NameChanged", |state, event| {
            let mut state = state.cloned().unwrap_or(json!({}));
            state["name"] = event.get("name").cloned().unwrap_or(JsonValue::Null);
            state
        });
        flavour.register_apply_function("User", "BrokenApply", |_state, _event| JsonValue::Null);
        flavour
    }

    fn event_names() -> BTreeSet<String> {
        ["UserRegistered", "NameChanged", "BrokenApply"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn root() -> AggregateRoot {
        AggregateRoot::new(AggregateId::new("U1").unwrap(), "User", event_names())
    }

    #[test]
    fn record_that_stamps_metadata_and_applies() {
        let flavour = user_flavour();
        let mut root = root();
        let command = Message::command("RegisterUser", json!({"id": "U1"})).unwrap();
        let event = Message::event("UserRegistered", json!({"id": "U1", "name": "Alice"})).unwrap();

        root.record_that(&flavour, &command, event).unwrap();

        assert_eq!(root.version(), 1);
        assert_eq!(root.state().unwrap()["name"], json!("Alice"));

        let recorded = root.pop_recorded_events();
        assert_eq!(recorded.len(), 1);
        let e = &recorded[0];
        assert_eq!(e.aggregate_id().unwrap().as_str(), "U1");
        assert_eq!(e.aggregate_type(), Some("User"));
        assert_eq!(e.aggregate_version(), Some(1));
        assert_eq!(e.causation_id(), Some(command.id()));
        assert_eq!(e.causation_name(), Some("RegisterUser"));
        assert_eq!(e.correlation_id(), Some(command.id()));
    }

    #[test]
    fn existing_correlation_id_is_forwarded() {
        let flavour = user_flavour();
        let mut root = root();
        let upstream = keelson_core::MessageId::new();
        let command = Message::command("RegisterUser", json!({"id": "U1"}))
            .unwrap()
            .with_added_metadata(meta::CORRELATION_ID, json!(upstream.to_string()));
        let event = Message::event("UserRegistered", json!({"id": "U1", "name": "A"})).unwrap();

        root.record_that(&flavour, &command, event).unwrap();
        assert_eq!(root.pop_recorded_events()[0].correlation_id(), Some(upstream));
    }

    #[test]
    fn unknown_event_names_are_rejected() {
        let flavour = user_flavour();
        let mut root = root();
        let command = Message::command("C", json!({})).unwrap();
        let event = Message::event("SomethingElse", json!({})).unwrap();

        let err = root.record_that(&flavour, &command, event).unwrap_err();
        assert!(matches!(err, AggregateError::UnknownEvent { .. }));
        assert_eq!(root.version(), 0);
        assert!(root.pop_recorded_events().is_empty());
    }

    #[test]
    fn null_apply_result_is_fatal() {
        let flavour = user_flavour();
        let mut root = root();
        let command = Message::command("C", json!({})).unwrap();
        let event = Message::event("BrokenApply", json!({})).unwrap();

        let err = root.record_that(&flavour, &command, event).unwrap_err();
        assert!(matches!(err, AggregateError::NullApplyResult { .. }));
    }

    #[test]
    fn pop_recorded_events_drains_exactly_once() {
        let flavour = user_flavour();
        let mut root = root();
        let command = Message::command("C", json!({})).unwrap();
        root.record_that(
            &flavour,
            &command,
            Message::event("UserRegistered", json!({"id": "U1", "name": "A"})).unwrap(),
        )
        .unwrap();

        assert_eq!(root.pop_recorded_events().len(), 1);
        assert!(root.pop_recorded_events().is_empty());
    }

    fn stamped(name: &str, payload: JsonValue, version: u64) -> Message {
        Message::event(name, payload)
            .unwrap()
            .with_added_metadata(meta::AGGREGATE_ID, json!("U1"))
            .with_added_metadata(meta::AGGREGATE_TYPE, json!("User"))
            .with_added_metadata(meta::AGGREGATE_VERSION, json!(version))
    }

    #[test]
    fn replay_resyncs_version_from_history() {
        let flavour = user_flavour();
        let mut root = root();
        root.replay(
            &flavour,
            vec![
                stamped("UserRegistered", json!({"id": "U1", "name": "Alice"}), 1),
                stamped("NameChanged", json!({"name": "Bob"}), 2),
            ],
        )
        .unwrap();

        assert_eq!(root.version(), 2);
        assert_eq!(root.state().unwrap()["name"], json!("Bob"));
        // Replayed events are history, not newly recorded ones.
        assert!(root.pop_recorded_events().is_empty());
    }

    #[test]
    fn replay_supports_catch_up_from_a_snapshot() {
        let flavour = user_flavour();
        let mut root = AggregateRoot::reconstitute(
            AggregateId::new("U1").unwrap(),
            "User",
            event_names(),
            2,
            json!({"id": "U1", "name": "Bob"}),
        );
        root.replay(&flavour, vec![stamped("NameChanged", json!({"name": "Carol"}), 3)])
            .unwrap();

        assert_eq!(root.version(), 3);
        assert_eq!(root.state().unwrap()["name"], json!("Carol"));
    }

    #[test]
    fn replay_rejects_version_gaps() {
        let flavour = user_flavour();
        let mut root = root();
        let err = root
            .replay(
                &flavour,
                vec![
                    stamped("UserRegistered", json!({"id": "U1", "name": "A"}), 1),
                    stamped("NameChanged", json!({"name": "B"}), 3),
                ],
            )
            .unwrap_err();

        assert!(matches!(
            err,
            AggregateError::VersionGap { expected: 2, found: 3, .. }
        ));
    }
}
