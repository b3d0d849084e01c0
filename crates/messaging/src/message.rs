//! The message envelope.
//!
//! A [`Message`] is the unit everything in the engine moves around: commands,
//! events and queries all share the same immutable envelope. "Mutation" is
//! expressed through `with_*` operations that return a new copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use keelson_core::{AggregateId, MessageId};

/// Well-known metadata keys stamped onto recorded events.
pub mod meta {
    /// Identifier of the aggregate the event belongs to.
    pub const AGGREGATE_ID: &str = "_aggregate_id";
    /// Type of the aggregate the event belongs to.
    pub const AGGREGATE_TYPE: &str = "_aggregate_type";
    /// Version of the aggregate after applying the event.
    pub const AGGREGATE_VERSION: &str = "_aggregate_version";
    /// Id of the message that caused the event.
    pub const CAUSATION_ID: &str = "_causation_id";
    /// Name of the message that caused the event.
    pub const CAUSATION_NAME: &str = "_causation_name";
    /// Correlation id shared by every message of one business transaction.
    pub const CORRELATION_ID: &str = "_correlation_id";
}

/// Kind of a message. Drives routing in the dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Event,
    Query,
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MessageType::Command => f.write_str("command"),
            MessageType::Event => f.write_str("event"),
            MessageType::Query => f.write_str("query"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Message names are restricted to `[A-Za-z0-9_.\-/]+`.
    #[error("invalid message name '{0}'")]
    InvalidName(String),

    /// Payloads are ordered maps of scalars, nested maps and lists.
    #[error("payload of message '{0}' must be a JSON object")]
    PayloadNotObject(String),
}

fn is_valid_message_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'/'))
}

/// Immutable envelope for commands, events and queries.
///
/// Payload and metadata values are JSON values (null, scalar, list or
/// string-keyed map) — never opaque objects. Once constructed a message never
/// changes; `with_*` operations return a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    name: String,
    message_type: MessageType,
    payload: JsonValue,
    metadata: Map<String, JsonValue>,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        name: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, MessageError> {
        let name = name.into();
        if !is_valid_message_name(&name) {
            return Err(MessageError::InvalidName(name));
        }
        if !payload.is_object() {
            return Err(MessageError::PayloadNotObject(name));
        }
        Ok(Self {
            id: MessageId::new(),
            name,
            message_type,
            payload,
            metadata: Map::new(),
            created_at: Utc::now(),
        })
    }

    pub fn command(name: impl Into<String>, payload: JsonValue) -> Result<Self, MessageError> {
        Self::new(MessageType::Command, name, payload)
    }

    pub fn event(name: impl Into<String>, payload: JsonValue) -> Result<Self, MessageError> {
        Self::new(MessageType::Event, name, payload)
    }

    pub fn query(name: impl Into<String>, payload: JsonValue) -> Result<Self, MessageError> {
        Self::new(MessageType::Query, name, payload)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &Map<String, JsonValue> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Read a single payload key (payloads are always objects).
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.payload.get(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&JsonValue> {
        self.metadata.get(key)
    }

    /// Copy of this message with a replaced payload.
    pub fn with_payload(&self, payload: JsonValue) -> Result<Self, MessageError> {
        if !payload.is_object() {
            return Err(MessageError::PayloadNotObject(self.name.clone()));
        }
        let mut copy = self.clone();
        copy.payload = payload;
        Ok(copy)
    }

    /// Copy of this message with replaced metadata.
    pub fn with_metadata(&self, metadata: Map<String, JsonValue>) -> Self {
        let mut copy = self.clone();
        copy.metadata = metadata;
        copy
    }

    /// Copy of this message with one metadata key added (or replaced).
    pub fn with_added_metadata(&self, key: impl Into<String>, value: JsonValue) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(key.into(), value);
        copy
    }

    // Typed accessors for the aggregate metadata stamped by `record_that`.

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.get_meta(meta::AGGREGATE_ID)
            .and_then(JsonValue::as_str)
            .and_then(|s| AggregateId::new(s).ok())
    }

    pub fn aggregate_type(&self) -> Option<&str> {
        self.get_meta(meta::AGGREGATE_TYPE).and_then(JsonValue::as_str)
    }

    pub fn aggregate_version(&self) -> Option<u64> {
        self.get_meta(meta::AGGREGATE_VERSION).and_then(JsonValue::as_u64)
    }

    pub fn causation_id(&self) -> Option<MessageId> {
        self.get_meta(meta::CAUSATION_ID)
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn causation_name(&self) -> Option<&str> {
        self.get_meta(meta::CAUSATION_NAME).and_then(JsonValue::as_str)
    }

    pub fn correlation_id(&self) -> Option<MessageId> {
        self.get_meta(meta::CORRELATION_ID)
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructs_a_command() {
        let cmd = Message::command("RegisterUser", json!({"id": "U1"})).unwrap();
        assert_eq!(cmd.name(), "RegisterUser");
        assert_eq!(cmd.message_type(), MessageType::Command);
        assert_eq!(cmd.get("id"), Some(&json!("U1")));
        assert!(cmd.metadata().is_empty());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Message::command("", json!({})).is_err());
        assert!(Message::command("has space", json!({})).is_err());
        assert!(Message::command("ümlaut", json!({})).is_err());
        assert!(Message::command("Ns.Sub/Cmd_v1-x", json!({})).is_ok());
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert!(matches!(
            Message::event("E", json!([1, 2])),
            Err(MessageError::PayloadNotObject(_))
        ));
        assert!(matches!(
            Message::event("E", json!("scalar")),
            Err(MessageError::PayloadNotObject(_))
        ));
    }

    #[test]
    fn with_operations_return_copies() {
        let original = Message::event("E", json!({"a": 1})).unwrap();
        let modified = original.with_added_metadata("k", json!("v"));

        assert!(original.get_meta("k").is_none());
        assert_eq!(modified.get_meta("k"), Some(&json!("v")));
        assert_eq!(original.id(), modified.id());

        let replaced = original.with_payload(json!({"a": 2})).unwrap();
        assert_eq!(original.get("a"), Some(&json!(1)));
        assert_eq!(replaced.get("a"), Some(&json!(2)));
    }

    #[test]
    fn typed_metadata_accessors() {
        let cause = Message::command("C", json!({})).unwrap();
        let event = Message::event("E", json!({}))
            .unwrap()
            .with_added_metadata(meta::AGGREGATE_ID, json!("A1"))
            .with_added_metadata(meta::AGGREGATE_TYPE, json!("User"))
            .with_added_metadata(meta::AGGREGATE_VERSION, json!(3))
            .with_added_metadata(meta::CAUSATION_ID, json!(cause.id().to_string()))
            .with_added_metadata(meta::CAUSATION_NAME, json!("C"));

        assert_eq!(event.aggregate_id().unwrap().as_str(), "A1");
        assert_eq!(event.aggregate_type(), Some("User"));
        assert_eq!(event.aggregate_version(), Some(3));
        assert_eq!(event.causation_id(), Some(cause.id()));
        assert_eq!(event.causation_name(), Some("C"));
        assert_eq!(event.correlation_id(), None);
    }
}
