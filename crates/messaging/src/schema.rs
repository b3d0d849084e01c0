//! Payload schema gate.
//!
//! Schema validation itself is an external concern; the engine only needs a
//! boolean gate plus a descriptive error. [`MessageFactory`] consults the
//! gate before a message is constructed, so an invalid payload never becomes
//! a [`Message`].

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::message::{Message, MessageError, MessageType};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("payload of '{message}' violates its schema: {detail}")]
    Violation { message: String, detail: String },

    #[error("no schema registered for message '{0}'")]
    UnknownMessage(String),
}

/// Validates a message payload against a registered schema.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, message_name: &str, payload: &JsonValue) -> Result<(), SchemaError>;
}

impl<V> PayloadValidator for Arc<V>
where
    V: PayloadValidator + ?Sized,
{
    fn validate(&self, message_name: &str, payload: &JsonValue) -> Result<(), SchemaError> {
        (**self).validate(message_name, payload)
    }
}

/// Gate that accepts every payload. Used in tests and prototyping setups
/// where schemas live outside the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllValidator;

impl PayloadValidator for AcceptAllValidator {
    fn validate(&self, _message_name: &str, _payload: &JsonValue) -> Result<(), SchemaError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Constructs validated messages.
#[derive(Debug)]
pub struct MessageFactory<V> {
    validator: V,
}

impl<V> MessageFactory<V>
where
    V: PayloadValidator,
{
    pub fn new(validator: V) -> Self {
        Self { validator }
    }

    pub fn build(
        &self,
        message_type: MessageType,
        name: &str,
        payload: JsonValue,
    ) -> Result<Message, FactoryError> {
        self.validator.validate(name, &payload)?;
        Ok(Message::new(message_type, name, payload)?)
    }

    pub fn command(&self, name: &str, payload: JsonValue) -> Result<Message, FactoryError> {
        self.build(MessageType::Command, name, payload)
    }

    pub fn event(&self, name: &str, payload: JsonValue) -> Result<Message, FactoryError> {
        self.build(MessageType::Event, name, payload)
    }

    pub fn query(&self, name: &str, payload: JsonValue) -> Result<Message, FactoryError> {
        self.build(MessageType::Query, name, payload)
    }
}
