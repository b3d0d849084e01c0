//! `keelson-messaging` — message envelope and distribution primitives.
//!
//! Defines the immutable [`Message`] envelope shared by commands, events and
//! queries, the schema gate consulted before a message is constructed, and a
//! lightweight pub/sub bus for out-of-band event consumption.

pub mod bus;
pub mod in_memory_bus;
pub mod message;
pub mod schema;
pub mod worker;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use message::{meta, Message, MessageError, MessageType};
pub use schema::{AcceptAllValidator, FactoryError, MessageFactory, PayloadValidator, SchemaError};
pub use worker::{ProjectionWorker, WorkerHandle};
