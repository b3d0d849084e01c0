//! `keelson-core` — shared foundation for the keelson engine.
//!
//! This crate contains identifiers, stream references, storage modes and the
//! core error model. It has no infrastructure concerns.

pub mod error;
pub mod id;
pub mod storage;
pub mod stream;

pub use error::{CoreError, CoreResult};
pub use id::{AggregateId, MessageId};
pub use storage::StorageMode;
pub use stream::Stream;
