//! `keelson-engine` — the command dispatch and persistence core.
//!
//! A command dispatched into the [`engine::Engine`] flows through:
//! pre-processors → command processor → aggregate repository (read) →
//! aggregate state machine (mutate) → aggregate repository (write,
//! transactional) → projections / listeners.
//!
//! Storage is consumed through narrow traits ([`event_store::EventStore`],
//! [`document_store::DocumentStore`], [`multi_model::MultiModelStore`]);
//! in-memory implementations back tests and dev setups. Domain call
//! conventions are adapted by a [`flavour::Flavour`], selected at
//! composition time.

pub mod aggregate;
pub mod document_store;
pub mod engine;
pub mod event_store;
pub mod flavour;
pub mod multi_model;
pub mod processor;
pub mod projection;
pub mod store;


pub use aggregate::{AggregateError, AggregateRoot, AggregateTypeDescription, Repository, RepositoryError};
pub use document_store::{DocumentStore, DocumentStoreError, InMemoryDocumentStore, Index};
pub use engine::{DispatchOutcome, Engine, EngineBuildError, EngineBuilder, PreProcessed};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore};
pub use flavour::{domain_events, no_events, DomainEvents, Flavour, FlavourError, FunctionalFlavour, NewEvent};
pub use multi_model::{Connection, InMemoryMultiModelStore, MultiModelStore, TransactionError};
pub use processor::{
    CommandDispatchResult, CommandProcessorDescription, DispatchCache, DispatchError, ServiceFn,
};
pub use projection::{Projection, ProjectionDescription, ProjectionError};
pub use store::EngineStore;
