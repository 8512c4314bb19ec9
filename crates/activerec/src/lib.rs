//! # activerec: ActiveRecord-style persistence layer
//!
//! A convenience layer over an opaque persistence engine: entity types are
//! registered against engine configurations, session factories are built
//! lazily and cached per configuration, nestable session scopes manage
//! session lifetime and flush timing, and a generic `Record` trait exposes
//! CRUD and query operations that work the same inside and outside a
//! scope.
//!
//! The engine itself — query execution, flushing, transactions — sits
//! behind the traits in [`engine`]; an in-memory engine ships as the
//! reference implementation.

pub mod config;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod events;
pub mod holder;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod scope;
pub mod session;

// Re-export core traits and types
pub use config::*;
pub use criteria::*;
pub use error::*;
pub use events::*;
pub use holder::*;
pub use record::*;
pub use registry::*;
pub use runtime::*;
pub use scope::*;
pub use session::*;

pub use engine::{
    Configuration, EngineError, EngineResult, EntityBinding, FactoryId, FieldMap,
    MemoryConfiguration, MemoryStore, Session, SessionFactory, SessionInterceptor,
    StatelessSession, Value,
};
