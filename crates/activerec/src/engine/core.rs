//! Core Engine Traits
//!
//! This module defines the contract between the active-record layer and the
//! wrapped persistence engine. The engine owns everything hard: query
//! execution, flushing, dirty tracking, transactions. The layer only ever
//! talks to these traits, so any engine that can build session factories
//! and open sessions can sit behind the registry.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::criteria::Criteria;
use crate::events::ListenerSet;

/// Engine-level error type.
///
/// `NotFound` is the one variant the layer inspects: execute helpers
/// translate it into the crate's own missing-record error so callers never
/// match on engine types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("entity '{entity}' with id {id} was not found")]
    NotFound { entity: String, id: String },

    #[error("entity '{0}' is not mapped by this factory")]
    UnknownEntity(String),

    #[error("record '{entity}({id})' already exists")]
    DuplicateRecord { entity: String, id: String },

    #[error("session is closed")]
    SessionClosed,

    #[error("listener rejected the operation: {0}")]
    ListenerRejected(String),

    #[error("engine failure: {0}")]
    Backend(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Opaque identity of a built session factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryId(Uuid);

impl FactoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FactoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Field value enumeration for engine records and criteria parameters
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to a JSON value.
    ///
    /// This is the canonical form: equality between values of different
    /// variants (a `Uuid` against the `Text` a round-tripped record holds)
    /// is decided on the JSON form, not on the variant.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => JsonValue::from(*f),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Uuid(u) => JsonValue::String(u.to_string()),
            Value::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Build a value from a JSON value
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    /// Canonical string form, usable as a storage key
    pub fn to_key_string(&self) -> String {
        match self.to_json() {
            JsonValue::String(s) => s,
            other => other.to_string(),
        }
    }

    /// Equality on the canonical JSON form
    pub fn same_as(&self, other: &Value) -> bool {
        self.to_json() == other.to_json()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Value::DateTime(v)
    }
}

/// A type-erased record: field name to value
pub type FieldMap = HashMap<String, Value>;

/// One entity mapped by a configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntityBinding {
    /// Entity name the layer addresses records by
    pub name: String,
    /// Primary key field inside the record
    #[serde(default = "EntityBinding::default_key")]
    pub key: String,
    /// Mapped base entities, nearest first, for hierarchy resolution
    #[serde(default)]
    pub ancestors: Vec<String>,
}

impl EntityBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: Self::default_key(),
            ancestors: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_ancestors(mut self, ancestors: Vec<String>) -> Self {
        self.ancestors = ancestors;
        self
    }

    fn default_key() -> String {
        "id".to_string()
    }
}

/// An engine configuration: a bundle of entity mappings plus whatever
/// connection settings the engine needs. Building the session factory is
/// expensive and happens at most once per configuration.
#[async_trait]
pub trait Configuration: Send + Sync {
    /// Configuration name for identification and listener wiring
    fn name(&self) -> &str;

    /// Mapping sources this configuration contributes.
    ///
    /// Two configurations must never contribute the same source; the
    /// registry rejects the second registration.
    fn mapping_sources(&self) -> Vec<String>;

    /// Entities this configuration declares, before any factory is built
    fn declared_entities(&self) -> Vec<EntityBinding>;

    /// Build the session factory for this configuration.
    ///
    /// Listeners registered for this configuration are handed over here so
    /// the engine can wire them into the sessions it opens.
    async fn build_session_factory(
        &self,
        listeners: ListenerSet,
    ) -> EngineResult<Arc<dyn SessionFactory>>;
}

/// A built session factory: expensive, shared, never rebuilt
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Stable identity of this factory
    fn factory_id(&self) -> FactoryId;

    /// Every entity this factory maps.
    ///
    /// May be a superset of what a single caller asked about; the registry
    /// caches the factory under all of them.
    fn mapped_entities(&self) -> Vec<String>;

    /// Primary key field for a mapped entity
    fn key_field(&self, entity: &str) -> Option<String>;

    /// Open a session, optionally wrapped by an interceptor
    async fn open_session(
        &self,
        interceptor: Option<Arc<dyn SessionInterceptor>>,
    ) -> EngineResult<Box<dyn Session>>;

    /// Open a stateless session: no pending-change tracking, no listeners
    async fn open_stateless_session(&self) -> EngineResult<Box<dyn StatelessSession>>;
}

/// A unit-of-work session handle from the engine.
///
/// Tracks pending changes until `flush`; `clear` discards them. All
/// semantics beyond that bookkeeping belong to the engine.
#[async_trait]
pub trait Session: Send + Sync {
    /// Unique id of this session
    fn session_id(&self) -> Uuid;

    /// Identity of the underlying connection, distinct per open session
    fn connection_id(&self) -> u64;

    /// Load a record by primary key, or `None` if absent
    async fn get(&mut self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>>;

    /// Queue an insert; fails on duplicate key
    async fn insert(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    /// Queue an update; fails with `NotFound` if the record does not exist
    async fn update(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    /// Insert or update depending on key existence
    async fn merge(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    /// Write the record as-is, id included, overwriting any existing row
    async fn replicate(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    /// Queue a delete by primary key; fails with `NotFound` if absent
    async fn delete(&mut self, entity: &str, id: &Value) -> EngineResult<()>;

    /// Queue deletes for every matching record, returning how many matched
    async fn delete_all(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<u64>;

    /// Fetch all records matching the criteria
    async fn find_all(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<Vec<FieldMap>>;

    /// Count records matching the criteria (slicing is ignored)
    async fn count(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<u64>;

    /// Re-read a record from backing storage, bypassing session caches
    async fn refresh(&mut self, entity: &str, id: &Value) -> EngineResult<FieldMap>;

    /// Drop a record from the session-level cache
    async fn evict(&mut self, entity: &str, id: &Value) -> EngineResult<()>;

    /// Synchronize pending changes to backing storage
    async fn flush(&mut self) -> EngineResult<()>;

    /// Discard pending changes and the session-level cache
    async fn clear(&mut self) -> EngineResult<()>;

    /// Close the session; all further operations fail
    async fn close(&mut self) -> EngineResult<()>;
}

/// A stateless session: every operation hits backing storage immediately
#[async_trait]
pub trait StatelessSession: Send + Sync {
    fn session_id(&self) -> Uuid;

    async fn get(&mut self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>>;

    async fn insert(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    async fn update(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()>;

    async fn delete(&mut self, entity: &str, id: &Value) -> EngineResult<()>;

    async fn close(&mut self) -> EngineResult<()>;
}

/// Hook into session creation and flushing.
///
/// A scope passes one of these when it opens sessions through itself so it
/// can observe the sessions it is responsible for.
pub trait SessionInterceptor: Send + Sync {
    /// Called once when a session is opened with this interceptor
    fn session_opened(&self, _session_id: Uuid) {}

    /// Called before a flush begins
    fn before_flush(&self, _session_id: Uuid) {}

    /// Called after a flush completed successfully
    fn after_flush(&self, _session_id: Uuid) {}
}
