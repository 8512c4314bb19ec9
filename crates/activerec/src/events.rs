//! Record Event Listeners
//!
//! Listeners hook into record lifecycle events inside the engine. There is
//! no scan-and-discover machinery: application startup code registers each
//! listener explicitly against a configuration, and the registry hands the
//! collected set to the engine when the session factory is built.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::engine::core::FieldMap;

/// Error raised by a listener to veto or abort an operation
#[derive(Debug, thiserror::Error)]
#[error("listener error: {message}")]
pub struct ListenerError {
    pub message: String,
}

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Lifecycle event groups a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Insert,
    Update,
    Delete,
    Flush,
}

/// Listener for record lifecycle events.
///
/// All hooks default to no-ops; implement only the ones you care about.
/// `before_*` hooks run when the operation is queued on the session and may
/// mutate the outgoing fields; `after_*` hooks run when the flush applies
/// the change to backing storage.
#[async_trait]
pub trait RecordListener: Send + Sync {
    async fn before_insert(&self, _entity: &str, _fields: &mut FieldMap) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn after_insert(&self, _entity: &str, _fields: &FieldMap) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn before_update(&self, _entity: &str, _fields: &mut FieldMap) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn after_update(&self, _entity: &str, _fields: &FieldMap) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn before_delete(&self, _entity: &str, _key: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn after_delete(&self, _entity: &str, _key: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn before_flush(&self, _session: Uuid) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn after_flush(&self, _session: Uuid) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// The listeners wired into one configuration, in registration order
#[derive(Clone, Default)]
pub struct ListenerSet {
    entries: Vec<(ListenerKind, Arc<dyn RecordListener>)>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ListenerKind, listener: Arc<dyn RecordListener>) {
        self.entries.push((kind, listener));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn of_kind(&self, kind: ListenerKind) -> impl Iterator<Item = &Arc<dyn RecordListener>> {
        self.entries
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, l)| l)
    }

    pub async fn before_insert(&self, entity: &str, fields: &mut FieldMap) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Insert) {
            listener.before_insert(entity, fields).await?;
        }
        Ok(())
    }

    pub async fn after_insert(&self, entity: &str, fields: &FieldMap) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Insert) {
            listener.after_insert(entity, fields).await?;
        }
        Ok(())
    }

    pub async fn before_update(&self, entity: &str, fields: &mut FieldMap) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Update) {
            listener.before_update(entity, fields).await?;
        }
        Ok(())
    }

    pub async fn after_update(&self, entity: &str, fields: &FieldMap) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Update) {
            listener.after_update(entity, fields).await?;
        }
        Ok(())
    }

    pub async fn before_delete(&self, entity: &str, key: &str) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Delete) {
            listener.before_delete(entity, key).await?;
        }
        Ok(())
    }

    pub async fn after_delete(&self, entity: &str, key: &str) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Delete) {
            listener.after_delete(entity, key).await?;
        }
        Ok(())
    }

    pub async fn before_flush(&self, session: Uuid) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Flush) {
            listener.before_flush(session).await?;
        }
        Ok(())
    }

    pub async fn after_flush(&self, session: Uuid) -> Result<(), ListenerError> {
        for listener in self.of_kind(ListenerKind::Flush) {
            listener.after_flush(session).await?;
        }
        Ok(())
    }
}

/// Listener registrations keyed by configuration name.
///
/// Registration only matters before the configuration's factory is built;
/// listeners added afterwards are never wired in, matching factory
/// build-once semantics.
#[derive(Default)]
pub struct ListenerRegistry {
    by_configuration: Mutex<HashMap<String, ListenerSet>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one configuration
    pub fn register(
        &self,
        kind: ListenerKind,
        listener: Arc<dyn RecordListener>,
        configuration: &str,
    ) {
        let mut map = self.by_configuration.lock().unwrap();
        map.entry(configuration.to_string())
            .or_default()
            .push(kind, listener);
    }

    /// The listener set for a configuration, empty if none were registered
    pub fn for_configuration(&self, configuration: &str) -> ListenerSet {
        let map = self.by_configuration.lock().unwrap();
        map.get(configuration).cloned().unwrap_or_default()
    }
}
