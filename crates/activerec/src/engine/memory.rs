//! In-Memory Engine
//!
//! Reference implementation of the engine seam backed by a process-local
//! store. Sessions queue their changes in a pending buffer and apply them
//! on `flush`, so flush-timing behavior is observable; connection ids come
//! from a process-wide counter, so two factories' sessions are provably
//! distinct.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::criteria::Criteria;
use crate::engine::core::{
    Configuration, EngineError, EngineResult, EntityBinding, FactoryId, FieldMap, Session,
    SessionFactory, SessionInterceptor, StatelessSession, Value,
};
use crate::events::{ListenerError, ListenerSet};

/// Process-wide connection counter; every opened session gets a fresh id
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> u64 {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

impl From<ListenerError> for EngineError {
    fn from(err: ListenerError) -> Self {
        EngineError::ListenerRejected(err.message)
    }
}

/// Shared backing storage: entity name to key-ordered rows
#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, BTreeMap<String, FieldMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, entity: &str, key: &str) -> Option<FieldMap> {
        self.tables
            .get(entity)
            .and_then(|table| table.get(key).cloned())
    }

    fn write(&self, entity: &str, key: String, fields: FieldMap) {
        self.tables
            .entry(entity.to_string())
            .or_default()
            .insert(key, fields);
    }

    fn remove(&self, entity: &str, key: &str) -> bool {
        self.tables
            .get_mut(entity)
            .map(|mut table| table.remove(key).is_some())
            .unwrap_or(false)
    }

    fn contains(&self, entity: &str, key: &str) -> bool {
        self.tables
            .get(entity)
            .map(|table| table.contains_key(key))
            .unwrap_or(false)
    }

    /// All rows of an entity, key order
    pub fn rows(&self, entity: &str) -> Vec<FieldMap> {
        self.tables
            .get(entity)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Row count for an entity
    pub fn len(&self, entity: &str) -> usize {
        self.tables
            .get(entity)
            .map(|table| table.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, entity: &str) -> bool {
        self.len(entity) == 0
    }
}

/// Configuration for the in-memory engine.
///
/// Owns the store it will hand to the factory, so embedders (and tests) can
/// inspect backing storage independently of any session.
pub struct MemoryConfiguration {
    name: String,
    sources: Vec<String>,
    bindings: Vec<EntityBinding>,
    store: Arc<MemoryStore>,
}

impl MemoryConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            bindings: Vec::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Declare a mapping source this configuration contributes
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Declare a mapped entity
    pub fn with_entity(mut self, binding: EntityBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// The backing store the built factory will use
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl Configuration for MemoryConfiguration {
    fn name(&self) -> &str {
        &self.name
    }

    fn mapping_sources(&self) -> Vec<String> {
        self.sources.clone()
    }

    fn declared_entities(&self) -> Vec<EntityBinding> {
        self.bindings.clone()
    }

    async fn build_session_factory(
        &self,
        listeners: ListenerSet,
    ) -> EngineResult<Arc<dyn SessionFactory>> {
        if self.bindings.is_empty() {
            return Err(EngineError::Backend(format!(
                "configuration '{}' maps no entities",
                self.name
            )));
        }
        let key_fields = self
            .bindings
            .iter()
            .map(|b| (b.name.clone(), b.key.clone()))
            .collect();
        tracing::debug!(
            configuration = %self.name,
            entities = self.bindings.len(),
            "Building in-memory session factory"
        );
        Ok(Arc::new(MemoryFactory {
            shared: Arc::new(FactoryShared {
                id: FactoryId::new(),
                key_fields,
                store: Arc::clone(&self.store),
                listeners,
            }),
        }))
    }
}

/// State shared between a factory and every session it opens
struct FactoryShared {
    id: FactoryId,
    key_fields: HashMap<String, String>,
    store: Arc<MemoryStore>,
    listeners: ListenerSet,
}

impl FactoryShared {
    fn key_of(&self, entity: &str, fields: &FieldMap) -> EngineResult<String> {
        let key_field = self
            .key_fields
            .get(entity)
            .ok_or_else(|| EngineError::UnknownEntity(entity.to_string()))?;
        match fields.get(key_field) {
            Some(value) if !value.is_null() => Ok(value.to_key_string()),
            _ => Err(EngineError::Backend(format!(
                "record of '{}' is missing key field '{}'",
                entity, key_field
            ))),
        }
    }

    fn check_entity(&self, entity: &str) -> EngineResult<()> {
        if self.key_fields.contains_key(entity) {
            Ok(())
        } else {
            Err(EngineError::UnknownEntity(entity.to_string()))
        }
    }
}

/// Session factory over a shared in-memory store
pub struct MemoryFactory {
    shared: Arc<FactoryShared>,
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    fn factory_id(&self) -> FactoryId {
        self.shared.id
    }

    fn mapped_entities(&self) -> Vec<String> {
        self.shared.key_fields.keys().cloned().collect()
    }

    fn key_field(&self, entity: &str) -> Option<String> {
        self.shared.key_fields.get(entity).cloned()
    }

    async fn open_session(
        &self,
        interceptor: Option<Arc<dyn SessionInterceptor>>,
    ) -> EngineResult<Box<dyn Session>> {
        let session_id = Uuid::new_v4();
        let connection_id = next_connection_id();
        tracing::debug!(%session_id, connection_id, "Opening in-memory session");
        if let Some(interceptor) = &interceptor {
            interceptor.session_opened(session_id);
        }
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            session_id,
            connection_id,
            interceptor,
            pending: Vec::new(),
            cache: HashMap::new(),
            closed: false,
        }))
    }

    async fn open_stateless_session(&self) -> EngineResult<Box<dyn StatelessSession>> {
        Ok(Box::new(MemoryStatelessSession {
            shared: Arc::clone(&self.shared),
            session_id: Uuid::new_v4(),
            closed: false,
        }))
    }
}

/// A change queued on a session, applied at flush time
#[derive(Debug, Clone)]
enum PendingOp {
    Insert {
        entity: String,
        key: String,
        fields: FieldMap,
    },
    Update {
        entity: String,
        key: String,
        fields: FieldMap,
    },
    Delete {
        entity: String,
        key: String,
    },
}

/// Unit-of-work session over the shared store
pub struct MemorySession {
    shared: Arc<FactoryShared>,
    session_id: Uuid,
    connection_id: u64,
    interceptor: Option<Arc<dyn SessionInterceptor>>,
    pending: Vec<PendingOp>,
    cache: HashMap<(String, String), FieldMap>,
    closed: bool,
}

impl MemorySession {
    fn check_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Current value for a key as this session sees it: pending changes
    /// shadow the cache, the cache shadows the store.
    fn view(&self, entity: &str, key: &str) -> Option<FieldMap> {
        for op in self.pending.iter().rev() {
            match op {
                PendingOp::Insert { entity: e, key: k, fields }
                | PendingOp::Update { entity: e, key: k, fields }
                    if e == entity && k == key =>
                {
                    return Some(fields.clone());
                }
                PendingOp::Delete { entity: e, key: k } if e == entity && k == key => {
                    return None;
                }
                _ => {}
            }
        }
        if let Some(cached) = self.cache.get(&(entity.to_string(), key.to_string())) {
            return Some(cached.clone());
        }
        self.shared.store.read(entity, key)
    }

    /// All rows of an entity as this session sees them
    fn view_all(&self, entity: &str) -> BTreeMap<String, FieldMap> {
        let mut rows: BTreeMap<String, FieldMap> = self
            .shared
            .store
            .tables
            .get(entity)
            .map(|table| table.value().clone())
            .unwrap_or_default();
        for op in &self.pending {
            match op {
                PendingOp::Insert { entity: e, key, fields }
                | PendingOp::Update { entity: e, key, fields }
                    if e == entity =>
                {
                    rows.insert(key.clone(), fields.clone());
                }
                PendingOp::Delete { entity: e, key } if e == entity => {
                    rows.remove(key);
                }
                _ => {}
            }
        }
        rows
    }

    fn exists_in_view(&self, entity: &str, key: &str) -> bool {
        self.view(entity, key).is_some()
    }
}

#[async_trait]
impl Session for MemorySession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    async fn get(&mut self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let key = id.to_key_string();
        let found = self.view(entity, &key);
        if let Some(fields) = &found {
            self.cache
                .insert((entity.to_string(), key), fields.clone());
        }
        Ok(found)
    }

    async fn insert(&mut self, entity: &str, mut fields: FieldMap) -> EngineResult<()> {
        self.check_open()?;
        let key = self.shared.key_of(entity, &fields)?;
        if self.exists_in_view(entity, &key) {
            return Err(EngineError::DuplicateRecord {
                entity: entity.to_string(),
                id: key,
            });
        }
        self.shared.listeners.before_insert(entity, &mut fields).await?;
        self.pending.push(PendingOp::Insert {
            entity: entity.to_string(),
            key,
            fields,
        });
        Ok(())
    }

    async fn update(&mut self, entity: &str, mut fields: FieldMap) -> EngineResult<()> {
        self.check_open()?;
        let key = self.shared.key_of(entity, &fields)?;
        if !self.exists_in_view(entity, &key) {
            return Err(EngineError::NotFound {
                entity: entity.to_string(),
                id: key,
            });
        }
        self.shared.listeners.before_update(entity, &mut fields).await?;
        self.pending.push(PendingOp::Update {
            entity: entity.to_string(),
            key,
            fields,
        });
        Ok(())
    }

    async fn merge(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        let key = self.shared.key_of(entity, &fields)?;
        if self.exists_in_view(entity, &key) {
            self.update(entity, fields).await
        } else {
            self.insert(entity, fields).await
        }
    }

    async fn replicate(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.check_open()?;
        let key = self.shared.key_of(entity, &fields)?;
        let op = if self.exists_in_view(entity, &key) {
            PendingOp::Update {
                entity: entity.to_string(),
                key,
                fields,
            }
        } else {
            PendingOp::Insert {
                entity: entity.to_string(),
                key,
                fields,
            }
        };
        self.pending.push(op);
        Ok(())
    }

    async fn delete(&mut self, entity: &str, id: &Value) -> EngineResult<()> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let key = id.to_key_string();
        if !self.exists_in_view(entity, &key) {
            return Err(EngineError::NotFound {
                entity: entity.to_string(),
                id: key,
            });
        }
        self.shared.listeners.before_delete(entity, &key).await?;
        self.pending.push(PendingOp::Delete {
            entity: entity.to_string(),
            key,
        });
        Ok(())
    }

    async fn delete_all(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<u64> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let matching: Vec<String> = self
            .view_all(entity)
            .into_iter()
            .filter(|(_, fields)| criteria.matches(fields))
            .map(|(key, _)| key)
            .collect();
        let count = matching.len() as u64;
        for key in matching {
            self.shared.listeners.before_delete(entity, &key).await?;
            self.pending.push(PendingOp::Delete {
                entity: entity.to_string(),
                key,
            });
        }
        Ok(count)
    }

    async fn find_all(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<Vec<FieldMap>> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let rows: Vec<FieldMap> = self
            .view_all(entity)
            .into_values()
            .filter(|fields| criteria.matches(fields))
            .collect();
        Ok(criteria.arrange(rows))
    }

    async fn count(&mut self, entity: &str, criteria: &Criteria) -> EngineResult<u64> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let count = self
            .view_all(entity)
            .values()
            .filter(|fields| criteria.matches(fields))
            .count();
        Ok(count as u64)
    }

    async fn refresh(&mut self, entity: &str, id: &Value) -> EngineResult<FieldMap> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let key = id.to_key_string();
        match self.shared.store.read(entity, &key) {
            Some(fields) => {
                self.cache
                    .insert((entity.to_string(), key), fields.clone());
                Ok(fields)
            }
            None => Err(EngineError::NotFound {
                entity: entity.to_string(),
                id: key,
            }),
        }
    }

    async fn evict(&mut self, entity: &str, id: &Value) -> EngineResult<()> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        self.cache
            .remove(&(entity.to_string(), id.to_key_string()));
        Ok(())
    }

    async fn flush(&mut self) -> EngineResult<()> {
        self.check_open()?;
        if let Some(interceptor) = &self.interceptor {
            interceptor.before_flush(self.session_id);
        }
        self.shared.listeners.before_flush(self.session_id).await?;

        let ops = std::mem::take(&mut self.pending);
        tracing::debug!(session_id = %self.session_id, ops = ops.len(), "Flushing session");
        for (index, op) in ops.iter().enumerate() {
            let applied = self.apply(op).await;
            if let Err(err) = applied {
                // Keep the unapplied tail so a later flush can retry
                self.pending = ops[index..].to_vec();
                return Err(err);
            }
        }

        self.shared.listeners.after_flush(self.session_id).await?;
        if let Some(interceptor) = &self.interceptor {
            interceptor.after_flush(self.session_id);
        }
        Ok(())
    }

    async fn clear(&mut self) -> EngineResult<()> {
        self.check_open()?;
        tracing::debug!(session_id = %self.session_id, dropped = self.pending.len(), "Clearing session");
        self.pending.clear();
        self.cache.clear();
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        if !self.closed {
            tracing::debug!(session_id = %self.session_id, "Closing session");
            self.closed = true;
            self.pending.clear();
            self.cache.clear();
        }
        Ok(())
    }
}

impl MemorySession {
    async fn apply(&self, op: &PendingOp) -> EngineResult<()> {
        let store = &self.shared.store;
        match op {
            PendingOp::Insert { entity, key, fields } => {
                if store.contains(entity, key) {
                    return Err(EngineError::DuplicateRecord {
                        entity: entity.clone(),
                        id: key.clone(),
                    });
                }
                store.write(entity, key.clone(), fields.clone());
                self.shared.listeners.after_insert(entity, fields).await?;
            }
            PendingOp::Update { entity, key, fields } => {
                store.write(entity, key.clone(), fields.clone());
                self.shared.listeners.after_update(entity, fields).await?;
            }
            PendingOp::Delete { entity, key } => {
                store.remove(entity, key);
                self.shared.listeners.after_delete(entity, key).await?;
            }
        }
        Ok(())
    }
}

/// Stateless session: straight-through reads and writes, no listeners
pub struct MemoryStatelessSession {
    shared: Arc<FactoryShared>,
    session_id: Uuid,
    closed: bool,
}

impl MemoryStatelessSession {
    fn check_open(&self) -> EngineResult<()> {
        if self.closed {
            Err(EngineError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StatelessSession for MemoryStatelessSession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn get(&mut self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        Ok(self.shared.store.read(entity, &id.to_key_string()))
    }

    async fn insert(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.check_open()?;
        let key = self.shared.key_of(entity, &fields)?;
        if self.shared.store.contains(entity, &key) {
            return Err(EngineError::DuplicateRecord {
                entity: entity.to_string(),
                id: key,
            });
        }
        self.shared.store.write(entity, key, fields);
        Ok(())
    }

    async fn update(&mut self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.check_open()?;
        let key = self.shared.key_of(entity, &fields)?;
        if !self.shared.store.contains(entity, &key) {
            return Err(EngineError::NotFound {
                entity: entity.to_string(),
                id: key,
            });
        }
        self.shared.store.write(entity, key, fields);
        Ok(())
    }

    async fn delete(&mut self, entity: &str, id: &Value) -> EngineResult<()> {
        self.check_open()?;
        self.shared.check_entity(entity)?;
        let key = id.to_key_string();
        if !self.shared.store.remove(entity, &key) {
            return Err(EngineError::NotFound {
                entity: entity.to_string(),
                id: key,
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfiguration {
        MemoryConfiguration::new("test")
            .with_source("test-entities")
            .with_entity(EntityBinding::new("user"))
    }

    fn user(id: i64, name: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), Value::Int(id));
        fields.insert("name".to_string(), Value::from(name));
        fields
    }

    async fn open(config: &MemoryConfiguration) -> Box<dyn Session> {
        let factory = config
            .build_session_factory(ListenerSet::default())
            .await
            .unwrap();
        factory.open_session(None).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_invisible_until_flush() {
        let config = config();
        let store = config.store();
        let mut session = open(&config).await;

        session.insert("user", user(1, "kate")).await.unwrap();
        assert!(store.is_empty("user"));

        // The inserting session sees its own pending change
        let seen = session.get("user", &Value::Int(1)).await.unwrap();
        assert!(seen.is_some());

        session.flush().await.unwrap();
        assert_eq!(store.len("user"), 1);
    }

    #[tokio::test]
    async fn test_clear_discards_pending_changes() {
        let config = config();
        let store = config.store();
        let mut session = open(&config).await;

        session.insert("user", user(1, "kate")).await.unwrap();
        session.clear().await.unwrap();
        session.flush().await.unwrap();
        assert!(store.is_empty("user"));
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let config = config();
        let mut session = open(&config).await;

        let err = session.update("user", user(9, "ghost")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let config = config();
        let mut session = open(&config).await;

        session.insert("user", user(1, "kate")).await.unwrap();
        let err = session.insert("user", user(1, "kate")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRecord { .. }));
    }

    #[tokio::test]
    async fn test_unknown_entity_rejected() {
        let config = config();
        let mut session = open(&config).await;

        let err = session.get("ghost", &Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn test_closed_session_refuses_operations() {
        let config = config();
        let mut session = open(&config).await;

        session.close().await.unwrap();
        let err = session.get("user", &Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionClosed));
    }

    #[tokio::test]
    async fn test_refresh_bypasses_pending_changes() {
        let config = config();
        let mut session = open(&config).await;

        session.insert("user", user(1, "kate")).await.unwrap();
        session.flush().await.unwrap();

        session.update("user", user(1, "katherine")).await.unwrap();
        let refreshed = session.refresh("user", &Value::Int(1)).await.unwrap();
        assert_eq!(refreshed.get("name"), Some(&Value::from("kate")));
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct() {
        let config = config();
        let factory = config
            .build_session_factory(ListenerSet::default())
            .await
            .unwrap();
        let a = factory.open_session(None).await.unwrap();
        let b = factory.open_session(None).await.unwrap();
        assert_ne!(a.connection_id(), b.connection_id());
    }

    #[tokio::test]
    async fn test_stateless_session_writes_immediately() {
        let config = config();
        let store = config.store();
        let factory = config
            .build_session_factory(ListenerSet::default())
            .await
            .unwrap();
        let mut stateless = factory.open_stateless_session().await.unwrap();

        stateless.insert("user", user(1, "kate")).await.unwrap();
        assert_eq!(store.len("user"), 1);

        stateless.delete("user", &Value::Int(1)).await.unwrap();
        assert!(store.is_empty("user"));
    }

    #[tokio::test]
    async fn test_delete_all_honors_criteria() {
        let config = config();
        let store = config.store();
        let mut session = open(&config).await;

        session.insert("user", user(1, "kate")).await.unwrap();
        session.insert("user", user(2, "anna")).await.unwrap();
        session.insert("user", user(3, "kate")).await.unwrap();
        session.flush().await.unwrap();

        let removed = session
            .delete_all("user", &Criteria::new().eq("name", "kate"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        session.flush().await.unwrap();
        assert_eq!(store.len("user"), 1);
    }
}
