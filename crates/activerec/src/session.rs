//! Session Handles
//!
//! Cheap, clonable wrappers around engine sessions. A handle can be shared
//! between a scope and the operation currently using it; the underlying
//! engine session sits behind an async mutex, and the failure flag rides
//! on the handle so every holder of it agrees on whether the session may
//! still be flushed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::criteria::Criteria;
use crate::engine::core::{
    EngineResult, FactoryId, FieldMap, Session, StatelessSession, Value,
};

/// Clonable handle to an open engine session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<tokio::sync::Mutex<Box<dyn Session>>>,
    factory_id: FactoryId,
    session_id: Uuid,
    connection_id: u64,
    failed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(session: Box<dyn Session>, factory_id: FactoryId) -> Self {
        let session_id = session.session_id();
        let connection_id = session.connection_id();
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(session)),
            factory_id,
            session_id,
            connection_id,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The factory this session was opened from
    pub fn factory_id(&self) -> FactoryId {
        self.factory_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Identity of the underlying connection
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// True when both handles refer to the same open session
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mark the session failed; failed sessions are cleared at disposal
    /// instead of flushed.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub async fn get(&self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>> {
        self.inner.lock().await.get(entity, id).await
    }

    pub async fn insert(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.insert(entity, fields).await
    }

    pub async fn update(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.update(entity, fields).await
    }

    pub async fn merge(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.merge(entity, fields).await
    }

    pub async fn replicate(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.replicate(entity, fields).await
    }

    pub async fn delete(&self, entity: &str, id: &Value) -> EngineResult<()> {
        self.inner.lock().await.delete(entity, id).await
    }

    pub async fn delete_all(&self, entity: &str, criteria: &Criteria) -> EngineResult<u64> {
        self.inner.lock().await.delete_all(entity, criteria).await
    }

    pub async fn find_all(&self, entity: &str, criteria: &Criteria) -> EngineResult<Vec<FieldMap>> {
        self.inner.lock().await.find_all(entity, criteria).await
    }

    pub async fn count(&self, entity: &str, criteria: &Criteria) -> EngineResult<u64> {
        self.inner.lock().await.count(entity, criteria).await
    }

    pub async fn refresh(&self, entity: &str, id: &Value) -> EngineResult<FieldMap> {
        self.inner.lock().await.refresh(entity, id).await
    }

    pub async fn evict(&self, entity: &str, id: &Value) -> EngineResult<()> {
        self.inner.lock().await.evict(entity, id).await
    }

    pub async fn flush(&self) -> EngineResult<()> {
        self.inner.lock().await.flush().await
    }

    pub async fn clear(&self) -> EngineResult<()> {
        self.inner.lock().await.clear().await
    }

    pub async fn close(&self) -> EngineResult<()> {
        self.inner.lock().await.close().await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("factory_id", &self.factory_id)
            .field("connection_id", &self.connection_id)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Clonable handle to a stateless engine session
#[derive(Clone)]
pub struct StatelessHandle {
    inner: Arc<tokio::sync::Mutex<Box<dyn StatelessSession>>>,
    session_id: Uuid,
}

impl StatelessHandle {
    pub fn new(session: Box<dyn StatelessSession>) -> Self {
        let session_id = session.session_id();
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(session)),
            session_id,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn get(&self, entity: &str, id: &Value) -> EngineResult<Option<FieldMap>> {
        self.inner.lock().await.get(entity, id).await
    }

    pub async fn insert(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.insert(entity, fields).await
    }

    pub async fn update(&self, entity: &str, fields: FieldMap) -> EngineResult<()> {
        self.inner.lock().await.update(entity, fields).await
    }

    pub async fn delete(&self, entity: &str, id: &Value) -> EngineResult<()> {
        self.inner.lock().await.delete(entity, id).await
    }

    pub async fn close(&self) -> EngineResult<()> {
        self.inner.lock().await.close().await
    }
}
