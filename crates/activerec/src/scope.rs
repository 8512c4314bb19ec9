//! Session Scopes
//!
//! A scope is a nestable unit of work that owns at most one session per
//! session factory and decides when those sessions flush. Scope state is
//! an explicit per-context value (`ScopeStack`), not ambient thread-local
//! storage, so independent logical contexts never see each other's scopes.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::core::{FactoryId, SessionInterceptor};
use crate::error::{ActiveRecordError, RecordResult};
use crate::session::SessionHandle;

/// When a scope's sessions synchronize with backing storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushPolicy {
    /// Flush around every operation and again at disposal
    #[default]
    Auto,
    /// Flush only when the scope is disposed
    Leave,
    /// Never flush outside an explicit transaction boundary
    Transactional,
}

/// One session owned (or borrowed from an ancestor) by a scope
struct ScopeEntry {
    factory: FactoryId,
    handle: SessionHandle,
    /// Borrowed entries belong to an ancestor scope; disposal leaves them
    /// alone.
    owned: bool,
}

/// Records the sessions a scope opened through itself
#[derive(Default)]
struct ScopeWatcher {
    opened: Mutex<Vec<Uuid>>,
}

impl SessionInterceptor for ScopeWatcher {
    fn session_opened(&self, session_id: Uuid) {
        self.opened.lock().unwrap().push(session_id);
        debug!(%session_id, "Session opened through scope");
    }
}

/// A nestable unit of work owning factory-keyed sessions
pub struct SessionScope {
    policy: FlushPolicy,
    parent: Option<Arc<SessionScope>>,
    sessions: Mutex<Vec<ScopeEntry>>,
    watcher: Arc<ScopeWatcher>,
}

impl SessionScope {
    /// Create a root scope
    pub fn root(policy: FlushPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            parent: None,
            sessions: Mutex::new(Vec::new()),
            watcher: Arc::new(ScopeWatcher::default()),
        })
    }

    /// Create a scope nested inside `parent`
    pub fn nested(parent: Arc<SessionScope>, policy: FlushPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            parent: Some(parent),
            sessions: Mutex::new(Vec::new()),
            watcher: Arc::new(ScopeWatcher::default()),
        })
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// The interceptor handed to the factory when this scope opens a
    /// session through itself
    pub fn interceptor(&self) -> Arc<dyn SessionInterceptor> {
        Arc::clone(&self.watcher) as Arc<dyn SessionInterceptor>
    }

    /// Ids of the sessions this scope opened through itself
    pub fn opened_sessions(&self) -> Vec<Uuid> {
        self.watcher.opened.lock().unwrap().clone()
    }

    /// True if this scope holds a session for the factory
    pub fn is_known(&self, factory: FactoryId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.factory == factory)
    }

    /// The cached session for a factory
    pub fn get_session(&self, factory: FactoryId) -> RecordResult<SessionHandle> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.factory == factory)
            .map(|entry| entry.handle.clone())
            .ok_or(ActiveRecordError::NotRegistered {
                factory: factory.to_string(),
            })
    }

    /// Cache a session this scope owns and must dispose
    pub fn register_session(
        &self,
        factory: FactoryId,
        handle: SessionHandle,
    ) -> RecordResult<()> {
        self.register(factory, handle, true)
    }

    /// Cache a session borrowed from an ancestor scope
    pub(crate) fn adopt_session(
        &self,
        factory: FactoryId,
        handle: SessionHandle,
    ) -> RecordResult<()> {
        self.register(factory, handle, false)
    }

    fn register(&self, factory: FactoryId, handle: SessionHandle, owned: bool) -> RecordResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.iter().any(|entry| entry.factory == factory) {
            return Err(ActiveRecordError::AlreadyRegistered {
                factory: factory.to_string(),
            });
        }
        sessions.push(ScopeEntry {
            factory,
            handle,
            owned,
        });
        Ok(())
    }

    /// Walk ancestors for a session covering this factory
    pub fn ancestor_session(&self, factory: FactoryId) -> Option<SessionHandle> {
        let mut current = self.parent.as_ref();
        while let Some(scope) = current {
            if let Ok(handle) = scope.get_session(factory) {
                return Some(handle);
            }
            current = scope.parent.as_ref();
        }
        None
    }

    /// Whether the scope should open its own session for this factory.
    ///
    /// True for a root scope; a nested scope reuses a session an ancestor
    /// already owns rather than opening a second connection, and only
    /// opens its own when no ancestor covers the factory.
    pub fn wants_to_create_session(&self, factory: FactoryId) -> bool {
        self.is_root() || self.ancestor_session(factory).is_none()
    }

    /// Mark a session failed: it will be cleared at disposal, never
    /// flushed, in this scope or any ancestor sharing the handle.
    pub fn fail_session(&self, handle: &SessionHandle) {
        handle.mark_failed();
        debug!(session_id = %handle.session_id(), "Session marked failed");
    }

    /// Flush (per policy) and close every owned session in registration
    /// order. Cleanup is best-effort: every owned session gets a close
    /// attempt even if an earlier one fails, and the first error is
    /// surfaced.
    pub async fn dispose(&self) -> RecordResult<()> {
        let entries: Vec<ScopeEntry> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain(..).collect()
        };

        let mut first_error: Option<ActiveRecordError> = None;
        for entry in entries {
            if !entry.owned {
                debug!(
                    session_id = %entry.handle.session_id(),
                    "Leaving borrowed session to its owning scope"
                );
                continue;
            }

            if entry.handle.is_failed() {
                if let Err(err) = entry.handle.clear().await {
                    error!(session_id = %entry.handle.session_id(), %err, "Failed to clear failed session");
                    first_error.get_or_insert(err.into());
                }
            } else {
                let should_flush = matches!(self.policy, FlushPolicy::Auto | FlushPolicy::Leave);
                if should_flush {
                    if let Err(err) = entry.handle.flush().await {
                        error!(session_id = %entry.handle.session_id(), %err, "Flush failed during scope disposal");
                        first_error.get_or_insert(err.into());
                    }
                }
            }

            if let Err(err) = entry.handle.close().await {
                error!(session_id = %entry.handle.session_id(), %err, "Close failed during scope disposal");
                first_error.get_or_insert(err.into());
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Per-logical-context stack of active scopes.
///
/// Clones share the same stack; use a fresh stack per concurrent context.
/// Only the top scope is active for new work.
#[derive(Clone, Default)]
pub struct ScopeStack {
    scopes: Arc<Mutex<Vec<Arc<SessionScope>>>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active_scope(&self) -> bool {
        !self.scopes.lock().unwrap().is_empty()
    }

    /// The innermost active scope
    pub fn active_scope(&self) -> RecordResult<Arc<SessionScope>> {
        self.scopes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .ok_or(ActiveRecordError::NoActiveScope)
    }

    pub fn depth(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }

    fn push(&self, scope: Arc<SessionScope>) {
        self.scopes.lock().unwrap().push(scope);
    }

    /// Pop `scope`, failing loudly when it is not the innermost one
    fn pop_expected(&self, scope: &Arc<SessionScope>) -> RecordResult<()> {
        let mut scopes = self.scopes.lock().unwrap();
        match scopes.last() {
            Some(top) if Arc::ptr_eq(top, scope) => {
                scopes.pop();
                Ok(())
            }
            _ => Err(ActiveRecordError::ScopeNesting),
        }
    }
}

/// RAII guard for an entered scope.
///
/// Call `complete()` to dispose the scope; dropping the guard without
/// completing it leaves sessions unflushed and unclosed and logs a
/// warning, mirroring a transaction dropped without commit or rollback.
pub struct ScopeGuard {
    scope: Option<Arc<SessionScope>>,
    stack: ScopeStack,
}

impl ScopeGuard {
    /// Enter a new scope on the stack: a root scope when the stack is
    /// empty, otherwise a child of the currently active scope.
    pub fn enter(stack: &ScopeStack, policy: FlushPolicy) -> Self {
        let scope = match stack.scopes.lock().unwrap().last() {
            Some(parent) => SessionScope::nested(Arc::clone(parent), policy),
            None => SessionScope::root(policy),
        };
        debug!(?policy, nested = !scope.is_root(), "Entering session scope");
        stack.push(Arc::clone(&scope));
        Self {
            scope: Some(scope),
            stack: stack.clone(),
        }
    }

    /// The scope this guard controls
    pub fn scope(&self) -> &Arc<SessionScope> {
        self.scope
            .as_ref()
            .expect("scope guard already completed")
    }

    /// Leave the scope: pop it from the stack and dispose its sessions.
    ///
    /// Fails with a nesting error (without disposing anything) when an
    /// inner scope is still active.
    pub async fn complete(mut self) -> RecordResult<()> {
        let scope = self
            .scope
            .take()
            .expect("scope guard already completed");
        self.stack.pop_expected(&scope)?;
        debug!("Leaving session scope");
        scope.dispose().await
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            warn!("Session scope dropped without complete() - owned sessions were not flushed or closed");
            if self.stack.pop_expected(&scope).is_err() {
                error!("Dropped scope was not the innermost active scope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::core::{Configuration, EntityBinding};
    use crate::engine::MemoryConfiguration;
    use crate::events::ListenerSet;

    async fn open_handle(config: &MemoryConfiguration) -> SessionHandle {
        let factory = config
            .build_session_factory(ListenerSet::default())
            .await
            .unwrap();
        let session = factory.open_session(None).await.unwrap();
        SessionHandle::new(session, factory.factory_id())
    }

    fn config() -> MemoryConfiguration {
        MemoryConfiguration::new("test")
            .with_source("test-src")
            .with_entity(EntityBinding::new("user"))
    }

    #[tokio::test]
    async fn test_register_then_get_returns_same_handle() {
        let scope = SessionScope::root(FlushPolicy::Leave);
        let handle = open_handle(&config()).await;
        let factory = handle.factory_id();

        scope.register_session(factory, handle.clone()).unwrap();
        assert!(scope.is_known(factory));
        assert!(scope.get_session(factory).unwrap().same_session(&handle));
    }

    #[tokio::test]
    async fn test_double_register_fails() {
        let scope = SessionScope::root(FlushPolicy::Leave);
        let handle = open_handle(&config()).await;
        let factory = handle.factory_id();

        scope.register_session(factory, handle.clone()).unwrap();
        let err = scope.register_session(factory, handle).unwrap_err();
        assert!(matches!(err, ActiveRecordError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_get_unregistered_fails() {
        let scope = SessionScope::root(FlushPolicy::Leave);
        let err = scope.get_session(FactoryId::new()).unwrap_err();
        assert!(matches!(err, ActiveRecordError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_nested_scope_defers_to_ancestor_session() {
        let handle = open_handle(&config()).await;
        let factory = handle.factory_id();

        let root = SessionScope::root(FlushPolicy::Leave);
        root.register_session(factory, handle.clone()).unwrap();

        let child = SessionScope::nested(Arc::clone(&root), FlushPolicy::Leave);
        assert!(!child.wants_to_create_session(factory));
        assert!(child.ancestor_session(factory).unwrap().same_session(&handle));

        // A factory nobody covers is the child's to open
        assert!(child.wants_to_create_session(FactoryId::new()));
    }

    #[tokio::test]
    async fn test_stack_is_lifo() {
        let stack = ScopeStack::new();
        assert!(!stack.has_active_scope());

        let outer = ScopeGuard::enter(&stack, FlushPolicy::Leave);
        let inner = ScopeGuard::enter(&stack, FlushPolicy::Leave);
        assert_eq!(stack.depth(), 2);
        assert!(Arc::ptr_eq(&stack.active_scope().unwrap(), inner.scope()));

        inner.complete().await.unwrap();
        assert!(Arc::ptr_eq(&stack.active_scope().unwrap(), outer.scope()));
        outer.complete().await.unwrap();
        assert!(!stack.has_active_scope());
    }

    #[tokio::test]
    async fn test_out_of_order_disposal_fails_loudly() {
        let stack = ScopeStack::new();
        let outer = ScopeGuard::enter(&stack, FlushPolicy::Leave);
        let inner = ScopeGuard::enter(&stack, FlushPolicy::Leave);

        let err = outer.complete().await.unwrap_err();
        assert!(matches!(err, ActiveRecordError::ScopeNesting));

        // The inner scope is still intact and can be completed in order
        inner.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_separate_stacks_are_independent() {
        let stack_a = ScopeStack::new();
        let stack_b = ScopeStack::new();

        let guard = ScopeGuard::enter(&stack_a, FlushPolicy::Leave);
        assert!(stack_a.has_active_scope());
        assert!(!stack_b.has_active_scope());
        guard.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_closes_owned_sessions() {
        let config = config();
        let scope = SessionScope::root(FlushPolicy::Leave);
        let handle = open_handle(&config).await;
        scope.register_session(handle.factory_id(), handle.clone()).unwrap();

        scope.dispose().await.unwrap();
        // The session is closed; further operations fail
        assert!(handle.flush().await.is_err());
    }
}
