//! Session Factory Holder
//!
//! The orchestrator between the entity registry and the scope stack. For
//! every unit of work it resolves the entity's session factory, then either
//! hands out the active scope's cached session, opens one through the scope
//! so the scope owns its lifecycle, or opens a standalone session the
//! caller must release. The execute helpers wrap all of that in
//! acquire/run/cleanup with uniform error translation.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{ActiveRecordError, RecordResult};
use crate::registry::EntityRegistry;
use crate::scope::{FlushPolicy, ScopeStack};
use crate::session::{SessionHandle, StatelessHandle};

/// Resolves factories and multiplexes session acquisition between scoped
/// and standalone use
pub struct SessionHolder {
    registry: Arc<EntityRegistry>,
}

impl SessionHolder {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Obtain a session for an entity.
    ///
    /// With no active scope the caller owns the returned session and must
    /// release it exactly once. Under a scope, the session is cached on the
    /// scope (or borrowed from an ancestor) and the scope owns disposal.
    pub async fn create_session(
        &self,
        stack: &ScopeStack,
        lineage: &[&str],
    ) -> RecordResult<SessionHandle> {
        let factory = self.registry.session_factory(lineage).await?;
        let factory_id = factory.factory_id();

        if !stack.has_active_scope() {
            let session = factory.open_session(None).await?;
            let handle = SessionHandle::new(session, factory_id);
            debug!(session_id = %handle.session_id(), "Opened standalone session");
            return Ok(handle);
        }

        let scope = stack.active_scope()?;
        if scope.is_known(factory_id) {
            return scope.get_session(factory_id);
        }

        // A nested scope reuses an ancestor's session for this factory
        // rather than opening a second connection
        if !scope.wants_to_create_session(factory_id) {
            let existing = scope
                .ancestor_session(factory_id)
                .ok_or(ActiveRecordError::NotRegistered {
                    factory: factory_id.to_string(),
                })?;
            scope.adopt_session(factory_id, existing.clone())?;
            debug!(session_id = %existing.session_id(), "Adopted ancestor session into scope");
            return Ok(existing);
        }

        let session = factory.open_session(Some(scope.interceptor())).await?;
        let handle = SessionHandle::new(session, factory_id);
        scope.register_session(factory_id, handle.clone())?;
        debug!(session_id = %handle.session_id(), "Opened session into scope");
        Ok(handle)
    }

    /// Release a session obtained from `create_session`.
    ///
    /// A no-op while a scope is active (the scope owns the lifecycle);
    /// otherwise the session is flushed and closed immediately.
    pub async fn release_session(
        &self,
        stack: &ScopeStack,
        handle: &SessionHandle,
    ) -> RecordResult<()> {
        if stack.has_active_scope() {
            debug!(session_id = %handle.session_id(), "Release deferred to active scope");
            return Ok(());
        }
        handle.flush().await?;
        handle.close().await?;
        Ok(())
    }

    /// Mark a session failed.
    ///
    /// Under a scope this delegates to the scope; standalone sessions have
    /// their pending changes cleared in place and remain the caller's to
    /// release.
    pub async fn fail_session(
        &self,
        stack: &ScopeStack,
        handle: &SessionHandle,
    ) -> RecordResult<()> {
        if let Ok(scope) = stack.active_scope() {
            scope.fail_session(handle);
            return Ok(());
        }
        handle.mark_failed();
        handle.clear().await?;
        Ok(())
    }

    /// Run an operation against a session for `lineage[0]`.
    ///
    /// Acquires a session per the scope rules, runs the closure, and
    /// guarantees cleanup on every exit path. The engine's missing-row
    /// signal surfaces as the crate's `NotFound`; any other failure is
    /// wrapped once in a uniform operation error and the session is marked
    /// failed (scoped) or cleared and closed (standalone).
    pub async fn execute<R, F, Fut>(
        &self,
        stack: &ScopeStack,
        lineage: &[&str],
        op: F,
    ) -> RecordResult<R>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
    {
        let entity = lineage.first().copied().unwrap_or("<unknown>");
        let handle = self.create_session(stack, lineage).await?;
        let scoped = stack.has_active_scope();
        let auto_flush = scoped
            && stack.active_scope()?.policy() == FlushPolicy::Auto
            && !handle.is_failed();

        if auto_flush {
            if let Err(err) = handle.flush().await {
                self.fail_session(stack, &handle).await.ok();
                return Err(ActiveRecordError::from_operation(entity, err.into()));
            }
        }

        match op(handle.clone()).await {
            Ok(value) => {
                if auto_flush {
                    if let Err(err) = handle.flush().await {
                        self.fail_session(stack, &handle).await.ok();
                        return Err(ActiveRecordError::from_operation(entity, err.into()));
                    }
                }
                if !scoped {
                    if let Err(err) = handle.flush().await {
                        if let Err(cleanup) = handle.clear().await {
                            error!(%cleanup, "Failed to clear standalone session after flush error");
                        }
                        if let Err(cleanup) = handle.close().await {
                            error!(%cleanup, "Failed to close standalone session after flush error");
                        }
                        return Err(ActiveRecordError::from_operation(entity, err.into()));
                    }
                    if let Err(cleanup) = handle.close().await {
                        error!(%cleanup, "Failed to close standalone session");
                    }
                }
                Ok(value)
            }
            Err(err) => {
                if scoped {
                    self.fail_session(stack, &handle).await.ok();
                } else {
                    if let Err(cleanup) = handle.clear().await {
                        error!(%cleanup, "Failed to clear standalone session after error");
                    }
                    if let Err(cleanup) = handle.close().await {
                        error!(%cleanup, "Failed to close standalone session after error");
                    }
                }
                Err(ActiveRecordError::from_operation(entity, err))
            }
        }
    }

    /// Run an operation against a stateless session.
    ///
    /// Stateless sessions are never scoped; the holder opens one, runs the
    /// closure, and closes it on every exit path.
    pub async fn execute_stateless<R, F, Fut>(
        &self,
        lineage: &[&str],
        op: F,
    ) -> RecordResult<R>
    where
        F: FnOnce(StatelessHandle) -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
    {
        let entity = lineage.first().copied().unwrap_or("<unknown>");
        let factory = self.registry.session_factory(lineage).await?;
        let handle = StatelessHandle::new(factory.open_stateless_session().await?);

        let result = op(handle.clone()).await;
        if let Err(cleanup) = handle.close().await {
            error!(%cleanup, "Failed to close stateless session");
        }
        result.map_err(|err| ActiveRecordError::from_operation(entity, err))
    }
}
