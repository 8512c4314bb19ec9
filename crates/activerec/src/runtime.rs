//! Runtime Facade and Process Lifecycle
//!
//! `ActiveRecord` bundles the entity registry, the session holder, and one
//! scope stack into an injectable handle. Clones share everything, so a
//! clone is the same logical context; `detached()` keeps the registry but
//! takes a fresh scope stack for work on another task or thread.
//!
//! The module-level `initialize`/`global`/`reset_initialization` functions
//! manage an optional process-wide instance for applications that want the
//! classic static surface; tests and libraries can ignore them and build
//! isolated instances directly.

use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::config::{ActiveRecordConfig, EngineFactories};
use crate::engine::core::Configuration;
use crate::error::{ActiveRecordError, RecordResult};
use crate::events::{ListenerKind, RecordListener};
use crate::holder::SessionHolder;
use crate::registry::EntityRegistry;
use crate::scope::{FlushPolicy, ScopeGuard, ScopeStack};
use crate::session::{SessionHandle, StatelessHandle};

/// Handle to the active-record layer: registry, holder, and the scope
/// stack of one logical context
#[derive(Clone)]
pub struct ActiveRecord {
    registry: Arc<EntityRegistry>,
    holder: Arc<SessionHolder>,
    scopes: ScopeStack,
    default_policy: FlushPolicy,
}

impl ActiveRecord {
    /// Build an instance from declarative configuration using the default
    /// engine constructors
    pub fn new(config: ActiveRecordConfig) -> RecordResult<Self> {
        Self::with_factories(config, &EngineFactories::default())
    }

    /// Build an instance from declarative configuration and an explicit
    /// engine-constructor registry
    pub fn with_factories(
        config: ActiveRecordConfig,
        factories: &EngineFactories,
    ) -> RecordResult<Self> {
        config.validate()?;
        let ar = Self::with_registry(Arc::new(EntityRegistry::new()))
            .default_flush_policy(config.flush_policy);
        for def in &config.configurations {
            ar.registry.register(factories.build(def)?)?;
        }
        Ok(ar)
    }

    /// Wrap an existing registry; useful for tests that assemble their own
    pub fn with_registry(registry: Arc<EntityRegistry>) -> Self {
        let holder = Arc::new(SessionHolder::new(Arc::clone(&registry)));
        Self {
            registry,
            holder,
            scopes: ScopeStack::new(),
            default_policy: FlushPolicy::default(),
        }
    }

    fn default_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn holder(&self) -> &SessionHolder {
        &self.holder
    }

    pub fn scopes(&self) -> &ScopeStack {
        &self.scopes
    }

    /// Register an additional engine configuration
    pub fn register(&self, config: Arc<dyn Configuration>) -> RecordResult<()> {
        self.registry.register(config)
    }

    /// Register a record listener for a configuration
    pub fn register_listener(
        &self,
        kind: ListenerKind,
        listener: Arc<dyn RecordListener>,
        configuration: &str,
    ) {
        self.registry.register_listener(kind, listener, configuration);
    }

    /// Same registry and factories, fresh scope stack: the handle for an
    /// independent logical context
    pub fn detached(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            holder: Arc::clone(&self.holder),
            scopes: ScopeStack::new(),
            default_policy: self.default_policy,
        }
    }

    /// Enter a scope with the configured default flush policy
    pub fn begin_scope(&self) -> ScopeGuard {
        ScopeGuard::enter(&self.scopes, self.default_policy)
    }

    /// Enter a scope with an explicit flush policy
    pub fn begin_scope_with(&self, policy: FlushPolicy) -> ScopeGuard {
        ScopeGuard::enter(&self.scopes, policy)
    }

    pub fn has_active_scope(&self) -> bool {
        self.scopes.has_active_scope()
    }

    /// Obtain a session for an entity per the scope rules; see the holder
    pub async fn session(&self, entity: &str) -> RecordResult<SessionHandle> {
        self.holder.create_session(&self.scopes, &[entity]).await
    }

    /// Release a session obtained from `session`
    pub async fn release(&self, handle: &SessionHandle) -> RecordResult<()> {
        self.holder.release_session(&self.scopes, handle).await
    }

    /// Mark a session failed
    pub async fn fail(&self, handle: &SessionHandle) -> RecordResult<()> {
        self.holder.fail_session(&self.scopes, handle).await
    }

    /// Escape hatch: run a closure against a session for `entity`
    pub async fn execute<R, F, Fut>(&self, entity: &str, op: F) -> RecordResult<R>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
    {
        self.holder.execute(&self.scopes, &[entity], op).await
    }

    /// Escape hatch: run a closure against a stateless session
    pub async fn execute_stateless<R, F, Fut>(&self, entity: &str, op: F) -> RecordResult<R>
    where
        F: FnOnce(StatelessHandle) -> Fut,
        Fut: Future<Output = Result<R, anyhow::Error>>,
    {
        self.holder.execute_stateless(&[entity], op).await
    }
}

static GLOBAL: Lazy<RwLock<Option<ActiveRecord>>> = Lazy::new(|| RwLock::new(None));

/// Initialize the process-wide instance.
///
/// The first call wins and builds the runtime; subsequent calls only add
/// configurations that are not yet registered and otherwise leave the
/// existing runtime untouched. Returns a handle to the instance either
/// way.
pub fn initialize(config: ActiveRecordConfig) -> RecordResult<ActiveRecord> {
    let mut slot = GLOBAL.write().unwrap();
    if let Some(existing) = slot.as_ref() {
        config.validate()?;
        let known = existing.registry.configuration_names();
        let factories = EngineFactories::default();
        for def in &config.configurations {
            if !known.contains(&def.name) {
                existing.registry.register(factories.build(def)?)?;
            }
        }
        return Ok(existing.clone());
    }

    let ar = ActiveRecord::new(config)?;
    debug!("Active-record runtime initialized");
    *slot = Some(ar.clone());
    Ok(ar)
}

/// True when `initialize` has installed a process-wide instance
pub fn initialized() -> bool {
    GLOBAL.read().unwrap().is_some()
}

/// The process-wide instance installed by `initialize`.
///
/// The returned handle shares the root scope stack; call `detached()` on
/// it for work on an independent task or thread.
pub fn global() -> RecordResult<ActiveRecord> {
    GLOBAL
        .read()
        .unwrap()
        .clone()
        .ok_or(ActiveRecordError::NotInitialized)
}

/// Tear down the process-wide instance. Test-only: live handles keep
/// working against the old registry, but `global` starts failing until the
/// next `initialize`.
pub fn reset_initialization() {
    let mut slot = GLOBAL.write().unwrap();
    if slot.take().is_some() {
        debug!("Active-record runtime reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationDef;
    use crate::engine::core::EntityBinding;
    use serial_test::serial;

    fn sample_config() -> ActiveRecordConfig {
        ActiveRecordConfig::new().with_configuration(
            ConfigurationDef::new("main")
                .with_source("main-src")
                .with_entity(EntityBinding::new("user")),
        )
    }

    #[test]
    #[serial]
    fn test_first_initialize_wins() {
        reset_initialization();
        assert!(!initialized());

        let first = initialize(sample_config()).unwrap();
        assert!(initialized());

        // A second call adds nothing new and returns the same runtime
        let second = initialize(sample_config()).unwrap();
        assert!(Arc::ptr_eq(first.registry(), second.registry()));
        assert_eq!(first.registry().configuration_names().len(), 1);

        reset_initialization();
        assert!(global().is_err());
    }

    #[test]
    #[serial]
    fn test_later_initialize_adds_configurations() {
        reset_initialization();
        initialize(sample_config()).unwrap();

        let more = ActiveRecordConfig::new().with_configuration(
            ConfigurationDef::new("billing")
                .with_source("billing-src")
                .with_entity(EntityBinding::new("invoice")),
        );
        let ar = initialize(more).unwrap();
        assert!(ar.registry().is_registered("user"));
        assert!(ar.registry().is_registered("invoice"));

        reset_initialization();
    }

    #[tokio::test]
    async fn test_detached_contexts_have_independent_scopes() {
        let ar = ActiveRecord::new(sample_config()).unwrap();
        let other = ar.detached();

        let guard = ar.begin_scope();
        assert!(ar.has_active_scope());
        assert!(!other.has_active_scope());
        guard.complete().await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_the_context() {
        let ar = ActiveRecord::new(sample_config()).unwrap();
        let clone = ar.clone();

        let guard = ar.begin_scope();
        assert!(clone.has_active_scope());
        guard.complete().await.unwrap();
    }
}
