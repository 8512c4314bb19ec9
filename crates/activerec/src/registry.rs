//! Entity Registry
//!
//! Maps entity names to their owning configuration and to the lazily-built
//! session factory derived from it. Registration happens at startup;
//! factory construction is expensive and is serialized behind a single
//! build lock so concurrent first-accesses for entities sharing one
//! configuration never build twice.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::engine::core::{Configuration, EntityBinding, SessionFactory};
use crate::error::{ActiveRecordError, RecordResult};
use crate::events::{ListenerKind, ListenerRegistry, RecordListener};

/// One registered configuration and its factory slot
struct ConfigSlot {
    config: Arc<dyn Configuration>,
    factory: Option<Arc<dyn SessionFactory>>,
}

#[derive(Default)]
struct RegistryInner {
    configurations: Vec<ConfigSlot>,
    /// entity name -> configuration index
    entities: HashMap<String, usize>,
    /// entity name -> declared ancestor chain, nearest first
    ancestors: HashMap<String, Vec<String>>,
    /// mapping source -> configuration index
    sources: HashMap<String, usize>,
}

impl RegistryInner {
    /// Exact lookup, then walk a name's declared ancestor chain
    fn resolve_name(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.entities.get(name) {
            return Some(*index);
        }
        if let Some(chain) = self.ancestors.get(name) {
            for ancestor in chain {
                if let Some(index) = self.entities.get(ancestor) {
                    return Some(*index);
                }
            }
        }
        None
    }

    fn resolve_lineage(&self, lineage: &[&str]) -> Option<usize> {
        lineage.iter().find_map(|name| self.resolve_name(name))
    }
}

/// Process-wide (but injectable) registry of entities, configurations, and
/// session factories. Reads are concurrent; registration and factory
/// construction are serialized.
pub struct EntityRegistry {
    inner: RwLock<RegistryInner>,
    /// Serializes factory construction across all configurations; factory
    /// builds are a one-time cost, so one global lock is enough.
    build_lock: tokio::sync::Mutex<()>,
    listeners: ListenerRegistry,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            build_lock: tokio::sync::Mutex::new(()),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Register a configuration and every entity it declares.
    ///
    /// A mapping source may only ever belong to one configuration; a second
    /// registration of the same source under a different configuration
    /// fails and leaves the registry untouched.
    pub fn register(&self, config: Arc<dyn Configuration>) -> RecordResult<()> {
        let mut inner = self.inner.write().unwrap();
        let index = inner.configurations.len();

        for source in config.mapping_sources() {
            if let Some(owner) = inner.sources.get(&source) {
                let owner_name = inner.configurations[*owner].config.name().to_string();
                if owner_name != config.name() {
                    return Err(ActiveRecordError::DuplicateSource {
                        mapping_source: source,
                        configuration: owner_name,
                    });
                }
            }
        }

        let bindings = config.declared_entities();
        tracing::debug!(
            configuration = %config.name(),
            entities = bindings.len(),
            "Registering configuration"
        );
        for source in config.mapping_sources() {
            inner.sources.insert(source, index);
        }
        for EntityBinding { name, ancestors, .. } in bindings {
            inner.entities.insert(name.clone(), index);
            if !ancestors.is_empty() {
                inner.ancestors.insert(name, ancestors);
            }
        }
        inner.configurations.push(ConfigSlot {
            config,
            factory: None,
        });
        Ok(())
    }

    /// Register a listener for a configuration; it is wired into the
    /// engine when that configuration's factory is built.
    pub fn register_listener(
        &self,
        kind: ListenerKind,
        listener: Arc<dyn RecordListener>,
        configuration: &str,
    ) {
        self.listeners.register(kind, listener, configuration);
    }

    /// Resolve the configuration owning an entity.
    ///
    /// `lineage` is the entity name followed by its mapped base entities,
    /// nearest first; the first name the registry knows wins.
    pub fn resolve(&self, lineage: &[&str]) -> RecordResult<Arc<dyn Configuration>> {
        let inner = self.inner.read().unwrap();
        match inner.resolve_lineage(lineage) {
            Some(index) => Ok(Arc::clone(&inner.configurations[index].config)),
            None => Err(not_configured(lineage)),
        }
    }

    /// The mapped entity name operations should address for a lineage:
    /// the first name a configuration actually maps, falling back through
    /// declared ancestors.
    pub fn storage_entity(&self, lineage: &[&str]) -> RecordResult<String> {
        let inner = self.inner.read().unwrap();
        for name in lineage {
            if inner.entities.contains_key(*name) {
                return Ok((*name).to_string());
            }
            if let Some(chain) = inner.ancestors.get(*name) {
                for ancestor in chain {
                    if inner.entities.contains_key(ancestor) {
                        return Ok(ancestor.clone());
                    }
                }
            }
        }
        Err(not_configured(lineage))
    }

    /// True when some registered configuration maps the entity
    pub fn is_registered(&self, entity: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.resolve_name(entity).is_some()
    }

    /// Names of every registered configuration, in registration order
    pub fn configuration_names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .configurations
            .iter()
            .map(|slot| slot.config.name().to_string())
            .collect()
    }

    /// Every entity name currently registered
    pub fn registered_entities(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner.entities.keys().cloned().collect();
        names.sort();
        names
    }

    /// The session factory for an entity, building it on first access.
    ///
    /// Construction is double-checked: a fast read path returns the cached
    /// factory, and builders re-check under the build lock so concurrent
    /// first-accesses collapse into a single build. The built factory is
    /// cached under every entity it reports as mapped, not just the one
    /// that was asked for.
    pub async fn session_factory(
        &self,
        lineage: &[&str],
    ) -> RecordResult<Arc<dyn SessionFactory>> {
        {
            let inner = self.inner.read().unwrap();
            let index = inner
                .resolve_lineage(lineage)
                .ok_or_else(|| not_configured(lineage))?;
            if let Some(factory) = &inner.configurations[index].factory {
                return Ok(Arc::clone(factory));
            }
        }

        let _build = self.build_lock.lock().await;

        // Another caller may have built while we waited for the lock
        let (index, config) = {
            let inner = self.inner.read().unwrap();
            let index = inner
                .resolve_lineage(lineage)
                .ok_or_else(|| not_configured(lineage))?;
            if let Some(factory) = &inner.configurations[index].factory {
                return Ok(Arc::clone(factory));
            }
            (index, Arc::clone(&inner.configurations[index].config))
        };

        let listeners = self.listeners.for_configuration(config.name());
        let factory = config.build_session_factory(listeners).await?;
        tracing::debug!(
            configuration = %config.name(),
            factory = %factory.factory_id(),
            "Session factory built"
        );

        let mut inner = self.inner.write().unwrap();
        for entity in factory.mapped_entities() {
            inner.entities.entry(entity).or_insert(index);
        }
        inner.configurations[index].factory = Some(Arc::clone(&factory));
        Ok(factory)
    }

    /// Drop every configuration, factory, and entity entry.
    ///
    /// Intended for test isolation; live sessions opened from the old
    /// factories are unaffected.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = RegistryInner::default();
    }
}

fn not_configured(lineage: &[&str]) -> ActiveRecordError {
    ActiveRecordError::NotConfigured {
        entity: lineage.first().copied().unwrap_or("<unknown>").to_string(),
    }
}
