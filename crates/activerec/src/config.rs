//! Layer Configuration
//!
//! Declarative configuration for the active-record layer: a default flush
//! policy, a debug flag, and named engine configurations. Engine kinds map
//! to constructor closures registered up front, so configuration files
//! name a kind instead of activating types by name.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::core::{Configuration, EntityBinding};
use crate::engine::MemoryConfiguration;
use crate::error::{ActiveRecordError, RecordResult};
use crate::scope::FlushPolicy;

/// One named engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationDef {
    /// Configuration name, also the listener-registration key
    pub name: String,
    /// Engine kind; must match a registered constructor
    #[serde(default = "ConfigurationDef::default_engine")]
    pub engine: String,
    /// Mapping sources this configuration contributes
    #[serde(default)]
    pub sources: Vec<String>,
    /// Entities this configuration maps
    #[serde(default)]
    pub entities: Vec<EntityBinding>,
}

impl ConfigurationDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: Self::default_engine(),
            sources: Vec::new(),
            entities: Vec::new(),
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn with_entity(mut self, binding: EntityBinding) -> Self {
        self.entities.push(binding);
        self
    }

    fn default_engine() -> String {
        "memory".to_string()
    }
}

/// Top-level configuration for the layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveRecordConfig {
    /// Flush policy scopes use unless told otherwise
    #[serde(default)]
    pub flush_policy: FlushPolicy,
    /// Enable verbose lifecycle logging
    #[serde(default)]
    pub debug: bool,
    /// Engine configurations to register at startup
    #[serde(default)]
    pub configurations: Vec<ConfigurationDef>,
}

impl ActiveRecordConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_configuration(mut self, def: ConfigurationDef) -> Self {
        self.configurations.push(def);
        self
    }

    /// Load configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> RecordResult<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ActiveRecordError::Config {
            message: format!("invalid YAML configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON document
    pub fn from_json_str(json: &str) -> RecordResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ActiveRecordError::Config {
            message: format!("invalid JSON configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: unique names, no empty configurations
    pub fn validate(&self) -> RecordResult<()> {
        let mut names = HashSet::new();
        for def in &self.configurations {
            if def.name.is_empty() {
                return Err(ActiveRecordError::Config {
                    message: "configuration name must not be empty".to_string(),
                });
            }
            if !names.insert(def.name.as_str()) {
                return Err(ActiveRecordError::Config {
                    message: format!("duplicate configuration name '{}'", def.name),
                });
            }
            if def.entities.is_empty() {
                return Err(ActiveRecordError::Config {
                    message: format!("configuration '{}' maps no entities", def.name),
                });
            }
            let mut entities = HashSet::new();
            for binding in &def.entities {
                if !entities.insert(binding.name.as_str()) {
                    return Err(ActiveRecordError::Config {
                        message: format!(
                            "configuration '{}' maps entity '{}' twice",
                            def.name, binding.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Constructor closure turning a definition into an engine configuration
pub type ConfigurationFactory =
    Arc<dyn Fn(&ConfigurationDef) -> RecordResult<Arc<dyn Configuration>> + Send + Sync>;

/// Registry of engine constructors keyed by engine kind.
///
/// Supplied at configuration time; the default set knows the in-memory
/// engine. Register additional kinds before building configurations.
#[derive(Clone)]
pub struct EngineFactories {
    factories: HashMap<String, ConfigurationFactory>,
}

impl Default for EngineFactories {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("memory", Arc::new(build_memory_configuration));
        registry
    }
}

impl EngineFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for an engine kind, replacing any previous one
    pub fn register(&mut self, kind: impl Into<String>, factory: ConfigurationFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build the engine configuration a definition describes
    pub fn build(&self, def: &ConfigurationDef) -> RecordResult<Arc<dyn Configuration>> {
        let factory = self
            .factories
            .get(&def.engine)
            .ok_or_else(|| ActiveRecordError::Config {
                message: format!(
                    "unknown engine kind '{}' in configuration '{}'",
                    def.engine, def.name
                ),
            })?;
        factory(def)
    }
}

fn build_memory_configuration(def: &ConfigurationDef) -> RecordResult<Arc<dyn Configuration>> {
    let mut config = MemoryConfiguration::new(&def.name);
    for source in &def.sources {
        config = config.with_source(source);
    }
    for binding in &def.entities {
        config = config.with_entity(binding.clone());
    }
    Ok(Arc::new(config))
}
