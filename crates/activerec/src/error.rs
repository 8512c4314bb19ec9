//! Error types for the active-record layer
//!
//! Provides the error taxonomy for registry, scope, and session operations.
//! Engine failures are wrapped, never silently swallowed; a missing-row
//! signal from the engine is translated into `NotFound` so callers can tell
//! "no such record" apart from infrastructure errors without depending on
//! the engine's own error types.

use crate::engine::EngineError;

/// Result type alias for record operations
pub type RecordResult<T> = Result<T, ActiveRecordError>;

/// Error types for active-record operations
#[derive(Debug, thiserror::Error)]
pub enum ActiveRecordError {
    /// An entity was used before any configuration registered it
    #[error("entity '{entity}' is not configured; register a configuration that maps it first")]
    NotConfigured { entity: String },

    /// A mapping source was contributed by two different configurations
    #[error("mapping source '{mapping_source}' is already registered under configuration '{configuration}'")]
    DuplicateSource {
        mapping_source: String,
        configuration: String,
    },

    /// A scope already holds a session for this factory
    #[error("a session is already registered in this scope for factory {factory}")]
    AlreadyRegistered { factory: String },

    /// A scope was asked for a session it never registered
    #[error("no session is registered in this scope for factory {factory}")]
    NotRegistered { factory: String },

    /// A scope-dependent call was made with no active scope
    #[error("no session scope is active on this context")]
    NoActiveScope,

    /// Scope disposal happened out of nesting order
    #[error("scope disposed out of order: an inner scope is still active")]
    ScopeNesting,

    /// The engine reported that the requested record does not exist
    #[error("record not found: {entity}({id})")]
    NotFound { entity: String, id: String },

    /// More than one row matched a single-result query
    #[error("query for '{entity}' matched more than one record")]
    AmbiguousResult { entity: String },

    /// A record without a primary key was handed to a key-addressed operation
    #[error("record of '{entity}' has no primary key value")]
    MissingKey { entity: String },

    /// Record/field conversion failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or inconsistent configuration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The process-wide runtime was used before `initialize`
    #[error("active-record runtime is not initialized")]
    NotInitialized,

    /// Engine failure outside an execute helper
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Any other failure raised while executing an operation against a session
    #[error("operation failed for entity '{entity}': {source}")]
    Operation {
        entity: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ActiveRecordError {
    /// True when the error is the recoverable missing-record signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, ActiveRecordError::NotFound { .. })
    }

    /// Translate an error raised inside an execute helper.
    ///
    /// The engine's missing-row signal becomes `NotFound`; errors of this
    /// crate pass through unchanged; everything else is wrapped in a single
    /// uniform `Operation` error carrying the original cause.
    pub(crate) fn from_operation(entity: &str, err: anyhow::Error) -> Self {
        let err = match err.downcast::<ActiveRecordError>() {
            Ok(ar_err) => return ar_err,
            Err(err) => err,
        };
        match err.downcast::<EngineError>() {
            Ok(EngineError::NotFound { entity, id }) => ActiveRecordError::NotFound { entity, id },
            Ok(engine_err) => ActiveRecordError::Operation {
                entity: entity.to_string(),
                source: engine_err.into(),
            },
            Err(other) => ActiveRecordError::Operation {
                entity: entity.to_string(),
                source: other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_translation() {
        let engine_err = EngineError::NotFound {
            entity: "user".to_string(),
            id: "42".to_string(),
        };
        let err = ActiveRecordError::from_operation("user", engine_err.into());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_engine_errors_become_operation() {
        let engine_err = EngineError::Backend("disk full".to_string());
        let err = ActiveRecordError::from_operation("user", engine_err.into());
        assert!(matches!(err, ActiveRecordError::Operation { .. }));
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_crate_errors_pass_through() {
        let inner = ActiveRecordError::AmbiguousResult {
            entity: "user".to_string(),
        };
        let err = ActiveRecordError::from_operation("user", inner.into());
        assert!(matches!(err, ActiveRecordError::AmbiguousResult { .. }));
    }
}
