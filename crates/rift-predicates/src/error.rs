//! Error types for predicate evaluation.

/// Errors raised while parsing, validating or evaluating predicates.
///
/// `Validation` is the caller's fault (a malformed predicate or a predicate
/// used against a body it cannot handle) and maps to a 4xx response at the
/// API layer. `Injection` means an injected script failed at runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PredicateError {
    #[error("{message}")]
    Validation {
        message: String,
        /// The offending predicate node, when there is one
        node: Option<serde_json::Value>,
    },
    #[error("{message}: {details}")]
    Injection {
        message: String,
        /// The script that was executed
        script: String,
        /// Message from the underlying script engine
        details: String,
    },
    #[error("Invalid engine configuration: {0}")]
    Config(String),
}

impl PredicateError {
    /// Validation error without an attached node.
    pub fn validation(message: impl Into<String>) -> Self {
        PredicateError::Validation {
            message: message.into(),
            node: None,
        }
    }

    /// Validation error carrying the predicate node that caused it.
    pub fn validation_with_node(message: impl Into<String>, node: serde_json::Value) -> Self {
        PredicateError::Validation {
            message: message.into(),
            node: Some(node),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PredicateError::Validation { .. })
    }

    pub fn is_injection(&self) -> bool {
        matches!(self, PredicateError::Injection { .. })
    }
}

pub type Result<T, E = PredicateError> = std::result::Result<T, E>;
