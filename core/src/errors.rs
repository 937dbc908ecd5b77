//! Error types for circuit breaker operations

use crate::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// A call was rejected because the circuit does not admit it right now
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit '{circuit}' does not permit further calls ({state})")]
pub struct CallNotPermitted {
    pub circuit: String,
    pub state: CircuitState,
}

/// Errors returned from guarded calls
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Circuit is open, forced open, or out of half-open permits
    #[error(transparent)]
    NotPermitted(#[from] CallNotPermitted),
    /// The call did not finish within the configured time limit
    #[error("Circuit '{circuit}' call timed out after {after:?}")]
    Timeout { circuit: String, after: Duration },
    /// The wrapped operation failed
    #[error("Circuit execution failed: {0}")]
    Execution(E),
}

impl<E> CircuitError<E> {
    /// Whether the circuit refused to run the call
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, CircuitError::NotPermitted(_))
    }

    /// The operation's own error, if that is what failed
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid circuit configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Unknown circuit configuration '{0}'")]
    UnknownConfig(String),
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
