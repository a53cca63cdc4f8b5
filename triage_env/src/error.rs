//! Error types for the triage environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvError {
    /// The classification backend rejected the request or failed internally
    #[error("Oracle error: {0}")]
    OracleError(String),

    /// The classification backend returned data that could not be interpreted
    #[error("Malformed oracle response: {0}")]
    MalformedResponse(String),

    /// A rule expression failed validation
    #[error("Invalid rule expression: {0}")]
    InvalidRule(String),

    /// A diagnosis code failed validation
    #[error("Invalid code: {0}")]
    InvalidCode(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates an oracle error.
    pub fn oracle(msg: impl Into<String>) -> Self {
        Self::OracleError(msg.into())
    }

    /// Creates an invalid-rule error.
    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        Self::InvalidRule(msg.into())
    }

    /// Returns true if the error came from the oracle side (failure, bad
    /// payload or timeout) rather than from local validation.
    pub fn is_oracle_failure(&self) -> bool {
        matches!(
            self,
            Self::OracleError(_) | Self::MalformedResponse(_) | Self::Timeout(_)
        )
    }
}
