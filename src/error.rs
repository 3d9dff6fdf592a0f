//! Error taxonomy - every failure in the pipeline maps to one kind.
//!
//! Each variant carries a human-readable message; `kind()` returns the
//! stable machine identifier used in logs and IPC responses.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Model output could not be converted into a valid Command.
    #[error("parse error: {0}")]
    Parse(String),

    /// A plan step failed schema or required-field rules.
    #[error("validation error: {0}")]
    Validation(String),

    /// Path blocked, profile not allowed, or a security check rejected.
    #[error("policy rejection: {0}")]
    Policy(String),

    /// Frozen plan hash mismatch detected before execution.
    #[error("plan integrity violation: {0}")]
    Integrity(String),

    /// A graph rule still failed after auto-repair.
    #[error("graph rule violation: {0}")]
    RuleViolation(String),

    /// The underlying side effect of a node failed.
    #[error("node execution failed: {0}")]
    NodeExecution(String),

    /// Deadline for a node or an IPC call exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The LLM worker is not reachable.
    #[error("worker unavailable: {0}")]
    IpcUnavailable(String),

    /// A reverse action failed; partial rollback is recorded.
    #[error("rollback failed: {0}")]
    Rollback(String),

    /// Any uncaught condition. Surfaces through the state machine as FAILED.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable machine kind for logs, audit entries and IPC error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Parse(_) => "ParseError",
            AgentError::Validation(_) => "ValidationError",
            AgentError::Policy(_) => "PolicyError",
            AgentError::Integrity(_) => "IntegrityError",
            AgentError::RuleViolation(_) => "RuleViolationError",
            AgentError::NodeExecution(_) => "NodeExecutionError",
            AgentError::Timeout(_) => "TimeoutError",
            AgentError::IpcUnavailable(_) => "IPCUnavailableError",
            AgentError::Rollback(_) => "RollbackError",
            AgentError::Internal(_) => "InternalError",
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(AgentError::Policy("x".into()).kind(), "PolicyError");
        assert_eq!(AgentError::Integrity("x".into()).kind(), "IntegrityError");
        assert_eq!(AgentError::Timeout("x".into()).kind(), "TimeoutError");
    }

    #[test]
    fn test_io_error_maps_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AgentError = io.into();
        assert_eq!(err.kind(), "InternalError");
    }
}
