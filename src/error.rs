//! Error types for the generation workflow orchestrator.

use crate::types::{SessionId, StepId, TaskId};
use std::time::Duration;
use thiserror::Error;

/// Storage-related errors (record store and artifact storage)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised by the external generation backend
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Backend rejected the job: {0}")]
    Rejected(String),

    #[error("Backend request failed: {0}")]
    RequestFailed(String),

    #[error("Backend authentication failed: {0}")]
    AuthFailed(String),

    #[error("Backend resource not found: {0}")]
    NotFound(String),

    #[error("Backend rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Caller-facing orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Tree structure violation: {0}")]
    Structural(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Alternative not found for artifact: {0}")]
    AlternativeNotFound(String),

    #[error("Retrieval task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::ConfigError(err.to_string())
    }
}
