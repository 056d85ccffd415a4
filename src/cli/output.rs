//! CLI output: error mapping from orchestrator errors to stable CLI surface.

use crate::error::OrchestratorError;

/// Map orchestrator errors to a string for CLI output.
pub fn map_error(e: &OrchestratorError) -> String {
    match e {
        OrchestratorError::Validation(msg) => format!("invalid input: {}", msg),
        OrchestratorError::Structural(msg) => format!("tree violation: {}", msg),
        OrchestratorError::Conflict(msg) => format!("conflict: {}", msg),
        other => other.to_string(),
    }
}
