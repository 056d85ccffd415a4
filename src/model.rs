//! Entity records owned by the orchestrator.
//!
//! Every record maps to one durable row in the record store. Steps form an
//! arena-style forest: children refer to their parent by id, never by pointer.

use crate::artifacts::ArtifactHandle;
use crate::types::{Priority, SessionId, StepId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form generation parameters (model reference, size, sampler, ...)
pub type Parameters = BTreeMap<String, Value>;

/// Parameter key holding the model reference
pub const PARAM_MODEL: &str = "model";

/// Parameter key holding the number of images per job
pub const PARAM_BATCH_SIZE: &str = "batch_size";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOrigin {
    Fresh,
    Derived { source_artifact_id: String },
}

impl SessionOrigin {
    pub fn source_artifact_id(&self) -> Option<&str> {
        match self {
            SessionOrigin::Fresh => None,
            SessionOrigin::Derived { source_artifact_id } => Some(source_artifact_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub origin: SessionOrigin,
    pub status: SessionStatus,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

/// Lifecycle of a single generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Submitting,
    Submitted,
    Monitoring,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Created => "created",
            StepStatus::Submitting => "submitting",
            StepStatus::Submitted => "submitted",
            StepStatus::Monitoring => "monitoring",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    /// Steps the monitor sweep has to look at (including submissions in flight).
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            StepStatus::Submitting | StepStatus::Submitted | StepStatus::Monitoring
        )
    }

    /// Transitions move forward only; `failed` is reachable from any
    /// non-terminal state. Terminal states accept nothing.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) => true,
            (Created, Submitting) => true,
            (Submitting, Submitted) => true,
            (Submitted, Monitoring) => true,
            (Monitoring, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    SubmissionError,
    BackendJobError,
    Timeout,
    Cancelled,
}

impl StepErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepErrorKind::SubmissionError => "submission_error",
            StepErrorKind::BackendJobError => "backend_job_error",
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-step polling schedule, persisted so monitoring survives restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    pub next_poll_at_ms: u64,
    pub interval_ms: u64,
    pub deadline_at_ms: u64,
    pub polls: u32,
}

/// Backend success seen while artifact resolution is still outstanding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedDone {
    pub observed_at_ms: u64,
    pub result_refs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub session_id: SessionId,
    pub parent_step_id: Option<StepId>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub parameters: Parameters,
    pub sibling_position: u32,
    pub correlation_token: String,
    pub backend_job_id: Option<String>,
    pub expected_artifact_count: u32,
    pub status: StepStatus,
    pub error: Option<StepError>,
    pub ambiguous_correlation: bool,
    /// Artifact this step was branched from, if any
    #[serde(default)]
    pub branched_from: Option<String>,
    #[serde(default)]
    pub monitor: Option<MonitorState>,
    #[serde(default)]
    pub reported_done: Option<ReportedDone>,
    pub created_at_ms: u64,
    pub submitted_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
}

impl StepRecord {
    pub fn model(&self) -> Option<&str> {
        self.parameters.get(PARAM_MODEL).and_then(Value::as_str)
    }
}

/// Which correlation tier claimed an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationTier {
    Direct,
    Token,
    Recency,
}

impl CorrelationTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationTier::Direct => "direct",
            CorrelationTier::Token => "token",
            CorrelationTier::Recency => "recency",
        }
    }
}

/// Link between a step and one produced artifact.
///
/// Keyed by the backend-native artifact id, which is unique system-wide.
/// `storage_handle` stays `None` until the retrieval task completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeRecord {
    pub artifact_ref: String,
    pub step_id: StepId,
    pub task_id: TaskId,
    pub position: u32,
    pub selected: bool,
    pub tier: CorrelationTier,
    pub storage_handle: Option<ArtifactHandle>,
    pub created_at_ms: u64,
}

impl AlternativeRecord {
    pub fn is_realized(&self) -> bool {
        self.storage_handle.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTaskRecord {
    pub task_id: TaskId,
    pub artifact_ref: String,
    pub step_id: StepId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_attempt_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub priority: Priority,
    pub handle: Option<ArtifactHandle>,
    pub created_at_ms: u64,
}

impl RetrievalTaskRecord {
    /// Reference time for "longest waiting first" ordering
    pub fn waiting_since_ms(&self) -> u64 {
        self.last_attempt_at_ms.unwrap_or(self.created_at_ms)
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}
