//! Backend Gateway
//!
//! The external image-generation backend, consumed as a capability: submit a
//! job, poll its status, list recently produced artifacts, and fetch artifact
//! bytes or metadata. The backend offers no reliable job→artifact index, so
//! the orchestrator correlates results itself (see `workflow::correlation`).

use crate::error::GatewayError;
use crate::model::Parameters;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

pub mod http;

pub use http::HttpGateway;

/// Outbound generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Prompt text, already carrying the correlation marker
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub model: String,
    pub parameters: Parameters,
    /// Correlation token, also sent as request metadata
    pub correlation_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Result artifact ids, when the backend reports them
    #[serde(default)]
    pub result_refs: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            result_refs: None,
            error: None,
        }
    }

    pub fn done(result_refs: Option<Vec<String>>) -> Self {
        Self {
            state: JobState::Done,
            result_refs,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result_refs: None,
            error: Some(error.into()),
        }
    }
}

/// Lightweight artifact metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_ref: String,
    pub created_at_ms: u64,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Generation backend client trait
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Submit a job, returning the backend job id
    async fn submit(&self, request: &JobRequest) -> Result<String, GatewayError>;

    /// Current state of a job
    async fn status(&self, job_id: &str) -> Result<JobStatus, GatewayError>;

    /// Most recently produced artifact ids, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<String>, GatewayError>;

    async fn metadata(&self, artifact_ref: &str) -> Result<ArtifactMetadata, GatewayError>;

    async fn fetch(&self, artifact_ref: &str) -> Result<Vec<u8>, GatewayError>;
}

/// Bound a single gateway call by `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
