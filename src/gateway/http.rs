//! JSON-over-HTTP backend client
//!
//! Endpoints, relative to `base_url`:
//! - `POST /jobs` → `{"job_id": "..."}`
//! - `GET /jobs/{id}` → [`JobStatus`]
//! - `GET /artifacts?limit=N` → `{"artifacts": ["...", ...]}` newest first
//! - `GET /artifacts/{id}/metadata` → [`ArtifactMetadata`]
//! - `GET /artifacts/{id}` → raw bytes

use crate::config::BackendConfig;
use crate::error::GatewayError;
use crate::gateway::{ArtifactMetadata, BackendGateway, JobRequest, JobStatus};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct RecentArtifactsResponse {
    artifacts: Vec<String>,
}

pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(config: &BackendConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| GatewayError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(map_http_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl BackendGateway for HttpGateway {
    async fn submit(&self, request: &JobRequest) -> Result<String, GatewayError> {
        let builder = self
            .client
            .post(self.url("/jobs"))
            .header("X-Correlation-Token", &request.correlation_token)
            .json(request);
        let response = self.send(builder).await.map_err(|e| match e {
            // A 4xx on submission means the backend refused the job itself
            GatewayError::InvalidResponse(msg) => GatewayError::Rejected(msg),
            other => other,
        })?;
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("submit response: {}", e)))?;
        debug!(job_id = %body.job_id, "Backend accepted job");
        Ok(body.job_id)
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, GatewayError> {
        let response = self
            .send(self.client.get(self.url(&format!("/jobs/{}", job_id))))
            .await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("job status: {}", e)))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<String>, GatewayError> {
        let response = self
            .send(
                self.client
                    .get(self.url("/artifacts"))
                    .query(&[("limit", limit)]),
            )
            .await?;
        let body: RecentArtifactsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("recent artifacts: {}", e)))?;
        Ok(body.artifacts)
    }

    async fn metadata(&self, artifact_ref: &str) -> Result<ArtifactMetadata, GatewayError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/artifacts/{}/metadata", artifact_ref))),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("artifact metadata: {}", e)))
    }

    async fn fetch(&self, artifact_ref: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .send(self.client.get(self.url(&format!("/artifacts/{}", artifact_ref))))
            .await?;
        let bytes = response.bytes().await.map_err(map_http_error)?;
        Ok(bytes.to_vec())
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_status(status, body))
}

fn map_status(status: StatusCode, body: String) -> GatewayError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 => GatewayError::AuthFailed(detail),
        404 => GatewayError::NotFound(detail),
        429 => GatewayError::RateLimited(detail),
        400..=499 => GatewayError::InvalidResponse(detail),
        _ => GatewayError::RequestFailed(detail),
    }
}

fn map_http_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::RequestFailed(format!("request timed out: {}", error))
    } else if error.is_decode() {
        GatewayError::InvalidResponse(error.to_string())
    } else {
        GatewayError::RequestFailed(error.to_string())
    }
}
