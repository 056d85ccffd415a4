//! Correlation Engine
//!
//! Resolves which backend artifacts belong to a just-completed step. The
//! backend keeps no reliable job→artifact index, so resolution is tiered:
//!
//! 1. Direct: result ids enumerated by the job status itself.
//! 2. Token: scan a window of recent artifacts for the step's marker.
//! 3. Recency: fill the shortfall with the newest unclaimed, unmarked
//!    candidates of the same window, flagging the step ambiguous.
//!
//! Resolution only reads. Claims and task creation happen when the step
//! machine commits the completion under the step lock.

use crate::config::CorrelationConfig;
use crate::error::{OrchestratorError, StorageError};
use crate::gateway::{with_timeout, ArtifactMetadata, BackendGateway};
use crate::model::{CorrelationTier, StepRecord};
use crate::store::RecordStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MARKER_OPEN: &str = "[[corr:";
const MARKER_CLOSE: &str = "]]";

/// Metadata key a backend may echo the correlation token under
pub const TOKEN_METADATA_KEY: &str = "correlation_token";

/// Delimited marker for `token`.
pub fn marker(token: &str) -> String {
    format!("{}{}{}", MARKER_OPEN, token, MARKER_CLOSE)
}

/// Prompt text sent to the backend: the prompt with the marker appended.
pub fn embed_marker(prompt: &str, token: &str) -> String {
    format!("{} {}", prompt, marker(token))
}

/// Every correlation token embedded in `text`.
pub fn extract_markers(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_OPEN) {
        let after = &rest[start + MARKER_OPEN.len()..];
        match after.find(MARKER_CLOSE) {
            Some(end) => {
                let token = &after[..end];
                if !token.is_empty() {
                    tokens.push(token);
                }
                rest = &after[end + MARKER_CLOSE.len()..];
            }
            None => break,
        }
    }
    tokens
}

/// Marker evidence found in one candidate's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerMatch {
    /// Carries this step's token
    Own,
    /// Carries some other step's token only
    Foreign,
    /// Carries no token at all
    Unmarked,
}

pub fn match_marker(metadata: &ArtifactMetadata, token: &str) -> MarkerMatch {
    let mut found: Vec<&str> = metadata
        .prompt_text
        .as_deref()
        .map(extract_markers)
        .unwrap_or_default();
    if let Some(echoed) = metadata.extra.get(TOKEN_METADATA_KEY).and_then(|v| v.as_str()) {
        found.push(echoed);
    }

    if found.iter().any(|t| *t == token) {
        MarkerMatch::Own
    } else if found.is_empty() {
        MarkerMatch::Unmarked
    } else {
        MarkerMatch::Foreign
    }
}

/// One accepted artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub artifact_ref: String,
    pub tier: CorrelationTier,
}

/// Outcome of resolving one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Accepted artifacts in acceptance order
    pub candidates: Vec<Candidate>,
    /// Recency fallback used, or fewer than expected found
    pub ambiguous: bool,
}

impl Resolution {
    pub fn count(&self, tier: CorrelationTier) -> usize {
        self.candidates.iter().filter(|c| c.tier == tier).count()
    }
}

pub struct CorrelationEngine {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn BackendGateway>,
    config: CorrelationConfig,
    call_timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn BackendGateway>,
        config: CorrelationConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            call_timeout,
        }
    }

    /// Resolve the artifacts of `step`, given the result ids reported by the
    /// job status (if any).
    ///
    /// A failure to list recent artifacts surfaces as
    /// [`OrchestratorError::Gateway`] so the caller can retry the whole
    /// resolution later; metadata failures only drop the affected candidate
    /// from the token scan.
    pub async fn resolve(
        &self,
        step: &StepRecord,
        result_refs: Option<&[String]>,
    ) -> Result<Resolution, OrchestratorError> {
        let expected = step.expected_artifact_count as usize;
        let mut resolution = self.resolve_direct(step, result_refs)?;
        if result_refs.is_some() && resolution.candidates.len() >= expected {
            debug!(
                step_id = %step.step_id,
                tier = CorrelationTier::Direct.as_str(),
                accepted = resolution.candidates.len(),
                "Correlated by direct reference"
            );
            return Ok(resolution);
        }
        let mut accepted: HashSet<String> = resolution
            .candidates
            .iter()
            .map(|c| c.artifact_ref.clone())
            .collect();

        let window = self.config.window_for(step.expected_artifact_count);
        let recent = with_timeout(self.call_timeout, self.gateway.list_recent(window)).await?;

        // Newest-first from the backend; the scan runs in creation order
        let mut foreign: HashSet<&str> = HashSet::new();
        for artifact_ref in recent.iter().rev() {
            if resolution.candidates.len() >= expected {
                break;
            }
            if accepted.contains(artifact_ref) || !self.is_available(artifact_ref, step)? {
                continue;
            }
            let metadata =
                match with_timeout(self.call_timeout, self.gateway.metadata(artifact_ref)).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        debug!(
                            step_id = %step.step_id,
                            artifact_ref = %artifact_ref,
                            error = %e,
                            "Skipping candidate without metadata"
                        );
                        continue;
                    }
                };
            match match_marker(&metadata, &step.correlation_token) {
                MarkerMatch::Own => {
                    accepted.insert(artifact_ref.clone());
                    resolution.candidates.push(Candidate {
                        artifact_ref: artifact_ref.clone(),
                        tier: CorrelationTier::Token,
                    });
                }
                MarkerMatch::Foreign => {
                    foreign.insert(artifact_ref.as_str());
                }
                MarkerMatch::Unmarked => {}
            }
        }

        if resolution.candidates.len() < expected {
            let shortfall = expected - resolution.candidates.len();
            let mut fallback = Vec::new();
            for artifact_ref in recent.iter() {
                if fallback.len() >= shortfall {
                    break;
                }
                if accepted.contains(artifact_ref)
                    || foreign.contains(artifact_ref.as_str())
                    || !self.is_available(artifact_ref, step)?
                {
                    continue;
                }
                fallback.push(artifact_ref.clone());
            }
            // Accept in creation order, like the token scan
            for artifact_ref in fallback.into_iter().rev() {
                accepted.insert(artifact_ref.clone());
                resolution.candidates.push(Candidate {
                    artifact_ref,
                    tier: CorrelationTier::Recency,
                });
            }
            resolution.ambiguous = true;
            warn!(
                step_id = %step.step_id,
                expected,
                token_matches = resolution.count(CorrelationTier::Token),
                recency_matches = resolution.count(CorrelationTier::Recency),
                window = recent.len(),
                "Correlation fell back to recency; step flagged ambiguous"
            );
        }

        Ok(resolution)
    }

    /// Accept the result ids reported by the job status, up to the expected
    /// count. Never calls the backend.
    pub fn resolve_direct(
        &self,
        step: &StepRecord,
        result_refs: Option<&[String]>,
    ) -> Result<Resolution, StorageError> {
        let expected = step.expected_artifact_count as usize;
        let mut resolution = Resolution::default();
        let Some(refs) = result_refs else {
            return Ok(resolution);
        };
        if refs.len() > expected {
            warn!(
                step_id = %step.step_id,
                reported = refs.len(),
                expected,
                "Backend reported more results than expected, keeping the first ones"
            );
        }
        let mut accepted: HashSet<&str> = HashSet::new();
        for artifact_ref in refs {
            if resolution.candidates.len() >= expected {
                break;
            }
            if accepted.contains(artifact_ref.as_str()) || !self.is_available(artifact_ref, step)? {
                continue;
            }
            accepted.insert(artifact_ref.as_str());
            resolution.candidates.push(Candidate {
                artifact_ref: artifact_ref.clone(),
                tier: CorrelationTier::Direct,
            });
        }
        Ok(resolution)
    }

    /// Unclaimed, or already claimed by this same step.
    fn is_available(&self, artifact_ref: &str, step: &StepRecord) -> Result<bool, StorageError> {
        Ok(self
            .store
            .get_alternative(artifact_ref)?
            .map_or(true, |existing| existing.step_id == step.step_id))
    }
}
