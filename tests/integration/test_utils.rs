//! Shared test utilities for integration tests
//!
//! Provides a scripted in-memory backend and a harness wiring it to a
//! temp-dir sled store, filesystem artifact storage and a manual clock.

use async_trait::async_trait;
use darkroom::api::Orchestrator;
use darkroom::artifacts::FsArtifactStorage;
use darkroom::clock::ManualClock;
use darkroom::config::DarkroomConfig;
use darkroom::error::GatewayError;
use darkroom::gateway::{ArtifactMetadata, BackendGateway, JobRequest, JobStatus};
use darkroom::model::{
    Parameters, SessionOrigin, SessionRecord, StepRecord, PARAM_BATCH_SIZE, PARAM_MODEL,
};
use darkroom::store::SledRecordStore;
use darkroom::types::{SessionId, StepId};
use darkroom::workflow::correlation::embed_marker;
use darkroom::workflow::StepRequest;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Start of the manual clock in every harness
pub const START_MS: u64 = 1_700_000_000_000;

#[derive(Default)]
struct Script {
    next_job: u64,
    submit_errors: VecDeque<GatewayError>,
    /// Per job id; the last entry repeats once the queue is down to one
    statuses: HashMap<String, VecDeque<Result<JobStatus, GatewayError>>>,
    /// Newest first
    recent: Vec<String>,
    list_error: Option<GatewayError>,
    metadata: HashMap<String, ArtifactMetadata>,
    fetch_failures: HashMap<String, usize>,
    submitted: Vec<JobRequest>,
}

/// In-memory backend driven by a per-test script
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
    pub submit_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    status_gate: Mutex<Option<StatusGate>>,
}

/// Parks status calls until released
#[derive(Clone)]
pub struct StatusGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job id the next accepted submission receives.
    pub fn next_job_id(&self) -> String {
        format!("job-{}", self.script.lock().next_job + 1)
    }

    /// Refuse the next submission with `error`.
    pub fn fail_next_submit(&self, error: GatewayError) {
        self.script.lock().submit_errors.push_back(error);
    }

    /// Make every status call wait for `release` after signalling `entered`.
    pub fn hold_status(&self) -> StatusGate {
        let gate = StatusGate {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.status_gate.lock() = Some(gate.clone());
        gate
    }

    /// Statuses returned for `job_id`, in order; the last one repeats.
    pub fn script_status(&self, job_id: &str, statuses: Vec<Result<JobStatus, GatewayError>>) {
        self.script
            .lock()
            .statuses
            .insert(job_id.to_string(), statuses.into());
    }

    /// Register an artifact the backend can serve, without listing it.
    pub fn add_artifact(&self, artifact_ref: &str, prompt_text: Option<&str>) {
        let metadata = ArtifactMetadata {
            artifact_ref: artifact_ref.to_string(),
            created_at_ms: START_MS,
            prompt_text: prompt_text.map(str::to_string),
            content_type: Some("image/png".to_string()),
            extra: BTreeMap::new(),
        };
        self.script
            .lock()
            .metadata
            .insert(artifact_ref.to_string(), metadata);
    }

    /// Register an artifact and make it the newest listed one.
    pub fn publish(&self, artifact_ref: &str, prompt_text: Option<&str>) {
        self.add_artifact(artifact_ref, prompt_text);
        self.script.lock().recent.insert(0, artifact_ref.to_string());
    }

    /// Publish an artifact whose prompt carries the marker of `token`.
    pub fn publish_marked(&self, artifact_ref: &str, token: &str) {
        self.publish(artifact_ref, Some(&embed_marker("a lighthouse at dusk", token)));
    }

    /// List an artifact whose metadata lookups fail.
    pub fn publish_without_metadata(&self, artifact_ref: &str) {
        self.script.lock().recent.insert(0, artifact_ref.to_string());
    }

    pub fn fail_listing(&self, error: Option<GatewayError>) {
        self.script.lock().list_error = error;
    }

    /// Fail the next `times` fetches of `artifact_ref`.
    pub fn fail_fetch(&self, artifact_ref: &str, times: usize) {
        self.script
            .lock()
            .fetch_failures
            .insert(artifact_ref.to_string(), times);
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.script.lock().submitted.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendGateway for ScriptedGateway {
    async fn submit(&self, request: &JobRequest) -> Result<String, GatewayError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if let Some(error) = script.submit_errors.pop_front() {
            return Err(error);
        }
        script.next_job += 1;
        script.submitted.push(request.clone());
        Ok(format!("job-{}", script.next_job))
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.status_gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let mut script = self.script.lock();
        let Some(queue) = script.statuses.get_mut(job_id) else {
            return Ok(JobStatus::pending());
        };
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.unwrap_or_else(|| Ok(JobStatus::pending()))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<String>, GatewayError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if let Some(error) = &script.list_error {
            return Err(error.clone());
        }
        Ok(script.recent.iter().take(limit).cloned().collect())
    }

    async fn metadata(&self, artifact_ref: &str) -> Result<ArtifactMetadata, GatewayError> {
        self.script
            .lock()
            .metadata
            .get(artifact_ref)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(artifact_ref.to_string()))
    }

    async fn fetch(&self, artifact_ref: &str) -> Result<Vec<u8>, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if let Some(remaining) = script.fetch_failures.get_mut(artifact_ref) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::RequestFailed(format!(
                    "connection reset fetching {}",
                    artifact_ref
                )));
            }
        }
        if !script.metadata.contains_key(artifact_ref) {
            return Err(GatewayError::NotFound(artifact_ref.to_string()));
        }
        Ok(artifact_bytes(artifact_ref))
    }
}

/// Bytes the scripted backend serves for `artifact_ref`.
pub fn artifact_bytes(artifact_ref: &str) -> Vec<u8> {
    format!("png-bytes:{}", artifact_ref).into_bytes()
}

/// One orchestrator over temp-dir storage, a scripted backend and a manual clock
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SledRecordStore>,
    pub storage: Arc<FsArtifactStorage>,
    pub config: DarkroomConfig,
    _temp_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config<F>(adjust: F) -> Self
    where
        F: FnOnce(&mut DarkroomConfig),
    {
        let temp_dir = TempDir::new().unwrap();
        let mut config = DarkroomConfig::default();
        config.storage.store_path = temp_dir.path().join("store");
        config.storage.artifacts_path = temp_dir.path().join("artifacts");
        adjust(&mut config);

        let store = Arc::new(SledRecordStore::open(&config.storage.store_path).unwrap());
        let storage = Arc::new(FsArtifactStorage::new(&config.storage.artifacts_path).unwrap());
        let gateway = Arc::new(ScriptedGateway::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let orchestrator = Orchestrator::new(
            config.clone(),
            store.clone(),
            gateway.clone(),
            storage.clone(),
            clock.clone(),
        );

        Self {
            orchestrator,
            gateway,
            clock,
            store,
            storage,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// A second orchestrator over the same store and backend, as after a restart.
    pub fn restarted(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            self.store.clone(),
            self.gateway.clone(),
            self.storage.clone(),
            self.clock.clone(),
        )
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn session(&self) -> SessionRecord {
        self.orchestrator.start_session(SessionOrigin::Fresh).unwrap()
    }

    pub fn create_step(
        &self,
        session_id: SessionId,
        parent: Option<StepId>,
        batch_size: u32,
    ) -> StepRecord {
        self.orchestrator
            .create_step(request(session_id, parent, batch_size))
            .unwrap()
    }

    /// Create and submit a root step; returns it in `monitoring`.
    pub async fn submitted_step(&self, session_id: SessionId, batch_size: u32) -> StepRecord {
        let step = self.create_step(session_id, None, batch_size);
        self.orchestrator.submit(step.step_id).await.unwrap()
    }

    pub fn step(&self, step_id: StepId) -> StepRecord {
        self.orchestrator.get_step(step_id).unwrap()
    }

    /// Run monitoring sweeps one second apart until `step_id` is terminal.
    pub async fn monitor_until_terminal(&self, step_id: StepId, max_sweeps: usize) -> StepRecord {
        for _ in 0..max_sweeps {
            self.orchestrator.run_monitor_sweep().await.unwrap();
            let step = self.step(step_id);
            if step.status.is_terminal() {
                return step;
            }
            self.advance(Duration::from_secs(1));
        }
        self.step(step_id)
    }

    /// Submit a step whose job finishes at once with `refs`, and complete it.
    pub async fn completed_step(
        &self,
        session_id: SessionId,
        parent: Option<StepId>,
        refs: &[&str],
    ) -> StepRecord {
        for artifact_ref in refs {
            self.gateway.add_artifact(artifact_ref, None);
        }
        let job_id = self.gateway.next_job_id();
        self.gateway.script_status(
            &job_id,
            vec![Ok(JobStatus::done(Some(
                refs.iter().map(|r| r.to_string()).collect(),
            )))],
        );
        let step = self.create_step(session_id, parent, refs.len().max(1) as u32);
        self.orchestrator.submit(step.step_id).await.unwrap();
        self.monitor_until_terminal(step.step_id, 5).await
    }
}

pub fn request(session_id: SessionId, parent: Option<StepId>, batch_size: u32) -> StepRequest {
    let mut parameters = Parameters::new();
    parameters.insert(PARAM_MODEL.to_string(), serde_json::json!("sdxl-base"));
    parameters.insert(PARAM_BATCH_SIZE.to_string(), serde_json::json!(batch_size));
    StepRequest {
        session_id,
        parent_step_id: parent,
        prompt: "a lighthouse at dusk".to_string(),
        negative_prompt: None,
        parameters,
    }
}
