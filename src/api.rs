//! Orchestrator API
//!
//! Caller-facing surface of the workflow: sessions, steps, alternatives and
//! retrieval tasks. Every operation returns once local state is updated or
//! work is enqueued; none waits for the backend to finish a job.

use crate::artifacts::{ArtifactHandle, ArtifactSink, FsArtifactStorage};
use crate::clock::{Clock, SystemClock};
use crate::config::DarkroomConfig;
use crate::error::OrchestratorError;
use crate::gateway::{BackendGateway, HttpGateway};
use crate::model::{
    AlternativeRecord, Parameters, RetrievalTaskRecord, SessionOrigin, SessionRecord, StepRecord,
};
use crate::store::{RecordStore, SledRecordStore};
use crate::types::{SessionId, StepId, TaskId};
use crate::workflow::{
    MonitorSweepReport, RecoveryReport, RetrievalQueue, RetrievalStats, RetrievalSweepReport,
    Scheduler, StepMachine, StepRequest, TreeManager, WorkflowContext,
};
use serde::Serialize;
use std::sync::Arc;

/// Combined outcome of one monitoring and one retrieval sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub monitor: MonitorSweepReport,
    pub retrieval: RetrievalSweepReport,
}

/// A step together with its alternatives
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub step: StepRecord,
    pub alternatives: Vec<AlternativeRecord>,
}

pub struct Orchestrator {
    ctx: Arc<WorkflowContext>,
    steps: Arc<StepMachine>,
    retrieval: Arc<RetrievalQueue>,
    tree: TreeManager,
    scheduler: Scheduler,
}

impl Orchestrator {
    /// Wire the workflow components around the given collaborators.
    pub fn new(
        config: DarkroomConfig,
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn BackendGateway>,
        sink: Arc<dyn ArtifactSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler_config = config.scheduler.clone();
        let ctx = Arc::new(WorkflowContext::new(config, store, gateway, sink, clock));
        let retrieval = Arc::new(RetrievalQueue::new(ctx.clone()));
        let steps = Arc::new(StepMachine::new(ctx.clone(), retrieval.clone()));
        let tree = TreeManager::new(steps.clone());
        let scheduler = Scheduler::new(steps.clone(), retrieval.clone(), scheduler_config);
        Self {
            ctx,
            steps,
            retrieval,
            tree,
            scheduler,
        }
    }

    /// Open the sled store, artifact directory and HTTP backend named by `config`.
    pub fn open(config: DarkroomConfig) -> Result<Self, OrchestratorError> {
        config.ensure_valid()?;
        let store = SledRecordStore::open(&config.storage.store_path)?;
        let sink = FsArtifactStorage::new(&config.storage.artifacts_path)?;
        let gateway = HttpGateway::new(&config.backend)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(gateway),
            Arc::new(sink),
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &DarkroomConfig {
        &self.ctx.config
    }

    // Sessions

    pub fn start_session(&self, origin: SessionOrigin) -> Result<SessionRecord, OrchestratorError> {
        self.tree.start_session(origin)
    }

    pub fn complete_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.tree.complete_session(session_id)
    }

    pub fn abandon_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.tree.abandon_session(session_id)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.tree.get_session(session_id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        Ok(self.ctx.store.list_sessions()?)
    }

    pub fn session_tree(&self, session_id: SessionId) -> Result<Vec<StepRecord>, OrchestratorError> {
        self.tree.session_tree(session_id)
    }

    // Steps

    pub fn create_step(&self, request: StepRequest) -> Result<StepRecord, OrchestratorError> {
        self.steps.create_step(request)
    }

    pub async fn submit(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        self.steps.submit(step_id).await
    }

    pub fn abandon(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        self.steps.abandon(step_id)
    }

    pub async fn resubmit(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        self.steps.resubmit(step_id).await
    }

    pub fn get_step(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        self.ctx.load_step(step_id)
    }

    pub fn step_view(&self, step_id: StepId) -> Result<StepView, OrchestratorError> {
        Ok(StepView {
            step: self.get_step(step_id)?,
            alternatives: self.tree.list_alternatives(step_id)?,
        })
    }

    // Alternatives

    pub fn branch(
        &self,
        artifact_ref: &str,
        prompt: Option<String>,
        parameters: Option<Parameters>,
    ) -> Result<StepRecord, OrchestratorError> {
        self.tree.branch(artifact_ref, prompt, parameters)
    }

    pub fn select(&self, artifact_ref: &str) -> Result<AlternativeRecord, OrchestratorError> {
        self.tree.select(artifact_ref)
    }

    pub fn get_alternative(&self, artifact_ref: &str) -> Result<AlternativeRecord, OrchestratorError> {
        self.tree.get_alternative(artifact_ref)
    }

    pub fn list_alternatives(&self, step_id: StepId) -> Result<Vec<AlternativeRecord>, OrchestratorError> {
        self.tree.list_alternatives(step_id)
    }

    // Retrieval tasks

    pub fn get_task(&self, task_id: TaskId) -> Result<RetrievalTaskRecord, OrchestratorError> {
        self.retrieval.get_task(task_id)
    }

    /// All tasks, or only those not yet completed.
    pub fn list_tasks(&self, include_completed: bool) -> Result<Vec<RetrievalTaskRecord>, OrchestratorError> {
        let tasks = if include_completed {
            self.ctx.store.list_tasks()?
        } else {
            self.ctx.store.list_open_tasks()?
        };
        Ok(tasks)
    }

    pub fn retry_task(&self, task_id: TaskId) -> Result<RetrievalTaskRecord, OrchestratorError> {
        self.retrieval.retry_task(task_id)
    }

    pub async fn retrieve_now(&self, task_id: TaskId) -> Result<ArtifactHandle, OrchestratorError> {
        self.retrieval.retrieve_now(task_id).await
    }

    pub fn retrieval_stats(&self) -> Result<RetrievalStats, OrchestratorError> {
        self.retrieval.stats()
    }

    // Lifecycle

    pub fn recover_interrupted(&self) -> Result<RecoveryReport, OrchestratorError> {
        self.steps.recover_interrupted()
    }

    pub async fn run_monitor_sweep(&self) -> Result<MonitorSweepReport, OrchestratorError> {
        self.scheduler.run_monitor_sweep().await
    }

    pub async fn run_retrieval_sweep(&self) -> Result<RetrievalSweepReport, OrchestratorError> {
        self.scheduler.run_retrieval_sweep().await
    }

    /// One monitoring sweep followed by one retrieval sweep.
    pub async fn sweep_once(&self) -> Result<SweepReport, OrchestratorError> {
        let monitor = self.run_monitor_sweep().await?;
        let retrieval = self.run_retrieval_sweep().await?;
        Ok(SweepReport { monitor, retrieval })
    }

    pub fn start_scheduler(&self) -> Result<(), OrchestratorError> {
        self.scheduler.start()
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn flush(&self) -> Result<(), OrchestratorError> {
        self.ctx.locks.prune();
        Ok(self.ctx.store.flush()?)
    }
}
