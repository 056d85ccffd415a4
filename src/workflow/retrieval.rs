//! Retrieval Queue
//!
//! Durable worklist that copies correlated artifacts into local storage.
//! Tasks live in the record store; a sweep claims a batch, fetches with
//! bounded parallelism and records the outcome. A failed fetch goes back to
//! `pending` until `max_attempts` is reached, then stays terminally `failed`
//! until a caller retries it explicitly.

use crate::artifacts::ArtifactHandle;
use crate::error::OrchestratorError;
use crate::gateway::with_timeout;
use crate::model::{RetrievalTaskRecord, TaskStatus};
use crate::types::{Priority, StepId, TaskId};
use crate::workflow::WorkflowContext;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Task counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrievalStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RetrievalStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Counters of one retrieval sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrievalSweepReport {
    pub attempted: usize,
    pub completed: usize,
    /// Failed, back to pending for a later sweep
    pub retried: usize,
    /// Failed with no attempts left
    pub exhausted: usize,
}

pub struct RetrievalQueue {
    ctx: Arc<WorkflowContext>,
    /// Serializes task selection so no task is claimed twice
    claim: Mutex<()>,
}

impl RetrievalQueue {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self {
            ctx,
            claim: Mutex::new(()),
        }
    }

    fn max_attempts(&self) -> u32 {
        self.ctx.config.retrieval.max_attempts
    }

    /// Insert a new `pending` task.
    pub fn enqueue(
        &self,
        task_id: TaskId,
        step_id: StepId,
        artifact_ref: &str,
        priority: Priority,
    ) -> Result<RetrievalTaskRecord, OrchestratorError> {
        let record = RetrievalTaskRecord {
            task_id,
            artifact_ref: artifact_ref.to_string(),
            step_id,
            status: TaskStatus::Pending,
            attempts: 0,
            last_attempt_at_ms: None,
            error_message: None,
            priority,
            handle: None,
            created_at_ms: self.ctx.now_ms(),
        };
        self.ctx.store.put_task(&record)?;
        debug!(
            task_id = %task_id,
            step_id = %step_id,
            artifact_ref = %artifact_ref,
            priority = priority.as_str(),
            "Retrieval task enqueued"
        );
        Ok(record)
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<RetrievalTaskRecord, OrchestratorError> {
        self.ctx
            .store
            .get_task(task_id)?
            .ok_or(OrchestratorError::TaskNotFound(task_id))
    }

    /// Eligible tasks ordered by priority, then longest waiting first.
    pub fn eligible(&self) -> Result<Vec<RetrievalTaskRecord>, OrchestratorError> {
        let max_attempts = self.max_attempts();
        let mut tasks: Vec<RetrievalTaskRecord> = self
            .ctx
            .store
            .list_open_tasks()?
            .into_iter()
            .filter(|task| match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Failed => !task.is_exhausted(max_attempts),
                _ => false,
            })
            .collect();
        tasks.sort_by_key(|task| (Reverse(task.priority), task.waiting_since_ms(), task.task_id));
        Ok(tasks)
    }

    /// Claim up to `limit` tasks: mark them in progress and count the attempt.
    fn claim_batch(&self, limit: usize) -> Result<Vec<RetrievalTaskRecord>, OrchestratorError> {
        let _claim = self.claim.lock();
        let now = self.ctx.now_ms();
        let mut claimed = Vec::new();
        for mut task in self.eligible()?.into_iter().take(limit) {
            task.status = TaskStatus::InProgress;
            task.attempts += 1;
            task.last_attempt_at_ms = Some(now);
            self.ctx.store.put_task(&task)?;
            claimed.push(task);
        }
        Ok(claimed)
    }

    /// One retrieval sweep.
    pub async fn sweep(&self) -> Result<RetrievalSweepReport, OrchestratorError> {
        let batch = self.claim_batch(self.ctx.config.retrieval.batch_size.max(1))?;
        let mut report = RetrievalSweepReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let parallel = self.ctx.config.retrieval.max_parallel.max(1);
        let results: Vec<(RetrievalTaskRecord, Result<ArtifactHandle, OrchestratorError>)> =
            stream::iter(batch)
                .map(|task| async move {
                    let result = self.attempt(&task).await;
                    (task, result)
                })
                .buffer_unordered(parallel)
                .collect()
                .await;

        for (task, result) in results {
            report.attempted += 1;
            match self.settle(task, result) {
                Ok(finished) => match finished.status {
                    TaskStatus::Completed => report.completed += 1,
                    TaskStatus::Failed => report.exhausted += 1,
                    _ => report.retried += 1,
                },
                Err(e) => {
                    error!(error = %e, "Failed to release retrieval task");
                }
            }
        }

        info!(
            attempted = report.attempted,
            completed = report.completed,
            retried = report.retried,
            exhausted = report.exhausted,
            "Retrieval sweep finished"
        );
        Ok(report)
    }

    /// Fetch bytes and metadata, then hand them to the artifact sink.
    async fn attempt(&self, task: &RetrievalTaskRecord) -> Result<ArtifactHandle, OrchestratorError> {
        let call_timeout = self.ctx.config.monitor.call_timeout();
        let gateway = &self.ctx.gateway;
        let bytes = with_timeout(call_timeout, gateway.fetch(&task.artifact_ref)).await?;
        let metadata = with_timeout(call_timeout, gateway.metadata(&task.artifact_ref)).await?;
        let handle = self.ctx.sink.store(&task.artifact_ref, &bytes, &metadata)?;
        Ok(handle)
    }

    /// Persist the outcome of one attempt.
    ///
    /// On success the owning alternative gets its storage handle (under the
    /// step lock) before the task is marked completed, so a completed task
    /// always implies a realized alternative.
    fn finish(
        &self,
        mut task: RetrievalTaskRecord,
        result: Result<ArtifactHandle, OrchestratorError>,
    ) -> Result<RetrievalTaskRecord, OrchestratorError> {
        match result {
            Ok(handle) => {
                self.attach_handle(&task, &handle)?;
                task.status = TaskStatus::Completed;
                task.error_message = None;
                task.handle = Some(handle);
                self.ctx.store.put_task(&task)?;
                info!(
                    task_id = %task.task_id,
                    step_id = %task.step_id,
                    artifact_ref = %task.artifact_ref,
                    attempt = task.attempts,
                    "Artifact retrieved"
                );
            }
            Err(e) => {
                task.error_message = Some(e.to_string());
                if task.is_exhausted(self.max_attempts()) {
                    task.status = TaskStatus::Failed;
                    warn!(
                        task_id = %task.task_id,
                        artifact_ref = %task.artifact_ref,
                        attempt = task.attempts,
                        error = %e,
                        "Retrieval attempts exhausted"
                    );
                } else {
                    task.status = TaskStatus::Pending;
                    debug!(
                        task_id = %task.task_id,
                        artifact_ref = %task.artifact_ref,
                        attempt = task.attempts,
                        error = %e,
                        "Retrieval attempt failed, will retry"
                    );
                }
                self.ctx.store.put_task(&task)?;
            }
        }
        Ok(task)
    }

    /// Like [`Self::finish`], but a failure to record success counts as a
    /// failed attempt, so a claimed task never stays in progress.
    fn settle(
        &self,
        task: RetrievalTaskRecord,
        result: Result<ArtifactHandle, OrchestratorError>,
    ) -> Result<RetrievalTaskRecord, OrchestratorError> {
        match self.finish(task.clone(), result) {
            Ok(finished) => Ok(finished),
            Err(e) => {
                error!(
                    task_id = %task.task_id,
                    artifact_ref = %task.artifact_ref,
                    error = %e,
                    "Failed to record retrieval outcome"
                );
                self.finish(task, Err(e))
            }
        }
    }

    fn attach_handle(
        &self,
        task: &RetrievalTaskRecord,
        handle: &ArtifactHandle,
    ) -> Result<(), OrchestratorError> {
        let lock = self.ctx.locks.get_lock(task.step_id);
        let _guard = lock.write();

        let mut alternative = self
            .ctx
            .store
            .get_alternative(&task.artifact_ref)?
            .ok_or_else(|| OrchestratorError::AlternativeNotFound(task.artifact_ref.clone()))?;
        alternative.storage_handle = Some(handle.clone());
        self.ctx.store.put_alternative(&alternative)?;
        Ok(())
    }

    /// Retrieve one task right away, outside the sweep.
    ///
    /// Idempotent: a completed task returns its existing handle without
    /// touching the backend.
    pub async fn retrieve_now(&self, task_id: TaskId) -> Result<ArtifactHandle, OrchestratorError> {
        let task = {
            let _claim = self.claim.lock();
            let mut task = self.get_task(task_id)?;
            match task.status {
                TaskStatus::Completed => {
                    if let Some(handle) = task.handle {
                        return Ok(handle);
                    }
                }
                TaskStatus::InProgress => {
                    return Err(OrchestratorError::Conflict(format!(
                        "task {} is already in progress",
                        task_id
                    )))
                }
                _ if task.is_exhausted(self.max_attempts()) => {
                    return Err(OrchestratorError::Conflict(format!(
                        "task {} has no attempts left, retry it first",
                        task_id
                    )))
                }
                _ => {}
            }
            task.status = TaskStatus::InProgress;
            task.attempts += 1;
            task.last_attempt_at_ms = Some(self.ctx.now_ms());
            self.ctx.store.put_task(&task)?;
            task
        };

        let result = self.attempt(&task).await;
        let finished = self.settle(task, result)?;
        match finished.handle {
            Some(handle) if finished.status == TaskStatus::Completed => Ok(handle),
            _ => Err(OrchestratorError::Conflict(format!(
                "retrieval of task {} failed: {}",
                task_id,
                finished
                    .error_message
                    .unwrap_or_else(|| "no handle produced".to_string())
            ))),
        }
    }

    /// Give a terminally failed task a fresh set of attempts.
    pub fn retry_task(&self, task_id: TaskId) -> Result<RetrievalTaskRecord, OrchestratorError> {
        let _claim = self.claim.lock();
        let mut task = self.get_task(task_id)?;
        if task.status != TaskStatus::Failed {
            return Err(OrchestratorError::Conflict(format!(
                "task {} is {}, only failed tasks can be retried",
                task_id,
                task.status.as_str()
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.error_message = None;
        task.priority = Priority::High;
        self.ctx.store.put_task(&task)?;
        info!(task_id = %task_id, artifact_ref = %task.artifact_ref, "Retrieval task re-queued");
        Ok(task)
    }

    /// Return tasks left in progress by a previous process to pending.
    pub fn recover(&self) -> Result<usize, OrchestratorError> {
        let _claim = self.claim.lock();
        let mut recovered = 0;
        for mut task in self.ctx.store.list_open_tasks()? {
            if task.status == TaskStatus::InProgress {
                task.status = if task.is_exhausted(self.max_attempts()) {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Pending
                };
                task.error_message
                    .get_or_insert_with(|| "attempt interrupted".to_string());
                self.ctx.store.put_task(&task)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn stats(&self) -> Result<RetrievalStats, OrchestratorError> {
        let mut stats = RetrievalStats::default();
        for task in self.ctx.store.list_tasks()? {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
