//! Step State Machine
//!
//! Drives one generation request through
//! `created → submitting → submitted → monitoring → completed | failed`.
//!
//! Every transition goes through [`StepMachine::transition`], which holds the
//! step's write lock while it re-reads the record, checks the transition
//! against the current status and persists the result. Backend calls happen
//! outside the lock; the transition that follows a call is rejected (and
//! reported as such) if a concurrent `abandon` got there first.

use crate::config::DarkroomConfig;
use crate::error::OrchestratorError;
use crate::gateway::{with_timeout, JobRequest, JobState, JobStatus};
use crate::model::{
    AlternativeRecord, Parameters, ReportedDone, SessionStatus, StepError, StepErrorKind,
    StepRecord, StepStatus, PARAM_BATCH_SIZE, PARAM_MODEL,
};
use crate::types::{Priority, SessionId, StepId, TaskId};
use crate::workflow::backoff::{self, BackoffPolicy};
use crate::workflow::correlation::{embed_marker, CorrelationEngine, Resolution};
use crate::workflow::retrieval::RetrievalQueue;
use crate::workflow::tree;
use crate::workflow::WorkflowContext;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// Caller input for a new step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub session_id: SessionId,
    pub parent_step_id: Option<StepId>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub parameters: Parameters,
}

/// Result of a guarded transition
#[derive(Debug, Clone)]
pub enum Transition {
    /// Applied and persisted
    Applied(StepRecord),
    /// Not valid from the current status; carries the unchanged record
    Rejected(StepRecord),
}

impl Transition {
    pub fn into_record(self) -> StepRecord {
        match self {
            Transition::Applied(record) | Transition::Rejected(record) => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// What one monitoring poll did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not monitoring, not due, or already being polled
    Skipped,
    /// Backend still working; next poll scheduled
    Pending,
    /// Poll or resolution could not reach the backend; retried next sweep
    Deferred,
    Completed { alternatives: usize, ambiguous: bool },
    Failed,
    TimedOut,
    /// Lost the step lock race (e.g. to `abandon`)
    Rejected,
}

/// Counters of one monitoring sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSweepReport {
    pub polled: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub deferred: usize,
    pub errors: usize,
}

impl MonitorSweepReport {
    fn record(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::Skipped | PollOutcome::Rejected => return,
            PollOutcome::Pending => self.pending += 1,
            PollOutcome::Deferred => self.deferred += 1,
            PollOutcome::Completed { .. } => self.completed += 1,
            PollOutcome::Failed => self.failed += 1,
            PollOutcome::TimedOut => self.timed_out += 1,
        }
        self.polled += 1;
    }
}

/// Counters of [`StepMachine::recover_interrupted`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub interrupted_submissions: usize,
    pub resumed_monitoring: usize,
    pub requeued_tasks: usize,
}

pub struct StepMachine {
    ctx: Arc<WorkflowContext>,
    correlation: CorrelationEngine,
    retrieval: Arc<RetrievalQueue>,
    backoff: BackoffPolicy,
    /// Steps with a poll currently running
    polling: Mutex<HashSet<StepId>>,
}

impl StepMachine {
    pub fn new(ctx: Arc<WorkflowContext>, retrieval: Arc<RetrievalQueue>) -> Self {
        let config: &DarkroomConfig = &ctx.config;
        let correlation = CorrelationEngine::new(
            ctx.store.clone(),
            ctx.gateway.clone(),
            config.correlation.clone(),
            config.monitor.call_timeout(),
        );
        let backoff = BackoffPolicy::from(&config.monitor);
        Self {
            ctx,
            correlation,
            retrieval,
            backoff,
            polling: Mutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &Arc<WorkflowContext> {
        &self.ctx
    }

    /// Validate and persist a new step in `created`.
    ///
    /// No backend call is made.
    pub fn create_step(&self, request: StepRequest) -> Result<StepRecord, OrchestratorError> {
        self.create_step_from(request, None)
    }

    pub(crate) fn create_step_from(
        &self,
        request: StepRequest,
        branched_from: Option<String>,
    ) -> Result<StepRecord, OrchestratorError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(OrchestratorError::Validation("prompt is required".to_string()));
        }
        let has_model = request
            .parameters
            .get(PARAM_MODEL)
            .and_then(Value::as_str)
            .map_or(false, |model| !model.trim().is_empty());
        if !has_model {
            return Err(OrchestratorError::Validation(format!(
                "parameter '{}' must name a model",
                PARAM_MODEL
            )));
        }
        let expected_artifact_count = expected_artifact_count(&request.parameters)?;

        let session = self
            .ctx
            .store
            .get_session(request.session_id)?
            .ok_or(OrchestratorError::SessionNotFound(request.session_id))?;
        if session.status != SessionStatus::Active {
            return Err(OrchestratorError::Validation(format!(
                "session {} is {}",
                session.session_id,
                session.status.as_str()
            )));
        }

        let _structure = self.ctx.structure_lock();
        let step_id = StepId(self.ctx.store.next_id()?);
        tree::validate_placement(
            self.ctx.store.as_ref(),
            request.session_id,
            step_id,
            request.parent_step_id,
        )?;
        let sibling_position = tree::next_sibling_position(
            self.ctx.store.as_ref(),
            request.session_id,
            request.parent_step_id,
        )?;

        let now = self.ctx.now_ms();
        let record = StepRecord {
            step_id,
            session_id: request.session_id,
            parent_step_id: request.parent_step_id,
            prompt: prompt.to_string(),
            negative_prompt: request
                .negative_prompt
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            parameters: request.parameters,
            sibling_position,
            correlation_token: generate_token(step_id, now),
            backend_job_id: None,
            expected_artifact_count,
            status: StepStatus::Created,
            error: None,
            ambiguous_correlation: false,
            branched_from,
            monitor: None,
            reported_done: None,
            created_at_ms: now,
            submitted_at_ms: None,
            completed_at_ms: None,
        };
        self.ctx.store.put_step(&record)?;

        info!(
            step_id = %record.step_id,
            session_id = %record.session_id,
            parent_step_id = ?record.parent_step_id.map(|p| p.to_string()),
            sibling_position,
            expected = expected_artifact_count,
            "Step created"
        );
        Ok(record)
    }

    /// Apply `next` if the current status allows it.
    ///
    /// `mutate` runs under the step lock after the check and before the
    /// record is persisted; an error from it aborts the transition.
    pub fn transition<F>(
        &self,
        step_id: StepId,
        next: StepStatus,
        mutate: F,
    ) -> Result<Transition, OrchestratorError>
    where
        F: FnOnce(&mut StepRecord) -> Result<(), OrchestratorError>,
    {
        let lock = self.ctx.locks.get_lock(step_id);
        let _guard = lock.write();

        let mut record = self.ctx.load_step(step_id)?;
        if !record.status.can_transition_to(next) {
            debug!(
                step_id = %step_id,
                from = record.status.as_str(),
                to = next.as_str(),
                "Transition rejected"
            );
            return Ok(Transition::Rejected(record));
        }
        mutate(&mut record)?;
        record.status = next;
        if next.is_terminal() {
            record.monitor = None;
            record.completed_at_ms.get_or_insert(self.ctx.now_ms());
        }
        self.ctx.store.put_step(&record)?;
        Ok(Transition::Applied(record))
    }

    fn fail(
        &self,
        step_id: StepId,
        kind: StepErrorKind,
        message: impl Into<String>,
    ) -> Result<Transition, OrchestratorError> {
        let error = StepError::new(kind, message);
        let transition = self.transition(step_id, StepStatus::Failed, |record| {
            record.error = Some(error.clone());
            Ok(())
        })?;
        if transition.is_applied() {
            warn!(
                step_id = %step_id,
                kind = error.kind.as_str(),
                error = %error.message,
                "Step failed"
            );
        }
        Ok(transition)
    }

    /// Submit a `created` step to the backend.
    ///
    /// A backend refusal is recorded on the step (`failed` with
    /// `submission_error`) and returned as `Ok`; it is never retried here.
    pub async fn submit(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        let record = match self.transition(step_id, StepStatus::Submitting, |_| Ok(()))? {
            Transition::Applied(record) => record,
            Transition::Rejected(record) => {
                return Err(OrchestratorError::Conflict(format!(
                    "step {} is {}, only created steps can be submitted",
                    step_id,
                    record.status.as_str()
                )))
            }
        };

        let request = JobRequest {
            prompt: embed_marker(&record.prompt, &record.correlation_token),
            negative_prompt: record.negative_prompt.clone(),
            model: record.model().unwrap_or_default().to_string(),
            parameters: record.parameters.clone(),
            correlation_token: record.correlation_token.clone(),
        };

        let call_timeout = self.ctx.config.monitor.call_timeout();
        let job_id = match with_timeout(call_timeout, self.ctx.gateway.submit(&request)).await {
            Ok(job_id) => job_id,
            Err(e) => {
                return Ok(self
                    .fail(step_id, StepErrorKind::SubmissionError, e.to_string())?
                    .into_record())
            }
        };

        let now = self.ctx.now_ms();
        let submitted = self.transition(step_id, StepStatus::Submitted, |record| {
            record.backend_job_id = Some(job_id.clone());
            record.submitted_at_ms = Some(now);
            Ok(())
        })?;
        if let Transition::Rejected(record) = submitted {
            warn!(
                step_id = %step_id,
                job_id = %job_id,
                status = record.status.as_str(),
                "Backend accepted a job for a step that is no longer submitting"
            );
            return Ok(record);
        }
        info!(step_id = %step_id, job_id = %job_id, "Step submitted");

        let monitor = self.backoff.start(now);
        let monitoring = self.transition(step_id, StepStatus::Monitoring, |record| {
            record.monitor = Some(monitor);
            Ok(())
        })?;
        Ok(monitoring.into_record())
    }

    /// Stop an in-flight step: `failed` with kind `cancelled`.
    pub fn abandon(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        let lock = self.ctx.locks.get_lock(step_id);
        let _guard = lock.write();

        let mut record = self.ctx.load_step(step_id)?;
        if !record.status.is_in_flight() {
            return Err(OrchestratorError::Conflict(format!(
                "step {} is {}, only in-flight steps can be abandoned",
                step_id,
                record.status.as_str()
            )));
        }
        record.status = StepStatus::Failed;
        record.error = Some(StepError::new(StepErrorKind::Cancelled, "abandoned by caller"));
        record.monitor = None;
        record.completed_at_ms = Some(self.ctx.now_ms());
        self.ctx.store.put_step(&record)?;

        info!(step_id = %step_id, "Step abandoned");
        Ok(record)
    }

    /// Create a fresh sibling of a failed step and submit it.
    pub async fn resubmit(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        let failed = self.ctx.load_step(step_id)?;
        if failed.status != StepStatus::Failed {
            return Err(OrchestratorError::Conflict(format!(
                "step {} is {}, only failed steps can be resubmitted",
                step_id,
                failed.status.as_str()
            )));
        }
        let retry = self.create_step_from(
            StepRequest {
                session_id: failed.session_id,
                parent_step_id: failed.parent_step_id,
                prompt: failed.prompt.clone(),
                negative_prompt: failed.negative_prompt.clone(),
                parameters: failed.parameters.clone(),
            },
            failed.branched_from.clone(),
        )?;
        info!(step_id = %step_id, retry_step_id = %retry.step_id, "Resubmitting failed step");
        self.submit(retry.step_id).await
    }

    /// Poll one monitoring step if it is due.
    pub async fn poll(&self, step_id: StepId) -> Result<PollOutcome, OrchestratorError> {
        if !self.polling.lock().insert(step_id) {
            return Ok(PollOutcome::Skipped);
        }
        let _polling = PollingGuard {
            polling: &self.polling,
            step_id,
        };

        let record = self.ctx.load_step(step_id)?;
        if record.status != StepStatus::Monitoring {
            return Ok(PollOutcome::Skipped);
        }
        let now = self.ctx.now_ms();
        let monitor = record.monitor.unwrap_or_else(|| self.backoff.start(now));

        // The job already finished; only its artifacts are still unresolved
        if let Some(reported) = record.reported_done.clone() {
            let expired = backoff::is_expired(&monitor, now);
            if !expired && !backoff::is_due(&monitor, now) {
                return Ok(PollOutcome::Skipped);
            }
            return self.resolve_done(&record, now, reported, expired).await;
        }

        if backoff::is_expired(&monitor, now) {
            let message = format!("monitoring deadline elapsed after {} polls", monitor.polls);
            return Ok(match self.fail(step_id, StepErrorKind::Timeout, message)? {
                Transition::Applied(_) => PollOutcome::TimedOut,
                Transition::Rejected(_) => PollOutcome::Rejected,
            });
        }
        if !backoff::is_due(&monitor, now) {
            return Ok(PollOutcome::Skipped);
        }

        let job_id = match record.backend_job_id.clone() {
            Some(job_id) => job_id,
            None => {
                return Ok(match self.fail(
                    step_id,
                    StepErrorKind::BackendJobError,
                    "monitoring step has no backend job id",
                )? {
                    Transition::Applied(_) => PollOutcome::Failed,
                    Transition::Rejected(_) => PollOutcome::Rejected,
                })
            }
        };

        let call_timeout = self.ctx.config.monitor.call_timeout();
        let status: JobStatus =
            match with_timeout(call_timeout, self.ctx.gateway.status(&job_id)).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(step_id = %step_id, job_id = %job_id, error = %e, "Status poll failed");
                    return self.reschedule(step_id, now, PollOutcome::Deferred);
                }
            };

        match status.state {
            JobState::Pending => {
                debug!(step_id = %step_id, job_id = %job_id, polls = monitor.polls + 1, "Job pending");
                self.reschedule(step_id, now, PollOutcome::Pending)
            }
            JobState::Failed => {
                let message = status
                    .error
                    .unwrap_or_else(|| "backend reported job failure".to_string());
                Ok(match self.fail(step_id, StepErrorKind::BackendJobError, message)? {
                    Transition::Applied(_) => PollOutcome::Failed,
                    Transition::Rejected(_) => PollOutcome::Rejected,
                })
            }
            JobState::Done => {
                let reported = ReportedDone {
                    observed_at_ms: now,
                    result_refs: status.result_refs,
                };
                self.resolve_done(&record, now, reported, false).await
            }
        }
    }

    /// Resolve and commit the artifacts of a job the backend reported done.
    ///
    /// While the backend cannot be listed the step stays in monitoring with
    /// the success recorded, so status is never polled again. Once the
    /// deadline passes the step completes with whatever direct references
    /// it has, flagged ambiguous.
    async fn resolve_done(
        &self,
        record: &StepRecord,
        now: u64,
        reported: ReportedDone,
        give_up: bool,
    ) -> Result<PollOutcome, OrchestratorError> {
        let step_id = record.step_id;
        match self
            .correlation
            .resolve(record, reported.result_refs.as_deref())
            .await
        {
            Ok(resolution) => self.complete(step_id, resolution),
            Err(OrchestratorError::Gateway(e)) if give_up => {
                warn!(
                    step_id = %step_id,
                    error = %e,
                    "Correlation still unavailable at the deadline, completing with direct references"
                );
                let mut resolution = self
                    .correlation
                    .resolve_direct(record, reported.result_refs.as_deref())?;
                resolution.ambiguous = true;
                self.complete(step_id, resolution)
            }
            Err(OrchestratorError::Gateway(e)) => {
                warn!(
                    step_id = %step_id,
                    job_id = ?record.backend_job_id,
                    error = %e,
                    "Correlation deferred, backend unavailable"
                );
                self.reschedule_with(step_id, now, PollOutcome::Deferred, Some(reported))
            }
            Err(e) => Err(e),
        }
    }

    /// Advance the backoff schedule of a step that stays in monitoring.
    fn reschedule(
        &self,
        step_id: StepId,
        now: u64,
        outcome: PollOutcome,
    ) -> Result<PollOutcome, OrchestratorError> {
        self.reschedule_with(step_id, now, outcome, None)
    }

    fn reschedule_with(
        &self,
        step_id: StepId,
        now: u64,
        outcome: PollOutcome,
        reported: Option<ReportedDone>,
    ) -> Result<PollOutcome, OrchestratorError> {
        let lock = self.ctx.locks.get_lock(step_id);
        let _guard = lock.write();

        let mut record = self.ctx.load_step(step_id)?;
        if record.status != StepStatus::Monitoring {
            return Ok(PollOutcome::Rejected);
        }
        let current = record.monitor.unwrap_or_else(|| self.backoff.start(now));
        record.monitor = Some(self.backoff.advance(&current, now));
        if record.reported_done.is_none() {
            record.reported_done = reported;
        }
        self.ctx.store.put_step(&record)?;
        Ok(outcome)
    }

    /// Commit a resolution: claim each artifact, enqueue its retrieval and
    /// complete the step, all under the step lock.
    fn complete(
        &self,
        step_id: StepId,
        resolution: Resolution,
    ) -> Result<PollOutcome, OrchestratorError> {
        let store = self.ctx.store.clone();
        let now = self.ctx.now_ms();
        let mut accepted = 0usize;
        let mut ambiguous = resolution.ambiguous;

        let transition = self.transition(step_id, StepStatus::Completed, |record| {
            for (position, candidate) in resolution.candidates.iter().enumerate() {
                let task_id = TaskId(store.next_id()?);
                let alternative = AlternativeRecord {
                    artifact_ref: candidate.artifact_ref.clone(),
                    step_id,
                    task_id,
                    position: position as u32,
                    selected: false,
                    tier: candidate.tier,
                    storage_handle: None,
                    created_at_ms: now,
                };
                if store.claim_artifact(&alternative)? {
                    self.retrieval.enqueue(
                        task_id,
                        step_id,
                        &candidate.artifact_ref,
                        Priority::Normal,
                    )?;
                    accepted += 1;
                    continue;
                }
                match store.get_alternative(&candidate.artifact_ref)? {
                    // Left over from an interrupted commit of this same step
                    Some(existing) if existing.step_id == step_id => {
                        if store.get_task(existing.task_id)?.is_none() {
                            self.retrieval.enqueue(
                                existing.task_id,
                                step_id,
                                &existing.artifact_ref,
                                Priority::Normal,
                            )?;
                        }
                        accepted += 1;
                    }
                    _ => {
                        debug!(
                            step_id = %step_id,
                            artifact_ref = %candidate.artifact_ref,
                            "Artifact claimed by another step, skipping"
                        );
                    }
                }
            }
            if accepted < record.expected_artifact_count as usize {
                ambiguous = true;
            }
            record.ambiguous_correlation = ambiguous;
            Ok(())
        })?;

        match transition {
            Transition::Applied(record) => {
                info!(
                    step_id = %step_id,
                    job_id = ?record.backend_job_id,
                    alternatives = accepted,
                    expected = record.expected_artifact_count,
                    ambiguous,
                    "Step completed"
                );
                Ok(PollOutcome::Completed {
                    alternatives: accepted,
                    ambiguous,
                })
            }
            Transition::Rejected(record) => {
                warn!(
                    step_id = %step_id,
                    status = record.status.as_str(),
                    "Completion lost to a concurrent transition"
                );
                Ok(PollOutcome::Rejected)
            }
        }
    }

    /// One monitoring sweep over every in-flight step.
    ///
    /// Failures of individual steps are logged and counted; they never abort
    /// the sweep.
    pub async fn sweep(&self) -> Result<MonitorSweepReport, OrchestratorError> {
        let now = self.ctx.now_ms();
        let mut due = Vec::new();
        for record in self.ctx.store.list_in_flight_steps()? {
            match record.status {
                // Submitted is only observable after a crash mid-submit
                StepStatus::Submitted => {
                    if let Err(e) = self.resume_monitoring(record.step_id, now) {
                        error!(step_id = %record.step_id, error = %e, "Failed to resume monitoring");
                    }
                }
                StepStatus::Monitoring => {
                    let next_poll = record.monitor.map_or(now, |m| m.next_poll_at_ms);
                    if next_poll <= now {
                        due.push((next_poll, record.step_id));
                    }
                }
                _ => {}
            }
        }

        due.sort();
        let cap = self.ctx.config.monitor.max_monitored_steps.max(1);
        due.truncate(cap);

        let outcomes: Vec<(StepId, Result<PollOutcome, OrchestratorError>)> = stream::iter(due)
            .map(|(_, step_id)| async move { (step_id, self.poll(step_id).await) })
            .buffer_unordered(cap)
            .collect()
            .await;

        let mut report = MonitorSweepReport::default();
        for (step_id, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(step_id = %step_id, error = %e, "Monitoring poll failed");
                    report.errors += 1;
                }
            }
        }
        self.ctx.locks.prune();
        if report.polled > 0 || report.errors > 0 {
            debug!(
                polled = report.polled,
                completed = report.completed,
                failed = report.failed,
                timed_out = report.timed_out,
                deferred = report.deferred,
                "Monitoring sweep finished"
            );
        }
        Ok(report)
    }

    fn resume_monitoring(&self, step_id: StepId, now: u64) -> Result<Transition, OrchestratorError> {
        let monitor = self.backoff.start(now);
        self.transition(step_id, StepStatus::Monitoring, |record| {
            record.monitor = Some(monitor);
            Ok(())
        })
    }

    /// Repair steps and tasks left mid-flight by a previous process.
    pub fn recover_interrupted(&self) -> Result<RecoveryReport, OrchestratorError> {
        let now = self.ctx.now_ms();
        let mut report = RecoveryReport::default();
        for record in self.ctx.store.list_in_flight_steps()? {
            match record.status {
                StepStatus::Submitting => {
                    // Backend acceptance is unknown; never resubmit silently
                    if self
                        .fail(
                            record.step_id,
                            StepErrorKind::SubmissionError,
                            "submission interrupted",
                        )?
                        .is_applied()
                    {
                        report.interrupted_submissions += 1;
                    }
                }
                StepStatus::Submitted => {
                    if self.resume_monitoring(record.step_id, now)?.is_applied() {
                        report.resumed_monitoring += 1;
                    }
                }
                _ => {}
            }
        }
        report.requeued_tasks = self.retrieval.recover()?;
        info!(
            interrupted_submissions = report.interrupted_submissions,
            resumed_monitoring = report.resumed_monitoring,
            requeued_tasks = report.requeued_tasks,
            "Recovery finished"
        );
        Ok(report)
    }
}

struct PollingGuard<'a> {
    polling: &'a Mutex<HashSet<StepId>>,
    step_id: StepId,
}

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        self.polling.lock().remove(&self.step_id);
    }
}

/// Images per job, from the `batch_size` parameter (default 1).
pub fn expected_artifact_count(parameters: &Parameters) -> Result<u32, OrchestratorError> {
    match parameters.get(PARAM_BATCH_SIZE) {
        None => Ok(1),
        Some(value) => value
            .as_u64()
            .filter(|n| *n >= 1)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "parameter '{}' must be a positive integer, got {}",
                    PARAM_BATCH_SIZE, value
                ))
            }),
    }
}

/// Fresh correlation token: 32 hex chars, unique per process and step.
pub fn generate_token(step_id: StepId, now_ms: u64) -> String {
    static NONCE: OnceLock<[u8; 32]> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nonce = NONCE.get_or_init(|| {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(
            &std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
                .to_le_bytes(),
        );
        *hasher.finalize().as_bytes()
    });
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = blake3::Hasher::new();
    hasher.update(nonce);
    hasher.update(&step_id.to_key());
    hasher.update(&counter.to_le_bytes());
    hasher.update(&now_ms.to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}
