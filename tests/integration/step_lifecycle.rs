//! Integration tests for the step state machine
//!
//! Tests cover:
//! - Submission, monitoring and completion with direct references
//! - Backend refusals and job failures
//! - Deadline expiry
//! - Abandon and resubmit
//! - Input validation

use super::test_utils::{request, Harness};
use darkroom::error::{GatewayError, OrchestratorError};
use darkroom::gateway::JobStatus;
use darkroom::model::{CorrelationTier, StepErrorKind, StepStatus, TaskStatus, PARAM_BATCH_SIZE};
use darkroom::workflow::correlation::marker;
use darkroom::workflow::{PollOutcome, RetrievalQueue, StepMachine, WorkflowContext};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_pending_polls_then_direct_completion() {
    let h = Harness::new();
    let session = h.session();
    h.gateway.add_artifact("img-a", None);
    h.gateway.add_artifact("img-b", None);
    h.gateway.script_status(
        "job-1",
        vec![
            Ok(JobStatus::pending()),
            Ok(JobStatus::pending()),
            Ok(JobStatus::pending()),
            Ok(JobStatus::done(Some(vec!["img-a".to_string(), "img-b".to_string()]))),
        ],
    );

    let step = h.create_step(session.session_id, None, 2);
    assert_eq!(step.status, StepStatus::Created);
    assert_eq!(step.expected_artifact_count, 2);
    assert_eq!(h.gateway.submit_count(), 0);

    let submitted = h.orchestrator.submit(step.step_id).await.unwrap();
    assert_eq!(submitted.status, StepStatus::Monitoring);
    assert_eq!(submitted.backend_job_id.as_deref(), Some("job-1"));
    assert!(submitted.submitted_at_ms.is_some());

    let sent = h.gateway.submitted();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].prompt.contains(&marker(&step.correlation_token)));
    assert_eq!(sent[0].correlation_token, step.correlation_token);
    assert_eq!(sent[0].model, "sdxl-base");

    let done = h.monitor_until_terminal(step.step_id, 60).await;
    assert_eq!(done.status, StepStatus::Completed);
    assert!(!done.ambiguous_correlation);
    assert!(done.monitor.is_none());
    assert!(done.completed_at_ms.is_some());
    assert_eq!(h.gateway.status_count(), 4);

    let alternatives = h.orchestrator.list_alternatives(step.step_id).unwrap();
    let refs: Vec<&str> = alternatives.iter().map(|a| a.artifact_ref.as_str()).collect();
    assert_eq!(refs, vec!["img-a", "img-b"]);
    assert!(alternatives.iter().all(|a| a.tier == CorrelationTier::Direct));
    assert!(alternatives.iter().all(|a| !a.is_realized() && !a.selected));

    let tasks = h.orchestrator.list_tasks(true).unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending && t.step_id == step.step_id));
}

#[tokio::test]
async fn test_done_without_results_completes_ambiguous() {
    let h = Harness::new();
    let session = h.session();
    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::done(Some(Vec::new())))]);

    let step = h.submitted_step(session.session_id, 1).await;
    let done = h.monitor_until_terminal(step.step_id, 5).await;

    assert_eq!(done.status, StepStatus::Completed);
    assert!(done.ambiguous_correlation);
    assert!(h.orchestrator.list_alternatives(step.step_id).unwrap().is_empty());
    assert!(h.orchestrator.list_tasks(true).unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_refusal_fails_step_without_tasks() {
    let h = Harness::new();
    let session = h.session();
    h.gateway
        .fail_next_submit(GatewayError::Rejected("model not loaded".to_string()));

    let step = h.create_step(session.session_id, None, 1);
    let failed = h.orchestrator.submit(step.step_id).await.unwrap();

    assert_eq!(failed.status, StepStatus::Failed);
    let error = failed.error.unwrap();
    assert_eq!(error.kind, StepErrorKind::SubmissionError);
    assert!(error.message.contains("model not loaded"));
    assert!(failed.backend_job_id.is_none());
    assert!(h.orchestrator.list_tasks(true).unwrap().is_empty());

    // Never retried automatically
    h.orchestrator.sweep_once().await.unwrap();
    assert_eq!(h.gateway.submit_count(), 1);
    assert_eq!(h.gateway.status_count(), 0);
}

#[tokio::test]
async fn test_backend_job_failure_is_recorded() {
    let h = Harness::new();
    let session = h.session();
    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::failed("out of VRAM"))]);

    let step = h.submitted_step(session.session_id, 1).await;
    let report = h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.step(step.step_id);
    assert_eq!(failed.status, StepStatus::Failed);
    let error = failed.error.unwrap();
    assert_eq!(error.kind, StepErrorKind::BackendJobError);
    assert_eq!(error.message, "out of VRAM");
}

#[tokio::test]
async fn test_deadline_expiry_times_out_and_stops_polling() {
    let h = Harness::with_config(|config| config.monitor.deadline_secs = 60);
    let session = h.session();
    let step = h.submitted_step(session.session_id, 1).await;

    let timed_out = h.monitor_until_terminal(step.step_id, 120).await;
    assert_eq!(timed_out.status, StepStatus::Failed);
    assert_eq!(timed_out.error.unwrap().kind, StepErrorKind::Timeout);
    // Polls at 0s, 2s, 6s, 14s and 30s; the 60s sweep expires the step
    assert_eq!(h.gateway.status_count(), 5);

    h.advance(Duration::from_secs(120));
    h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(h.gateway.status_count(), 5);
    assert!(h.orchestrator.list_tasks(true).unwrap().is_empty());
}

#[tokio::test]
async fn test_status_errors_defer_without_failing() {
    let h = Harness::new();
    let session = h.session();
    h.gateway.script_status(
        "job-1",
        vec![
            Err(GatewayError::RequestFailed("connection refused".to_string())),
            Ok(JobStatus::done(Some(Vec::new()))),
        ],
    );

    let step = h.submitted_step(session.session_id, 1).await;
    let report = h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(report.deferred, 1);

    let deferred = h.step(step.step_id);
    assert_eq!(deferred.status, StepStatus::Monitoring);
    assert_eq!(deferred.monitor.unwrap().polls, 1);

    let done = h.monitor_until_terminal(step.step_id, 10).await;
    assert_eq!(done.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_abandon_stops_monitoring() {
    let h = Harness::new();
    let session = h.session();
    let step = h.submitted_step(session.session_id, 1).await;

    let abandoned = h.orchestrator.abandon(step.step_id).unwrap();
    assert_eq!(abandoned.status, StepStatus::Failed);
    assert_eq!(abandoned.error.unwrap().kind, StepErrorKind::Cancelled);

    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::done(Some(vec!["late".to_string()])))]);
    h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(h.gateway.status_count(), 0);
    assert!(h.orchestrator.list_alternatives(step.step_id).unwrap().is_empty());

    let again = h.orchestrator.abandon(step.step_id);
    assert!(matches!(again, Err(OrchestratorError::Conflict(_))));
}

#[tokio::test]
async fn test_abandon_during_poll_wins_over_completion() {
    let h = Harness::new();
    let ctx = Arc::new(WorkflowContext::new(
        h.config.clone(),
        h.store.clone(),
        h.gateway.clone(),
        h.storage.clone(),
        h.clock.clone(),
    ));
    let retrieval = Arc::new(RetrievalQueue::new(ctx.clone()));
    let machine = StepMachine::new(ctx, retrieval);

    let session = h.session();
    h.gateway.add_artifact("raced", None);
    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::done(Some(vec!["raced".to_string()])))]);
    let step = h.create_step(session.session_id, None, 1);
    machine.submit(step.step_id).await.unwrap();

    let gate = h.gateway.hold_status();
    let (outcome, abandoned) = tokio::join!(machine.poll(step.step_id), async {
        gate.entered.notified().await;
        let abandoned = machine.abandon(step.step_id);
        gate.release.notify_one();
        abandoned
    });

    assert_eq!(abandoned.unwrap().status, StepStatus::Failed);
    assert_eq!(outcome.unwrap(), PollOutcome::Rejected);

    let record = h.step(step.step_id);
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.error.unwrap().kind, StepErrorKind::Cancelled);
    assert!(h.orchestrator.list_alternatives(step.step_id).unwrap().is_empty());
    assert!(h.orchestrator.list_tasks(true).unwrap().is_empty());
    assert!(h.orchestrator.get_alternative("raced").is_err());
}

#[tokio::test]
async fn test_abandon_requires_in_flight_step() {
    let h = Harness::new();
    let session = h.session();
    let step = h.create_step(session.session_id, None, 1);

    let result = h.orchestrator.abandon(step.step_id);
    assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
    assert_eq!(h.step(step.step_id).status, StepStatus::Created);
}

#[tokio::test]
async fn test_submit_only_from_created() {
    let h = Harness::new();
    let session = h.session();
    let step = h.submitted_step(session.session_id, 1).await;

    let result = h.orchestrator.submit(step.step_id).await;
    assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
    assert_eq!(h.gateway.submit_count(), 1);
}

#[tokio::test]
async fn test_resubmit_creates_sibling() {
    let h = Harness::new();
    let session = h.session();
    let root = h.completed_step(session.session_id, None, &["root-img"]).await;

    h.gateway
        .fail_next_submit(GatewayError::RequestFailed("backend offline".to_string()));
    let child = h.create_step(session.session_id, Some(root.step_id), 1);
    let failed = h.orchestrator.submit(child.step_id).await.unwrap();
    assert_eq!(failed.status, StepStatus::Failed);

    let retry = h.orchestrator.resubmit(child.step_id).await.unwrap();
    assert_ne!(retry.step_id, child.step_id);
    assert_eq!(retry.status, StepStatus::Monitoring);
    assert_eq!(retry.parent_step_id, Some(root.step_id));
    assert_eq!(retry.sibling_position, child.sibling_position + 1);
    assert_eq!(retry.prompt, child.prompt);
    assert_ne!(retry.correlation_token, child.correlation_token);

    // The failed step stays as it was
    assert_eq!(h.step(child.step_id).status, StepStatus::Failed);

    let result = h.orchestrator.resubmit(retry.step_id).await;
    assert!(matches!(result, Err(OrchestratorError::Conflict(_))));
}

#[tokio::test]
async fn test_create_step_validation() {
    let h = Harness::new();
    let session = h.session();

    let mut blank = request(session.session_id, None, 1);
    blank.prompt = "   ".to_string();
    assert!(matches!(
        h.orchestrator.create_step(blank),
        Err(OrchestratorError::Validation(_))
    ));

    let mut no_model = request(session.session_id, None, 1);
    no_model.parameters.remove("model");
    assert!(matches!(
        h.orchestrator.create_step(no_model),
        Err(OrchestratorError::Validation(_))
    ));

    let mut zero_batch = request(session.session_id, None, 1);
    zero_batch
        .parameters
        .insert(PARAM_BATCH_SIZE.to_string(), serde_json::json!(0));
    assert!(matches!(
        h.orchestrator.create_step(zero_batch),
        Err(OrchestratorError::Validation(_))
    ));

    let missing = darkroom::types::SessionId(9_999);
    assert!(matches!(
        h.orchestrator.create_step(request(missing, None, 1)),
        Err(OrchestratorError::SessionNotFound(_))
    ));

    assert!(h.orchestrator.session_tree(session.session_id).unwrap().is_empty());
    assert_eq!(h.gateway.submit_count(), 0);
}

#[tokio::test]
async fn test_tokens_are_unique_per_step() {
    let h = Harness::new();
    let session = h.session();
    let a = h.create_step(session.session_id, None, 1);
    let b = h.create_step(session.session_id, None, 1);

    assert_ne!(a.correlation_token, b.correlation_token);
    assert_eq!(a.correlation_token.len(), 32);
}
