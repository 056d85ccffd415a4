//! Integration tests for the background scheduler

use super::test_utils::Harness;
use darkroom::error::OrchestratorError;
use darkroom::gateway::JobStatus;
use darkroom::model::{StepStatus, TaskStatus};
use darkroom::workflow::{RetrievalQueue, StepMachine, WorkflowContext};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_scheduler_drives_step_to_stored_artifacts() {
    let h = Harness::with_config(|config| {
        config.scheduler.monitor_interval_ms = 10;
        config.scheduler.retrieval_interval_ms = 10;
    });
    let session = h.session();
    h.gateway.add_artifact("bg-1", None);
    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::done(Some(vec!["bg-1".to_string()])))]);
    let step = h.submitted_step(session.session_id, 1).await;

    h.orchestrator.start_scheduler().unwrap();
    assert!(h.orchestrator.scheduler_running());

    let started = Instant::now();
    loop {
        let stored = h
            .orchestrator
            .get_alternative("bg-1")
            .map(|a| a.is_realized())
            .unwrap_or(false);
        if stored || started.elapsed() > Duration::from_secs(5) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.orchestrator.stop_scheduler().await;
    assert!(!h.orchestrator.scheduler_running());

    assert_eq!(h.step(step.step_id).status, StepStatus::Completed);
    let alternative = h.orchestrator.get_alternative("bg-1").unwrap();
    assert!(alternative.is_realized());
    assert_eq!(
        h.orchestrator.get_task(alternative.task_id).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_scheduler_start_twice_conflicts() {
    let h = Harness::new();
    h.orchestrator.start_scheduler().unwrap();

    let again = h.orchestrator.start_scheduler();
    assert!(matches!(again, Err(OrchestratorError::Conflict(_))));

    h.orchestrator.stop_scheduler().await;
    // Stopping an idle scheduler is a no-op
    h.orchestrator.stop_scheduler().await;
    h.orchestrator.start_scheduler().unwrap();
    h.orchestrator.stop_scheduler().await;
}

#[tokio::test]
async fn test_sweep_once_reports_both_phases() {
    let h = Harness::new();
    let session = h.session();
    h.gateway.add_artifact("once-1", None);
    h.gateway
        .script_status("job-1", vec![Ok(JobStatus::done(Some(vec!["once-1".to_string()])))]);
    h.submitted_step(session.session_id, 1).await;

    let report = h.orchestrator.sweep_once().await.unwrap();
    assert_eq!(report.monitor.polled, 1);
    assert_eq!(report.monitor.completed, 1);
    assert_eq!(report.retrieval.attempted, 1);
    assert_eq!(report.retrieval.completed, 1);
}

#[tokio::test]
async fn test_monitor_sweep_respects_concurrency_cap() {
    let h = Harness::with_config(|config| config.monitor.max_monitored_steps = 2);
    let session = h.session();
    for _ in 0..3 {
        h.submitted_step(session.session_id, 1).await;
    }

    let first = h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(first.polled, 2);
    assert_eq!(first.pending, 2);

    // The step left out is still due and goes first next time
    let second = h.orchestrator.run_monitor_sweep().await.unwrap();
    assert_eq!(second.polled, 1);
    assert_eq!(h.gateway.status_count(), 3);
}

#[tokio::test]
async fn test_monitor_sweep_releases_step_locks() {
    let h = Harness::new();
    let ctx = Arc::new(WorkflowContext::new(
        h.config.clone(),
        h.store.clone(),
        h.gateway.clone(),
        h.storage.clone(),
        h.clock.clone(),
    ));
    let retrieval = Arc::new(RetrievalQueue::new(ctx.clone()));
    let machine = StepMachine::new(ctx.clone(), retrieval);

    let session = h.session();
    for _ in 0..3 {
        let step = h.create_step(session.session_id, None, 1);
        machine.submit(step.step_id).await.unwrap();
    }
    assert_eq!(ctx.locks.len(), 3);

    let report = machine.sweep().await.unwrap();
    assert_eq!(report.pending, 3);
    assert!(ctx.locks.is_empty());
}
