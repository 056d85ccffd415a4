//! Integration tests for sessions and the step tree
//!
//! Tests cover:
//! - Session lifecycle
//! - Sibling positions and parent-first ordering
//! - Structural violations
//! - Branching from alternatives

use super::test_utils::{request, Harness};
use darkroom::error::OrchestratorError;
use darkroom::gateway::JobStatus;
use darkroom::model::{SessionOrigin, SessionStatus, StepStatus};
use darkroom::types::StepId;
use serde_json::json;

#[tokio::test]
async fn test_session_lifecycle() {
    let h = Harness::new();
    let derived = h
        .orchestrator
        .start_session(SessionOrigin::Derived {
            source_artifact_id: "gallery-0042".to_string(),
        })
        .unwrap();
    assert_eq!(derived.status, SessionStatus::Active);
    assert_eq!(derived.origin.source_artifact_id(), Some("gallery-0042"));

    let blank = h.orchestrator.start_session(SessionOrigin::Derived {
        source_artifact_id: "  ".to_string(),
    });
    assert!(matches!(blank, Err(OrchestratorError::Validation(_))));

    let closed = h.orchestrator.complete_session(derived.session_id).unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.completed_at_ms.is_some());

    let twice = h.orchestrator.abandon_session(derived.session_id);
    assert!(matches!(twice, Err(OrchestratorError::Conflict(_))));

    let late = h.orchestrator.create_step(request(derived.session_id, None, 1));
    assert!(matches!(late, Err(OrchestratorError::Validation(_))));

    assert_eq!(h.orchestrator.list_sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn test_sibling_positions_and_tree_order() {
    let h = Harness::new();
    let session = h.session();
    let root = h.create_step(session.session_id, None, 1);
    let second_root = h.create_step(session.session_id, None, 1);
    let child_a = h.create_step(session.session_id, Some(root.step_id), 1);
    let child_b = h.create_step(session.session_id, Some(root.step_id), 1);
    let grandchild = h.create_step(session.session_id, Some(child_a.step_id), 1);

    assert_eq!(root.sibling_position, 0);
    assert_eq!(second_root.sibling_position, 1);
    assert_eq!(child_a.sibling_position, 0);
    assert_eq!(child_b.sibling_position, 1);
    assert_eq!(grandchild.sibling_position, 0);

    let order: Vec<StepId> = h
        .orchestrator
        .session_tree(session.session_id)
        .unwrap()
        .into_iter()
        .map(|s| s.step_id)
        .collect();
    assert_eq!(
        order,
        vec![
            root.step_id,
            second_root.step_id,
            child_a.step_id,
            child_b.step_id,
            grandchild.step_id,
        ]
    );
}

#[tokio::test]
async fn test_structural_violations_are_rejected() {
    let h = Harness::new();
    let first = h.session();
    let second = h.session();
    let foreign_parent = h.create_step(second.session_id, None, 1);

    let cross = h
        .orchestrator
        .create_step(request(first.session_id, Some(foreign_parent.step_id), 1));
    assert!(matches!(cross, Err(OrchestratorError::Structural(_))));

    let dangling = h
        .orchestrator
        .create_step(request(first.session_id, Some(StepId(777_777)), 1));
    assert!(matches!(dangling, Err(OrchestratorError::Structural(_))));

    assert!(h.orchestrator.session_tree(first.session_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_branch_inherits_and_overrides() {
    let h = Harness::new();
    let session = h.session();
    let parent = h.completed_step(session.session_id, None, &["base-img"]).await;
    h.orchestrator.run_retrieval_sweep().await.unwrap();

    let mut overrides = darkroom::model::Parameters::new();
    overrides.insert("seed".to_string(), json!(1234));
    let branch = h
        .orchestrator
        .branch("base-img", None, Some(overrides))
        .unwrap();

    assert_eq!(branch.status, StepStatus::Created);
    assert_eq!(branch.parent_step_id, Some(parent.step_id));
    assert_eq!(branch.session_id, session.session_id);
    assert_eq!(branch.branched_from.as_deref(), Some("base-img"));
    assert_eq!(branch.prompt, parent.prompt);
    assert_eq!(branch.parameters["seed"], json!(1234));
    assert_eq!(branch.model(), Some("sdxl-base"));

    let reprompted = h
        .orchestrator
        .branch("base-img", Some("the same lighthouse in fog".to_string()), None)
        .unwrap();
    assert_eq!(reprompted.prompt, "the same lighthouse in fog");
    assert_eq!(reprompted.sibling_position, 1);

    let missing = h.orchestrator.branch("never-seen", None, None);
    assert!(matches!(missing, Err(OrchestratorError::AlternativeNotFound(_))));
}

#[tokio::test]
async fn test_in_flight_step_survives_session_close() {
    let h = Harness::new();
    let session = h.session();
    h.gateway.add_artifact("after-close", None);
    h.gateway.script_status(
        "job-1",
        vec![Ok(JobStatus::done(Some(vec!["after-close".to_string()])))],
    );
    let step = h.submitted_step(session.session_id, 1).await;

    h.orchestrator.complete_session(session.session_id).unwrap();
    let done = h.monitor_until_terminal(step.step_id, 5).await;

    assert_eq!(done.status, StepStatus::Completed);
    assert_eq!(h.orchestrator.list_alternatives(step.step_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_step_view_lists_alternatives() {
    let h = Harness::new();
    let session = h.session();
    let step = h.completed_step(session.session_id, None, &["v-1", "v-2"]).await;

    let view = h.orchestrator.step_view(step.step_id).unwrap();
    assert_eq!(view.step.step_id, step.step_id);
    let positions: Vec<u32> = view.alternatives.iter().map(|a| a.position).collect();
    assert_eq!(positions, vec![0, 1]);

    let missing = h.orchestrator.step_view(StepId(31_337));
    assert!(matches!(missing, Err(OrchestratorError::StepNotFound(_))));
}
