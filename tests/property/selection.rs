//! Property-based tests for alternative selection

use async_trait::async_trait;
use darkroom::artifacts::{ArtifactHandle, FsArtifactStorage};
use darkroom::clock::ManualClock;
use darkroom::config::DarkroomConfig;
use darkroom::error::GatewayError;
use darkroom::gateway::{ArtifactMetadata, BackendGateway, JobRequest, JobStatus};
use darkroom::model::{AlternativeRecord, CorrelationTier, RetrievalTaskRecord, TaskStatus};
use darkroom::store::{RecordStore, SledRecordStore};
use darkroom::types::{Priority, StepId, TaskId};
use darkroom::workflow::{RetrievalQueue, StepMachine, TreeManager, WorkflowContext};
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Backend that is never reachable; selection must not need it
struct OfflineGateway;

#[async_trait]
impl BackendGateway for OfflineGateway {
    async fn submit(&self, _request: &JobRequest) -> Result<String, GatewayError> {
        Err(GatewayError::RequestFailed("offline".to_string()))
    }

    async fn status(&self, _job_id: &str) -> Result<JobStatus, GatewayError> {
        Err(GatewayError::RequestFailed("offline".to_string()))
    }

    async fn list_recent(&self, _limit: usize) -> Result<Vec<String>, GatewayError> {
        Err(GatewayError::RequestFailed("offline".to_string()))
    }

    async fn metadata(&self, artifact_ref: &str) -> Result<ArtifactMetadata, GatewayError> {
        Err(GatewayError::NotFound(artifact_ref.to_string()))
    }

    async fn fetch(&self, artifact_ref: &str) -> Result<Vec<u8>, GatewayError> {
        Err(GatewayError::NotFound(artifact_ref.to_string()))
    }
}

/// Tree manager over a temporary store holding `count` stored alternatives of one step.
fn stored_alternatives(count: usize) -> (TreeManager, Arc<SledRecordStore>, Vec<String>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = Arc::new(SledRecordStore::new(db).unwrap());
    let storage = Arc::new(FsArtifactStorage::new(temp_dir.path()).unwrap());
    let ctx = Arc::new(WorkflowContext::new(
        DarkroomConfig::default(),
        store.clone(),
        Arc::new(OfflineGateway),
        storage,
        Arc::new(ManualClock::new(1_000)),
    ));
    let retrieval = Arc::new(RetrievalQueue::new(ctx.clone()));
    let tree = TreeManager::new(Arc::new(StepMachine::new(ctx, retrieval)));

    let step_id = StepId(1);
    let mut refs = Vec::new();
    for position in 0..count {
        let artifact_ref = format!("alt-{}", position);
        let task_id = TaskId(100 + position as u64);
        let handle = ArtifactHandle {
            key: artifact_ref.clone(),
            content_hash: format!("{:064x}", position),
            size_bytes: 1,
            path: PathBuf::from(format!("/tmp/{}.bin", artifact_ref)),
        };
        let alternative = AlternativeRecord {
            artifact_ref: artifact_ref.clone(),
            step_id,
            task_id,
            position: position as u32,
            selected: false,
            tier: CorrelationTier::Direct,
            storage_handle: Some(handle.clone()),
            created_at_ms: 1_000,
        };
        assert!(store.claim_artifact(&alternative).unwrap());
        store
            .put_task(&RetrievalTaskRecord {
                task_id,
                artifact_ref: artifact_ref.clone(),
                step_id,
                status: TaskStatus::Completed,
                attempts: 1,
                last_attempt_at_ms: Some(1_000),
                error_message: None,
                priority: Priority::Normal,
                handle: Some(handle),
                created_at_ms: 1_000,
            })
            .unwrap();
        refs.push(artifact_ref);
    }
    (tree, store, refs, temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever the order of selections, exactly the last one stays selected.
    #[test]
    fn at_most_one_alternative_selected(
        count in 1usize..6,
        picks in prop::collection::vec(0usize..6, 1..12),
    ) {
        let (tree, store, refs, _temp_dir) = stored_alternatives(count);

        for pick in picks {
            let target = &refs[pick % count];
            let selected = tree.select(target).unwrap();
            prop_assert!(selected.selected);

            let chosen: Vec<String> = store
                .list_alternatives(StepId(1))
                .unwrap()
                .into_iter()
                .filter(|a| a.selected)
                .map(|a| a.artifact_ref)
                .collect();
            prop_assert_eq!(chosen, vec![target.clone()]);
        }
    }
}
