//! Generation workflow
//!
//! The step state machine, correlation engine, retrieval queue, tree manager
//! and scheduler. All components share one [`WorkflowContext`] holding the
//! collaborators (record store, backend gateway, artifact sink, clock) and
//! the per-step locks.

pub mod backoff;
pub mod correlation;
pub mod retrieval;
pub mod scheduler;
pub mod step;
pub mod tree;

pub use backoff::BackoffPolicy;
pub use correlation::{CorrelationEngine, Resolution};
pub use retrieval::{RetrievalQueue, RetrievalStats, RetrievalSweepReport};
pub use scheduler::Scheduler;
pub use step::{MonitorSweepReport, PollOutcome, RecoveryReport, StepMachine, StepRequest};
pub use tree::TreeManager;

use crate::artifacts::ArtifactSink;
use crate::clock::Clock;
use crate::concurrency::StepLockManager;
use crate::config::DarkroomConfig;
use crate::error::OrchestratorError;
use crate::gateway::BackendGateway;
use crate::model::StepRecord;
use crate::store::RecordStore;
use crate::types::StepId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Collaborators and shared state of the workflow components
pub struct WorkflowContext {
    pub store: Arc<dyn RecordStore>,
    pub gateway: Arc<dyn BackendGateway>,
    pub sink: Arc<dyn ArtifactSink>,
    pub clock: Arc<dyn Clock>,
    pub locks: StepLockManager,
    pub config: DarkroomConfig,
    /// Serializes tree insertions (placement checks and sibling positions)
    structure: Mutex<()>,
}

impl WorkflowContext {
    pub fn new(
        config: DarkroomConfig,
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn BackendGateway>,
        sink: Arc<dyn ArtifactSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            sink,
            clock,
            locks: StepLockManager::new(),
            config,
            structure: Mutex::new(()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn load_step(&self, step_id: StepId) -> Result<StepRecord, OrchestratorError> {
        self.store
            .get_step(step_id)?
            .ok_or(OrchestratorError::StepNotFound(step_id))
    }

    pub(crate) fn structure_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.structure.lock()
    }
}
