//! Record Store
//!
//! Durable create/read/update storage for sessions, steps, alternatives and
//! retrieval tasks. The orchestrator only ever talks to [`RecordStore`].

pub mod persistence;

pub use persistence::SledRecordStore;

use crate::error::StorageError;
use crate::model::{AlternativeRecord, RetrievalTaskRecord, SessionRecord, StepRecord};
use crate::types::{SessionId, StepId, TaskId};

/// Record store interface
pub trait RecordStore: Send + Sync {
    /// Allocate a fresh, never reused identifier.
    fn next_id(&self) -> Result<u64, StorageError>;

    fn put_session(&self, record: &SessionRecord) -> Result<(), StorageError>;
    fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StorageError>;
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;

    fn put_step(&self, record: &StepRecord) -> Result<(), StorageError>;
    fn get_step(&self, step_id: StepId) -> Result<Option<StepRecord>, StorageError>;
    /// Steps of one session in creation order.
    fn list_steps(&self, session_id: SessionId) -> Result<Vec<StepRecord>, StorageError>;
    /// Steps in `submitting`, `submitted` or `monitoring`.
    fn list_in_flight_steps(&self) -> Result<Vec<StepRecord>, StorageError>;

    /// Insert an alternative only if no alternative exists for its artifact.
    ///
    /// Returns `false` when the artifact is already linked anywhere.
    fn claim_artifact(&self, record: &AlternativeRecord) -> Result<bool, StorageError>;
    fn get_alternative(&self, artifact_ref: &str) -> Result<Option<AlternativeRecord>, StorageError>;
    fn put_alternative(&self, record: &AlternativeRecord) -> Result<(), StorageError>;
    /// Write several alternatives atomically.
    fn put_alternatives(&self, records: &[AlternativeRecord]) -> Result<(), StorageError>;
    /// Alternatives of one step ordered by acceptance position.
    fn list_alternatives(&self, step_id: StepId) -> Result<Vec<AlternativeRecord>, StorageError>;

    fn put_task(&self, record: &RetrievalTaskRecord) -> Result<(), StorageError>;
    fn get_task(&self, task_id: TaskId) -> Result<Option<RetrievalTaskRecord>, StorageError>;
    /// Tasks that have not completed (pending, in progress, failed).
    fn list_open_tasks(&self) -> Result<Vec<RetrievalTaskRecord>, StorageError>;
    fn list_tasks(&self) -> Result<Vec<RetrievalTaskRecord>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

impl dyn RecordStore {
    pub fn is_claimed(&self, artifact_ref: &str) -> Result<bool, StorageError> {
        Ok(self.get_alternative(artifact_ref)?.is_some())
    }
}
