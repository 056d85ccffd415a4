//! Session/Tree Manager
//!
//! Sessions own a forest of steps stored arena-style: every step names its
//! parent by id. Placement is checked explicitly on every insertion, and
//! selection flips alternatives of one step in a single atomic batch.

use crate::error::OrchestratorError;
use crate::model::{
    AlternativeRecord, Parameters, SessionOrigin, SessionRecord, SessionStatus, StepRecord,
    TaskStatus,
};
use crate::store::RecordStore;
use crate::types::{SessionId, StepId};
use crate::workflow::step::{StepMachine, StepRequest};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

/// Check that a step `step_id` may hang under `parent` in `session_id`.
///
/// The parent must exist, belong to the same session, differ from the step
/// itself, and its ancestor chain must end at a root without revisiting a
/// step.
pub fn validate_placement(
    store: &dyn RecordStore,
    session_id: SessionId,
    step_id: StepId,
    parent: Option<StepId>,
) -> Result<(), OrchestratorError> {
    let Some(parent_id) = parent else {
        return Ok(());
    };
    if parent_id == step_id {
        return Err(OrchestratorError::Structural(format!(
            "step {} cannot be its own parent",
            step_id
        )));
    }

    let mut visited = HashSet::from([step_id]);
    let mut cursor = Some(parent_id);
    while let Some(current) = cursor {
        if !visited.insert(current) {
            return Err(OrchestratorError::Structural(format!(
                "placing step {} under {} would form a cycle at {}",
                step_id, parent_id, current
            )));
        }
        let record = store.get_step(current)?.ok_or_else(|| {
            OrchestratorError::Structural(format!("parent step {} does not exist", current))
        })?;
        if record.session_id != session_id {
            return Err(OrchestratorError::Structural(format!(
                "parent step {} belongs to {}, not {}",
                current, record.session_id, session_id
            )));
        }
        cursor = record.parent_step_id;
    }
    Ok(())
}

/// Position after the last existing sibling under `parent`.
pub fn next_sibling_position(
    store: &dyn RecordStore,
    session_id: SessionId,
    parent: Option<StepId>,
) -> Result<u32, OrchestratorError> {
    Ok(store
        .list_steps(session_id)?
        .iter()
        .filter(|step| step.parent_step_id == parent)
        .map(|step| step.sibling_position + 1)
        .max()
        .unwrap_or(0))
}

pub struct TreeManager {
    store: Arc<dyn RecordStore>,
    steps: Arc<StepMachine>,
}

impl TreeManager {
    pub fn new(steps: Arc<StepMachine>) -> Self {
        Self {
            store: steps.context().store.clone(),
            steps,
        }
    }

    pub fn start_session(&self, origin: SessionOrigin) -> Result<SessionRecord, OrchestratorError> {
        if let SessionOrigin::Derived { source_artifact_id } = &origin {
            if source_artifact_id.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "derived session needs a source artifact id".to_string(),
                ));
            }
        }
        let record = SessionRecord {
            session_id: SessionId(self.store.next_id()?),
            origin,
            status: SessionStatus::Active,
            created_at_ms: self.steps.context().now_ms(),
            completed_at_ms: None,
        };
        self.store.put_session(&record)?;
        info!(
            session_id = %record.session_id,
            source = ?record.origin.source_artifact_id(),
            "Session started"
        );
        Ok(record)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.store
            .get_session(session_id)?
            .ok_or(OrchestratorError::SessionNotFound(session_id))
    }

    pub fn complete_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.close_session(session_id, SessionStatus::Completed)
    }

    pub fn abandon_session(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.close_session(session_id, SessionStatus::Abandoned)
    }

    /// In-flight steps keep running after their session closes.
    fn close_session(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<SessionRecord, OrchestratorError> {
        let _structure = self.steps.context().structure_lock();
        let mut record = self.get_session(session_id)?;
        if record.status != SessionStatus::Active {
            return Err(OrchestratorError::Conflict(format!(
                "session {} is already {}",
                session_id,
                record.status.as_str()
            )));
        }
        record.status = status;
        record.completed_at_ms = Some(self.steps.context().now_ms());
        self.store.put_session(&record)?;
        info!(session_id = %session_id, status = status.as_str(), "Session closed");
        Ok(record)
    }

    /// Steps of a session, parents before children, siblings by position.
    pub fn session_tree(&self, session_id: SessionId) -> Result<Vec<StepRecord>, OrchestratorError> {
        self.get_session(session_id)?;
        let steps = self.store.list_steps(session_id)?;

        let mut children: BTreeMap<Option<StepId>, Vec<StepRecord>> = BTreeMap::new();
        for step in steps {
            children.entry(step.parent_step_id).or_default().push(step);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|s| (s.sibling_position, s.step_id));
        }

        let mut ordered = Vec::new();
        let mut queue: VecDeque<StepRecord> =
            children.remove(&None).unwrap_or_default().into();
        while let Some(step) = queue.pop_front() {
            if let Some(kids) = children.remove(&Some(step.step_id)) {
                queue.extend(kids);
            }
            ordered.push(step);
        }
        Ok(ordered)
    }

    /// New step under the step that produced `artifact_ref`.
    ///
    /// Prompt, negative prompt and parameters are inherited from the parent;
    /// `parameters` entries override the inherited ones key by key.
    pub fn branch(
        &self,
        artifact_ref: &str,
        prompt: Option<String>,
        parameters: Option<Parameters>,
    ) -> Result<StepRecord, OrchestratorError> {
        let alternative = self.get_alternative(artifact_ref)?;
        let parent = self.steps.context().load_step(alternative.step_id)?;

        let mut merged = parent.parameters.clone();
        if let Some(overrides) = parameters {
            merged.extend(overrides);
        }
        let request = StepRequest {
            session_id: parent.session_id,
            parent_step_id: Some(parent.step_id),
            prompt: prompt.unwrap_or_else(|| parent.prompt.clone()),
            negative_prompt: parent.negative_prompt.clone(),
            parameters: merged,
        };
        let record = self
            .steps
            .create_step_from(request, Some(artifact_ref.to_string()))?;
        info!(
            step_id = %record.step_id,
            parent_step_id = %parent.step_id,
            artifact_ref = %artifact_ref,
            "Branched from alternative"
        );
        Ok(record)
    }

    /// Select `artifact_ref`, deselecting any other alternative of its step.
    pub fn select(&self, artifact_ref: &str) -> Result<AlternativeRecord, OrchestratorError> {
        let target = self.get_alternative(artifact_ref)?;
        let task = self
            .store
            .get_task(target.task_id)?
            .ok_or(OrchestratorError::TaskNotFound(target.task_id))?;
        if task.status != TaskStatus::Completed || !target.is_realized() {
            return Err(OrchestratorError::Conflict(format!(
                "artifact {} is not stored yet (retrieval {})",
                artifact_ref,
                task.status.as_str()
            )));
        }

        let ctx = self.steps.context();
        let lock = ctx.locks.get_lock(target.step_id);
        let _guard = lock.write();

        let mut changed = Vec::new();
        let mut selected = None;
        for mut alternative in self.store.list_alternatives(target.step_id)? {
            let want = alternative.artifact_ref == artifact_ref;
            if alternative.selected != want {
                alternative.selected = want;
                changed.push(alternative.clone());
            }
            if want {
                selected = Some(alternative);
            }
        }
        self.store.put_alternatives(&changed)?;

        info!(
            step_id = %target.step_id,
            artifact_ref = %artifact_ref,
            "Alternative selected"
        );
        selected.ok_or_else(|| OrchestratorError::AlternativeNotFound(artifact_ref.to_string()))
    }

    pub fn get_alternative(&self, artifact_ref: &str) -> Result<AlternativeRecord, OrchestratorError> {
        self.store
            .get_alternative(artifact_ref)?
            .ok_or_else(|| OrchestratorError::AlternativeNotFound(artifact_ref.to_string()))
    }

    pub fn list_alternatives(&self, step_id: StepId) -> Result<Vec<AlternativeRecord>, OrchestratorError> {
        self.steps.context().load_step(step_id)?;
        Ok(self.store.list_alternatives(step_id)?)
    }
}
