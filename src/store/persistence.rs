//! Sled-backed persistence for orchestrator records
//!
//! One tree per entity, plus derived index trees:
//! - `session_steps`: session key ++ step key
//! - `in_flight_steps`: step key, for steps the monitor sweep must visit
//! - `step_alternatives`: step key ++ artifact ref
//! - `open_tasks`: task key, for tasks that have not completed
//!
//! Records are authoritative; readers re-check status when walking an index.

use crate::error::StorageError;
use crate::model::{AlternativeRecord, RetrievalTaskRecord, SessionRecord, StepRecord, TaskStatus};
use crate::store::RecordStore;
use crate::types::{SessionId, StepId, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::io;
use std::path::Path;

const TREE_SESSIONS: &str = "sessions";
const TREE_STEPS: &str = "steps";
const TREE_SESSION_STEPS: &str = "session_steps";
const TREE_IN_FLIGHT: &str = "in_flight_steps";
const TREE_ALTERNATIVES: &str = "alternatives";
const TREE_STEP_ALTERNATIVES: &str = "step_alternatives";
const TREE_TASKS: &str = "tasks";
const TREE_OPEN_TASKS: &str = "open_tasks";

/// Sled-based implementation of RecordStore
#[derive(Clone)]
pub struct SledRecordStore {
    db: Db,
    sessions: Tree,
    steps: Tree,
    session_steps: Tree,
    in_flight: Tree,
    alternatives: Tree,
    step_alternatives: Tree,
    tasks: Tree,
    open_tasks: Tree,
}

impl SledRecordStore {
    /// Open (or create) a store at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to open sled database at {:?}: {}", path.as_ref(), e),
            ))
        })?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            sessions: db.open_tree(TREE_SESSIONS).map_err(to_storage_io)?,
            steps: db.open_tree(TREE_STEPS).map_err(to_storage_io)?,
            session_steps: db.open_tree(TREE_SESSION_STEPS).map_err(to_storage_io)?,
            in_flight: db.open_tree(TREE_IN_FLIGHT).map_err(to_storage_io)?,
            alternatives: db.open_tree(TREE_ALTERNATIVES).map_err(to_storage_io)?,
            step_alternatives: db.open_tree(TREE_STEP_ALTERNATIVES).map_err(to_storage_io)?,
            tasks: db.open_tree(TREE_TASKS).map_err(to_storage_io)?,
            open_tasks: db.open_tree(TREE_OPEN_TASKS).map_err(to_storage_io)?,
            db,
        })
    }

    /// Get the underlying sled database
    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl RecordStore for SledRecordStore {
    fn next_id(&self) -> Result<u64, StorageError> {
        // generate_id starts at 0; keep 0 free so it never shows up in logs as an id
        Ok(self.db.generate_id().map_err(to_storage_io)? + 1)
    }

    fn put_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        put_json(&self.sessions, &record.session_id.to_key(), record)
    }

    fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        get_json(&self.sessions, &session_id.to_key())
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.sessions.iter() {
            let (_, value) = result.map_err(to_storage_io)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn put_step(&self, record: &StepRecord) -> Result<(), StorageError> {
        let key = record.step_id.to_key();
        put_json(&self.steps, &key, record)?;

        let index_key = compound_key(&record.session_id.to_key(), &key);
        self.session_steps
            .insert(index_key, &[] as &[u8])
            .map_err(to_storage_io)?;

        if record.status.is_in_flight() {
            self.in_flight.insert(key, &[] as &[u8]).map_err(to_storage_io)?;
        } else {
            self.in_flight.remove(key).map_err(to_storage_io)?;
        }
        Ok(())
    }

    fn get_step(&self, step_id: StepId) -> Result<Option<StepRecord>, StorageError> {
        get_json(&self.steps, &step_id.to_key())
    }

    fn list_steps(&self, session_id: SessionId) -> Result<Vec<StepRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.session_steps.scan_prefix(session_id.to_key()) {
            let (key, _) = result.map_err(to_storage_io)?;
            let Some(step_id) = StepId::from_key(&key[8..]) else {
                continue;
            };
            if let Some(step) = self.get_step(step_id)? {
                out.push(step);
            }
        }
        Ok(out)
    }

    fn list_in_flight_steps(&self) -> Result<Vec<StepRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.in_flight.iter() {
            let (key, _) = result.map_err(to_storage_io)?;
            let Some(step_id) = StepId::from_key(&key) else {
                continue;
            };
            if let Some(step) = self.get_step(step_id)? {
                if step.status.is_in_flight() {
                    out.push(step);
                }
            }
        }
        Ok(out)
    }

    fn claim_artifact(&self, record: &AlternativeRecord) -> Result<bool, StorageError> {
        let value = encode(record)?;
        let swapped = self
            .alternatives
            .compare_and_swap(
                record.artifact_ref.as_bytes(),
                None as Option<&[u8]>,
                Some(value),
            )
            .map_err(to_storage_io)?;
        if swapped.is_err() {
            return Ok(false);
        }
        self.step_alternatives
            .insert(
                compound_key(&record.step_id.to_key(), record.artifact_ref.as_bytes()),
                &[] as &[u8],
            )
            .map_err(to_storage_io)?;
        Ok(true)
    }

    fn get_alternative(&self, artifact_ref: &str) -> Result<Option<AlternativeRecord>, StorageError> {
        get_json(&self.alternatives, artifact_ref.as_bytes())
    }

    fn put_alternative(&self, record: &AlternativeRecord) -> Result<(), StorageError> {
        self.put_alternatives(std::slice::from_ref(record))
    }

    fn put_alternatives(&self, records: &[AlternativeRecord]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for record in records {
            batch.insert(record.artifact_ref.as_bytes(), encode(record)?);
        }
        self.alternatives.apply_batch(batch).map_err(to_storage_io)?;

        for record in records {
            self.step_alternatives
                .insert(
                    compound_key(&record.step_id.to_key(), record.artifact_ref.as_bytes()),
                    &[] as &[u8],
                )
                .map_err(to_storage_io)?;
        }
        Ok(())
    }

    fn list_alternatives(&self, step_id: StepId) -> Result<Vec<AlternativeRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.step_alternatives.scan_prefix(step_id.to_key()) {
            let (key, _) = result.map_err(to_storage_io)?;
            let artifact_ref = String::from_utf8_lossy(&key[8..]).to_string();
            if let Some(alt) = self.get_alternative(&artifact_ref)? {
                out.push(alt);
            }
        }
        out.sort_by_key(|a| a.position);
        Ok(out)
    }

    fn put_task(&self, record: &RetrievalTaskRecord) -> Result<(), StorageError> {
        let key = record.task_id.to_key();
        put_json(&self.tasks, &key, record)?;
        if record.status == TaskStatus::Completed {
            self.open_tasks.remove(key).map_err(to_storage_io)?;
        } else {
            self.open_tasks.insert(key, &[] as &[u8]).map_err(to_storage_io)?;
        }
        Ok(())
    }

    fn get_task(&self, task_id: TaskId) -> Result<Option<RetrievalTaskRecord>, StorageError> {
        get_json(&self.tasks, &task_id.to_key())
    }

    fn list_open_tasks(&self) -> Result<Vec<RetrievalTaskRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.open_tasks.iter() {
            let (key, _) = result.map_err(to_storage_io)?;
            let Some(task_id) = TaskId::from_key(&key) else {
                continue;
            };
            if let Some(task) = self.get_task(task_id)? {
                if task.status != TaskStatus::Completed {
                    out.push(task);
                }
            }
        }
        Ok(out)
    }

    fn list_tasks(&self) -> Result<Vec<RetrievalTaskRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.tasks.iter() {
            let (_, value) = result.map_err(to_storage_io)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }
}

fn compound_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn put_json<T: Serialize>(tree: &Tree, key: &[u8], record: &T) -> Result<(), StorageError> {
    tree.insert(key, encode(record)?).map_err(to_storage_io)?;
    Ok(())
}

fn get_json<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, StorageError> {
    let Some(raw) = tree.get(key).map_err(to_storage_io)? else {
        return Ok(None);
    };
    Ok(Some(decode(&raw)?))
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(to_storage_data)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(raw).map_err(to_storage_data)
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
