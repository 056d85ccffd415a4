//! Per-step mutual exclusion
//!
//! Every state transition on a Step runs under that Step's write lock, so a
//! caller's `abandon` and a sweep-driven completion serialize: whichever
//! acquires the lock first applies, and the other re-reads a terminal record
//! and is rejected. Guards are never held across an `.await`.

use crate::types::StepId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct StepLockManager {
    locks: Mutex<HashMap<StepId, Arc<RwLock<()>>>>,
}

impl StepLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `step_id`, created on first use.
    pub fn get_lock(&self, step_id: StepId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(step_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop lock entries for steps nobody currently holds.
    pub fn prune(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
