//! Execution guard — at most one in-flight execution per task.
//!
//! `try_begin` is an atomic check-and-set. The returned permit releases the
//! slot when dropped, so every exit path (success, error, panic unwind,
//! cancellation) frees it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Shared set of task ids currently executing, with their start times.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    slots: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `task_id`, or `None` if an execution is in flight.
    pub fn try_begin(&self, task_id: &str) -> Option<ExecutionPermit> {
        let mut slots = self.slots.lock();
        if slots.contains_key(task_id) {
            return None;
        }
        slots.insert(task_id.to_string(), Utc::now());
        Some(ExecutionPermit {
            guard: self.clone(),
            task_id: task_id.to_string(),
        })
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.slots.lock().contains_key(task_id)
    }

    /// When the current execution of `task_id` started.
    pub fn started_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.slots.lock().get(task_id).copied()
    }

    /// Ids of all tasks currently executing, sorted.
    pub fn executing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn release(&self, task_id: &str) {
        self.slots.lock().remove(task_id);
    }
}

/// Proof of holding a task's execution slot.
#[derive(Debug)]
pub struct ExecutionPermit {
    guard: ExecutionGuard,
    task_id: String,
}

impl ExecutionPermit {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.guard.release(&self.task_id);
    }
}
