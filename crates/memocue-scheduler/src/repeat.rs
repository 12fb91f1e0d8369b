//! Repeat-sender — multi-shot delivery bursts with cooperative cancellation.
//!
//! A task with repeat enabled is delivered `count` times, `interval` apart.
//! Each run owns a [`CancellationToken`]; aborting cancels it, which wakes
//! every pending wait at once instead of letting a sleeping burst linger for
//! minutes after its task was removed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use memocue_core::types::Task;

/// How many attempts a run makes and how far apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatPlan {
    pub count: u32,
    pub interval: Duration,
}

impl RepeatPlan {
    /// One attempt, no waiting.
    pub fn single() -> Self {
        Self {
            count: 1,
            interval: Duration::ZERO,
        }
    }

    /// Derive the plan for `task`. Hourly and cron tasks never repeat.
    pub fn for_task(task: &Task, default_interval_minutes: u32) -> Self {
        if !task.repeat.enabled || !task.schedule.allows_repeat() {
            return Self::single();
        }
        let minutes = match task.repeat.interval_minutes {
            0 => default_interval_minutes,
            m => m,
        };
        Self {
            count: task.repeat.count.max(1),
            interval: Duration::from_secs(u64::from(minutes) * 60),
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.count > 1
    }
}

/// Snapshot of a run in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatProgress {
    pub task_id: String,
    pub total_count: u32,
    pub current_count: u32,
    pub interval_secs: u64,
    pub aborted: bool,
    pub pending_waits: usize,
}

#[derive(Debug)]
struct RepeatState {
    run_id: u64,
    plan: RepeatPlan,
    current_count: u32,
    token: CancellationToken,
    waits: HashMap<u64, CancellationToken>,
}

/// Registry of active repeat runs, at most one per task.
#[derive(Debug, Clone, Default)]
pub struct RepeatSender {
    runs: Arc<Mutex<HashMap<String, RepeatState>>>,
    ids: Arc<AtomicU64>,
}

impl RepeatSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run for `task_id`. `None` if one is already active.
    pub fn begin(&self, task_id: &str, plan: RepeatPlan) -> Option<RepeatRun> {
        let mut runs = self.runs.lock();
        if runs.contains_key(task_id) {
            return None;
        }
        let run_id = self.ids.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        runs.insert(
            task_id.to_string(),
            RepeatState {
                run_id,
                plan,
                current_count: 0,
                token: token.clone(),
                waits: HashMap::new(),
            },
        );
        if plan.is_repeating() {
            tracing::info!(
                "🔁 Repeat send started for {}: {} attempts every {}s",
                task_id,
                plan.count,
                plan.interval.as_secs()
            );
        }
        Some(RepeatRun {
            sender: self.clone(),
            task_id: task_id.to_string(),
            run_id,
            token,
            plan,
        })
    }

    /// Abort the run for `task_id`, cancelling any wait in progress.
    /// Returns whether a run was active.
    pub fn abort(&self, task_id: &str) -> bool {
        let mut runs = self.runs.lock();
        let Some(state) = runs.get_mut(task_id) else {
            return false;
        };
        state.token.cancel();
        state.waits.clear();
        tracing::info!(
            "🛑 Repeat send aborted for {} after {}/{} attempts",
            task_id,
            state.current_count,
            state.plan.count
        );
        true
    }

    /// Abort every active run. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let ids = self.active();
        ids.iter().filter(|id| self.abort(id)).count()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.runs.lock().contains_key(task_id)
    }

    /// Ids of tasks with an active run, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn progress(&self, task_id: &str) -> Option<RepeatProgress> {
        self.runs.lock().get(task_id).map(|state| RepeatProgress {
            task_id: task_id.to_string(),
            total_count: state.plan.count,
            current_count: state.current_count,
            interval_secs: state.plan.interval.as_secs(),
            aborted: state.token.is_cancelled(),
            pending_waits: state.waits.len(),
        })
    }

    fn with_state<F>(&self, task_id: &str, run_id: u64, f: F)
    where
        F: FnOnce(&mut RepeatState),
    {
        if let Some(state) = self.runs.lock().get_mut(task_id) {
            if state.run_id == run_id {
                f(state);
            }
        }
    }

    fn teardown(&self, task_id: &str, run_id: u64) {
        let mut runs = self.runs.lock();
        if runs.get(task_id).is_some_and(|s| s.run_id == run_id) {
            runs.remove(task_id);
        }
    }
}

/// Handle held by the executor for the duration of one run.
/// Dropping it removes the run's state.
#[derive(Debug)]
pub struct RepeatRun {
    sender: RepeatSender,
    task_id: String,
    run_id: u64,
    token: CancellationToken,
    plan: RepeatPlan,
}

impl RepeatRun {
    pub fn plan(&self) -> RepeatPlan {
        self.plan
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record that attempt `iteration` (1-based) is being delivered.
    pub fn mark_attempt(&self, iteration: u32) {
        self.sender
            .with_state(&self.task_id, self.run_id, |state| state.current_count = iteration);
    }

    /// Sleep for the plan interval. Returns `false` if the run was aborted
    /// before, during, or right after the wait.
    pub async fn wait_interval(&self) -> bool {
        if self.is_aborted() {
            return false;
        }
        let wait_id = self.sender.ids.fetch_add(1, Ordering::Relaxed);
        let wait = self.token.child_token();
        self.sender.with_state(&self.task_id, self.run_id, |state| {
            state.waits.insert(wait_id, wait.clone());
        });

        let elapsed = tokio::select! {
            _ = wait.cancelled() => false,
            _ = tokio::time::sleep(self.plan.interval) => true,
        };

        self.sender.with_state(&self.task_id, self.run_id, |state| {
            state.waits.remove(&wait_id);
        });
        elapsed && !self.is_aborted()
    }
}

impl Drop for RepeatRun {
    fn drop(&mut self) {
        self.sender.teardown(&self.task_id, self.run_id);
    }
}
