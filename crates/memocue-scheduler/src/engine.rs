//! Scheduler Engine — the job table and the loop that fires due tasks.
//! Uses tokio::interval for ticking (sleeps between checks); cron tasks
//! additionally get a fire-at-time timer so they don't wait for the tick.
//!
//! Every due execution is spawned as its own task, so a long repeat burst on
//! one task never delays the others. The job table is behind a short
//! parking_lot lock that is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use memocue_core::config::MemoCueConfig;
use memocue_core::error::{MemoCueError, Result};
use memocue_core::traits::TaskStore;
use memocue_core::types::{Task, TaskPatch};

use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::lease::InstanceLease;
use crate::retry::{RetryBackoff, RetryDecision};
use crate::time::TimeCalculator;

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub tz: Tz,
    pub tick_interval: Duration,
    pub backoff: RetryBackoff,
}

impl EngineSettings {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            tick_interval: Duration::from_secs(60),
            backoff: RetryBackoff::default(),
        }
    }

    pub fn from_config(config: &MemoCueConfig) -> Result<Self> {
        Ok(Self {
            tz: config.tz()?,
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
            backoff: RetryBackoff::from_config(&config.scheduler),
        })
    }
}

/// Engine lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

/// What caused a job run.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// Periodic tick observed the job due at this instant.
    Tick(DateTime<Utc>),
    /// Fire-at-time timer armed for this instant.
    Native(DateTime<Utc>),
    /// Backoff timer after a failure.
    Retry,
}

struct Job {
    task: Task,
    next_push_at: DateTime<Utc>,
    retry_count: u32,
    /// A run has been claimed and has not finished its bookkeeping yet.
    in_flight: bool,
    native: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(handle) = self.native.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub title: String,
    pub schedule_kind: String,
    pub next_push_at: DateTime<Utc>,
    pub enabled: bool,
    pub retry_count: u32,
    pub retry_pending: bool,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.task.id.clone(),
            title: job.task.title.clone(),
            schedule_kind: job.task.schedule.kind().to_string(),
            next_push_at: job.next_push_at,
            enabled: job.task.enabled,
            retry_count: job.retry_count,
            retry_pending: job.retry.is_some(),
        }
    }
}

/// Engine status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub state: EngineState,
    pub timezone: String,
    pub lease_held: bool,
    pub total_jobs: usize,
    pub jobs: Vec<JobSnapshot>,
    pub executing: Vec<String>,
    pub repeating: Vec<String>,
}

/// The scheduler engine: owns the job table and drives executions.
pub struct SchedulerEngine {
    settings: EngineSettings,
    calculator: TimeCalculator,
    store: Arc<dyn TaskStore>,
    executor: Arc<TaskExecutor>,
    lease: Option<InstanceLease>,
    jobs: Mutex<HashMap<String, Job>>,
    state: Mutex<EngineState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    me: Weak<SchedulerEngine>,
}

impl SchedulerEngine {
    /// Create an idle engine. Without a lease, `start()` always runs the tick loop.
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn TaskStore>,
        executor: Arc<TaskExecutor>,
        lease: Option<InstanceLease>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            settings,
            calculator: TimeCalculator::new(settings.tz),
            store,
            executor,
            lease,
            jobs: Mutex::new(HashMap::new()),
            state: Mutex::new(EngineState::Idle),
            ticker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn lease(&self) -> Option<&InstanceLease> {
        self.lease.as_ref()
    }

    /// Acquire the lease, load every enabled task and start ticking.
    /// `Ok(false)` when another live instance holds the lease; this engine
    /// then only serves manual triggers and status.
    pub async fn start(&self) -> Result<bool> {
        match self.state() {
            EngineState::Stopped => return Err(stopped()),
            EngineState::Running => return Ok(true),
            EngineState::Idle => {}
        }

        if let Some(lease) = &self.lease {
            if !lease.acquire().await? {
                tracing::warn!("🔒 Scheduler lease unavailable, tick loop disabled in this process");
                return Ok(false);
            }
        }

        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Running => return Ok(true),
                EngineState::Stopped => return Err(stopped()),
                EngineState::Idle => *state = EngineState::Running,
            }
        }

        let loaded = match self.reload().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("⚠️ Initial task load failed: {e}");
                0
            }
        };
        self.spawn_tick_loop();
        tracing::info!(
            "⏰ Scheduler started: {} jobs, tick every {}s, timezone {}",
            loaded,
            self.settings.tick_interval.as_secs(),
            self.settings.tz.name()
        );
        Ok(true)
    }

    /// Stop ticking, drop every job, abort repeat sends and release the lease.
    pub async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), EngineState::Stopped);
        if previous == EngineState::Stopped {
            return Ok(());
        }

        self.shutdown.cancel();
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        let dropped: Vec<Job> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        let aborted = self.executor.repeat_sender().abort_all();
        let job_count = dropped.len();
        drop(dropped);

        if let Some(lease) = &self.lease {
            lease.release().await?;
        }
        tracing::info!(
            "🛑 Scheduler stopped ({} jobs dropped, {} repeat sends aborted)",
            job_count,
            aborted
        );
        Ok(())
    }

    /// Create or replace the job for `task`. Returns the next trigger, or
    /// `None` when the task is disabled or has nothing left to fire.
    pub async fn schedule_task(&self, task: Task) -> Result<Option<DateTime<Utc>>> {
        if self.state() == EngineState::Stopped {
            return Err(stopped());
        }
        if !task.enabled {
            self.remove_task(&task.id);
            return Ok(None);
        }

        let Some(next) = self.next_trigger_for(&task) else {
            tracing::warn!(
                "⚠️ No upcoming trigger for '{}' ({} schedule), leaving it unscheduled",
                task.title,
                task.schedule.kind()
            );
            self.drop_job(&task.id);
            self.persist_next(&task.id, None).await;
            return Ok(None);
        };

        let id = task.id.clone();
        self.install_job(task, next, false);
        self.persist_next(&id, Some(next)).await;
        Ok(Some(next))
    }

    /// Remove a job and abort its in-flight repeat send. Never waits for
    /// the running execution; it observes the abort and ends on its own.
    pub fn remove_task(&self, task_id: &str) -> bool {
        let removed = self.jobs.lock().remove(task_id);
        let aborted = self.executor.repeat_sender().abort(task_id);
        if removed.is_some() || aborted {
            tracing::info!("🗑️ Task removed from scheduler: {task_id}");
        }
        removed.is_some()
    }

    /// Drop all jobs and rebuild them from the task store.
    pub async fn reload(&self) -> Result<usize> {
        if self.state() == EngineState::Stopped {
            return Err(stopped());
        }
        let tasks = self.store.load_enabled_tasks().await?;
        let total = tasks.len();
        let dropped: Vec<Job> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        drop(dropped);

        let mut scheduled = 0;
        for task in tasks {
            let title = task.title.clone();
            match self.schedule_task(task).await {
                Ok(Some(_)) => scheduled += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Failed to schedule '{title}': {e}"),
            }
        }
        tracing::info!("🔄 Scheduler reloaded: {scheduled}/{total} tasks scheduled");
        Ok(scheduled)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let mut jobs: Vec<JobSnapshot> = self.jobs.lock().values().map(JobSnapshot::from).collect();
        jobs.sort_by(|a, b| a.next_push_at.cmp(&b.next_push_at).then_with(|| a.id.cmp(&b.id)));
        let state = self.state();
        SchedulerStatus {
            is_running: state == EngineState::Running,
            state,
            timezone: self.settings.tz.name().to_string(),
            lease_held: self.lease.as_ref().is_some_and(InstanceLease::is_held),
            total_jobs: jobs.len(),
            jobs,
            executing: self.executor.guard().executing(),
            repeating: self.executor.repeat_sender().active(),
        }
    }

    /// Status as a fresh start would see it: every enabled task in the
    /// store with its computed next trigger. Read-only; the job table and
    /// the store are left untouched.
    pub async fn preview_status(&self) -> Result<SchedulerStatus> {
        let tasks = self.store.load_enabled_tasks().await?;
        let mut jobs: Vec<JobSnapshot> = tasks
            .iter()
            .filter_map(|task| {
                let next = self.next_trigger_for(task)?;
                Some(JobSnapshot {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    schedule_kind: task.schedule.kind().to_string(),
                    next_push_at: next,
                    enabled: task.enabled,
                    retry_count: 0,
                    retry_pending: false,
                })
            })
            .collect();
        jobs.sort_by(|a, b| a.next_push_at.cmp(&b.next_push_at).then_with(|| a.id.cmp(&b.id)));
        let state = self.state();
        Ok(SchedulerStatus {
            is_running: state == EngineState::Running,
            state,
            timezone: self.settings.tz.name().to_string(),
            lease_held: self.lease.as_ref().is_some_and(InstanceLease::is_held),
            total_jobs: jobs.len(),
            jobs,
            executing: self.executor.guard().executing(),
            repeating: self.executor.repeat_sender().active(),
        })
    }

    /// Execute a stored task right away, outside the tick. Honors the
    /// execution lock; a delivered run updates `lastPushAt` only.
    pub async fn execute_now(&self, task_id: &str) -> Result<ExecutionOutcome> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MemoCueError::TaskNotFound(task_id.to_string()))?;
        tracing::info!("▶️ Manual trigger: '{}'", task.title);

        let outcome = self.executor.execute(&task).await;
        if outcome.is_delivered() {
            self.persist_last_push(&task.id, Utc::now()).await;
        }
        Ok(outcome)
    }

    /// Next trigger for `task` from the current instant.
    pub fn next_trigger_for(&self, task: &Task) -> Option<DateTime<Utc>> {
        self.calculator
            .next_trigger(&task.schedule, Utc::now(), task.last_push_at)
    }

    /// Spawn a run for every job due at `now`. Jobs waiting on a retry
    /// timer or already executing are left alone.
    pub fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due: Vec<String> = {
            let jobs = self.jobs.lock();
            jobs.values()
                .filter(|job| !job.in_flight && job.retry.is_none() && job.next_push_at <= now)
                .map(|job| job.task.id.clone())
                .filter(|id| !self.executor.guard().is_executing(id))
                .collect()
        };
        if !due.is_empty() {
            tracing::debug!("🔔 {} task(s) due", due.len());
        }
        due.into_iter()
            .filter_map(|id| self.spawn_run(id, Trigger::Tick(now)))
            .collect()
    }

    fn spawn_tick_loop(&self) {
        let engine = self.me.clone();
        let token = self.shutdown.clone();
        let period = self.settings.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if !engine.holds_clock() {
                    tracing::error!("❌ Scheduler lease lost, no longer dispatching");
                    engine.relinquish();
                    break;
                }
                engine.dispatch_due(Utc::now());
            }
            tracing::debug!("⏰ Tick loop exited");
        });
        *self.ticker.lock() = Some(handle);
    }

    /// Whether this engine may fire timed runs: no lease configured, or the
    /// lease is still ours.
    fn holds_clock(&self) -> bool {
        self.lease.as_ref().is_none_or(InstanceLease::is_held)
    }

    /// Drop every job and abort repeat sends after losing the lease.
    /// Manual triggers keep working.
    fn relinquish(&self) {
        let dropped: Vec<Job> = self.jobs.lock().drain().map(|(_, job)| job).collect();
        let aborted = self.executor.repeat_sender().abort_all();
        tracing::warn!(
            "🔒 Released {} jobs and aborted {} repeat sends to the new lease holder",
            dropped.len(),
            aborted
        );
    }

    fn spawn_run(&self, task_id: String, trigger: Trigger) -> Option<JoinHandle<()>> {
        let engine = self.me.upgrade()?;
        Some(tokio::spawn(async move {
            engine.run_job(&task_id, trigger).await;
        }))
    }

    /// Timer that fires a run at `at` without waiting for the tick.
    fn arm_native(&self, task_id: &str, at: DateTime<Utc>) -> JoinHandle<()> {
        let engine = self.me.clone();
        let task_id = task_id.to_string();
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                // Detached, so dropping the job never cancels a run mid-flight.
                engine.spawn_run(task_id, Trigger::Native(at));
            }
        })
    }

    fn arm_retry(&self, task_id: &str, delay: Duration) -> JoinHandle<()> {
        let engine = self.me.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.spawn_run(task_id, Trigger::Retry);
            }
        })
    }

    async fn run_job(&self, task_id: &str, trigger: Trigger) {
        if self.state() == EngineState::Stopped || !self.holds_clock() {
            return;
        }
        let task = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(task_id) else {
                return;
            };
            if job.in_flight {
                return;
            }
            let stale = match trigger {
                Trigger::Tick(now) => job.retry.is_some() || job.next_push_at > now,
                Trigger::Native(at) => job.retry.is_some() || job.next_push_at != at,
                Trigger::Retry => {
                    job.retry = None;
                    false
                }
            };
            if stale {
                return;
            }
            job.in_flight = true;
            job.task.clone()
        };

        let outcome = self.executor.execute(&task).await;
        let failed = matches!(outcome, ExecutionOutcome::Failed { .. });
        match outcome {
            ExecutionOutcome::Delivered(_) => self.on_success(&task).await,
            ExecutionOutcome::Aborted(report) => {
                if report.success_count() > 0 {
                    self.persist_last_push(&task.id, Utc::now()).await;
                }
                tracing::info!("⏹️ Execution of '{}' aborted", task.title);
            }
            ExecutionOutcome::Skipped => {}
            ExecutionOutcome::Failed { error, .. } => self.on_failure(&task, &error).await,
        }

        // on_failure releases the job itself, before a retry can be armed
        if !failed {
            if let Some(job) = self.jobs.lock().get_mut(task_id) {
                job.in_flight = false;
            }
        }
    }

    async fn on_success(&self, task: &Task) {
        let pushed_at = Utc::now();
        self.persist_last_push(&task.id, pushed_at).await;

        if task.schedule.is_once() {
            if let Err(e) = self.store.update_task(&task.id, TaskPatch::disable()).await {
                tracing::warn!("⚠️ Failed to disable one-shot task '{}': {e}", task.title);
            }
            self.drop_job(&task.id);
            tracing::info!("✅ One-shot task '{}' delivered and disabled", task.title);
            return;
        }

        let mut current = match self.store.get_task(&task.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::info!("🗑️ Task '{}' no longer exists, dropping job", task.title);
                self.drop_job(&task.id);
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to reload '{}', rescheduling from cache: {e}", task.title);
                task.clone()
            }
        };
        if !current.enabled {
            self.drop_job(&task.id);
            return;
        }
        current.last_push_at = Some(pushed_at);

        match self
            .calculator
            .next_trigger(&current.schedule, pushed_at, current.last_push_at)
        {
            Some(next) => {
                if self.install_job(current, next, true) {
                    self.persist_next(&task.id, Some(next)).await;
                    tracing::debug!("📅 Next push for '{}' at {}", task.title, next);
                }
            }
            None => {
                self.drop_job(&task.id);
                self.persist_next(&task.id, None).await;
                tracing::info!("🏁 Task '{}' has no further triggers", task.title);
            }
        }
    }

    async fn on_failure(&self, task: &Task, error: &MemoCueError) {
        let decision = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(&task.id) else {
                return;
            };
            job.in_flight = false;
            job.retry_count += 1;
            let decision = self.settings.backoff.decide(job.retry_count, task.max_retries);
            match decision {
                RetryDecision::Retry { delay, .. } => {
                    job.retry = Some(self.arm_retry(&task.id, delay));
                }
                RetryDecision::GiveUp => {
                    jobs.remove(&task.id);
                }
            }
            decision
        };

        match decision {
            RetryDecision::Retry { attempt, delay } => {
                tracing::warn!(
                    "🔁 Task '{}' failed ({error}), retry #{} in {}ms",
                    task.title,
                    attempt,
                    delay.as_millis()
                );
            }
            RetryDecision::GiveUp => {
                tracing::error!("❌ Task '{}' failed after retries, job dropped: {error}", task.title);
                if task.schedule.is_once() {
                    if let Err(e) = self.store.update_task(&task.id, TaskPatch::disable()).await {
                        tracing::warn!("⚠️ Failed to disable one-shot task '{}': {e}", task.title);
                    }
                }
            }
        }
    }

    /// Insert (or with `replace_only`, only replace) the job for `task`.
    fn install_job(&self, task: Task, next: DateTime<Utc>, replace_only: bool) -> bool {
        let native = if self.is_running() && task.schedule.cron_expression().is_some() {
            Some(self.arm_native(&task.id, next))
        } else {
            None
        };

        let mut jobs = self.jobs.lock();
        if replace_only && !jobs.contains_key(&task.id) {
            if let Some(handle) = native {
                handle.abort();
            }
            return false;
        }
        jobs.insert(
            task.id.clone(),
            Job {
                task,
                next_push_at: next,
                retry_count: 0,
                in_flight: false,
                native,
                retry: None,
            },
        );
        true
    }

    fn drop_job(&self, task_id: &str) {
        let job = self.jobs.lock().remove(task_id);
        drop(job);
    }

    async fn persist_next(&self, task_id: &str, next: Option<DateTime<Utc>>) {
        if let Err(e) = self.store.update_task(task_id, TaskPatch::next_push_at(next)).await {
            tracing::warn!("⚠️ Failed to save next push time for {task_id}: {e}");
        }
    }

    async fn persist_last_push(&self, task_id: &str, at: DateTime<Utc>) {
        if let Err(e) = self.store.update_task(task_id, TaskPatch::last_push_at(at)).await {
            tracing::warn!("⚠️ Failed to save last push time for {task_id}: {e}");
        }
    }
}

fn stopped() -> MemoCueError {
    MemoCueError::Scheduler("engine is stopped; create a new engine to run again".into())
}
