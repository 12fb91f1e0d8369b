//! # MemoCue Scheduler
//!
//! Timezone-aware reminder scheduling with retrying, repeatable push delivery.
//!
//! ## Design Principles
//! - File-based state (JSON + advisory locks), no database
//! - Tokio timers only: zero overhead when idle
//! - One execution per task at a time, enforced by an RAII permit
//! - Provider errors and panics never escape a single task's run
//! - Exactly one process drives the clock, elected by a file lease
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval + cron fire-at-time timers)
//!   ├── Job table: task → nextPushAt, retry timer, native trigger
//!   ├── TimeCalculator: schedule × now × tz → next instant
//!   ├── on due → TaskExecutor
//!   │             ├── ExecutionGuard (single-flight per task)
//!   │             ├── RepeatSender (N attempts, cancellable waits)
//!   │             └── ProviderRegistry → Bark / Webhook
//!   ├── on success → lastPushAt, reschedule (once ⇒ disable)
//!   └── on failure → RetryBackoff (2s, 4s, 8s … capped) or drop
//!
//! InstanceLease (lease file + heartbeat) gates the tick loop.
//! JsonTaskStore / ExecutionLogBook persist tasks, devices and history.
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod guard;
pub mod lease;
pub mod logbook;
pub mod repeat;
pub mod retry;
pub mod store;
pub mod time;

#[cfg(test)]
mod testing;

pub use dispatch::{BarkProvider, ProviderRegistry, WebhookProvider};
pub use engine::{EngineSettings, EngineState, JobSnapshot, SchedulerEngine, SchedulerStatus};
pub use executor::{DeliveryResult, ExecutionOutcome, ExecutionReport, TaskExecutor};
pub use guard::{ExecutionGuard, ExecutionPermit};
pub use lease::{InstanceLease, LeaseRecord, ProcessTable, SystemProcesses};
pub use logbook::{ExecutionLogBook, LogFilter};
pub use repeat::{RepeatPlan, RepeatProgress, RepeatSender};
pub use retry::{RetryBackoff, RetryDecision};
pub use store::JsonTaskStore;
pub use time::TimeCalculator;
