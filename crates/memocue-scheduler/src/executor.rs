//! Task executor — one execution of one task.
//!
//! Claims the execution guard and a repeat run, resolves the task's devices,
//! then performs 1..N delivery attempts through the repeat-sender. Every attempt on every
//! device produces exactly one execution record, in attempt order. Provider
//! errors and panics are contained here and reported as failed deliveries.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;

use memocue_core::error::MemoCueError;
use memocue_core::traits::{DeviceDirectory, ExecutionLog};
use memocue_core::types::{Device, ExecutionRecord, PushMessage, Task};

use crate::dispatch::ProviderRegistry;
use crate::guard::ExecutionGuard;
use crate::repeat::{RepeatPlan, RepeatSender};

/// Result of one delivery attempt to one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub device_id: String,
    pub device_name: String,
    pub iteration: u32,
    pub success: bool,
    pub error: Option<String>,
    pub message_id: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate of a run: every delivery, in attempt order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub task_id: String,
    pub total_iterations: u32,
    pub completed_iterations: u32,
    pub aborted: bool,
    pub deliveries: Vec<DeliveryResult>,
}

impl ExecutionReport {
    fn new(task_id: &str, total_iterations: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            total_iterations,
            completed_iterations: 0,
            aborted: false,
            deliveries: Vec::new(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.deliveries.len() - self.success_count()
    }
}

/// How an execution ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// At least one delivery succeeded.
    Delivered(ExecutionReport),
    /// The run was aborted (task removed or engine stopping).
    Aborted(ExecutionReport),
    /// Another execution of the same task was in flight.
    Skipped,
    /// Nothing was delivered.
    Failed {
        error: MemoCueError,
        report: Option<ExecutionReport>,
    },
}

impl ExecutionOutcome {
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            Self::Delivered(report) | Self::Aborted(report) => Some(report),
            Self::Failed { report, .. } => report.as_ref(),
            Self::Skipped => None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// Executes tasks against devices through the provider registry.
pub struct TaskExecutor {
    devices: Arc<dyn DeviceDirectory>,
    providers: Arc<ProviderRegistry>,
    log: Arc<dyn ExecutionLog>,
    guard: ExecutionGuard,
    repeat: RepeatSender,
    default_repeat_interval_minutes: u32,
}

impl TaskExecutor {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        providers: Arc<ProviderRegistry>,
        log: Arc<dyn ExecutionLog>,
    ) -> Self {
        Self {
            devices,
            providers,
            log,
            guard: ExecutionGuard::new(),
            repeat: RepeatSender::new(),
            default_repeat_interval_minutes: 5,
        }
    }

    pub fn with_default_repeat_interval(mut self, minutes: u32) -> Self {
        self.default_repeat_interval_minutes = minutes;
        self
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn repeat_sender(&self) -> &RepeatSender {
        &self.repeat
    }

    /// Run `task` once (including any repeat burst).
    ///
    /// The guard and the repeat run are claimed before devices are looked
    /// up, so an abort issued while the lookup is pending still cancels
    /// this run.
    pub async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let Some(_permit) = self.guard.try_begin(&task.id) else {
            tracing::warn!("⏳ Task '{}' is already executing, skipping", task.title);
            return ExecutionOutcome::Skipped;
        };
        let plan = RepeatPlan::for_task(task, self.default_repeat_interval_minutes);
        let Some(run) = self.repeat.begin(&task.id, plan) else {
            tracing::warn!("⏳ Task '{}' has a repeat send in progress, skipping", task.title);
            return ExecutionOutcome::Skipped;
        };

        let devices: Vec<Device> = match self.devices.resolve_devices(&task.device_ids).await {
            Ok(devices) => devices.into_iter().filter(|d| d.enabled).collect(),
            Err(e) => {
                tracing::warn!("⚠️ Device lookup failed for task '{}': {e}", task.title);
                return ExecutionOutcome::Failed {
                    error: e,
                    report: None,
                };
            }
        };
        if run.is_aborted() {
            tracing::info!("🛑 Task '{}' aborted before delivery", task.title);
            let mut report = ExecutionReport::new(&task.id, plan.count);
            report.aborted = true;
            return ExecutionOutcome::Aborted(report);
        }
        if devices.is_empty() {
            tracing::warn!("⚠️ No available device for task '{}' ({})", task.title, task.id);
            return ExecutionOutcome::Failed {
                error: MemoCueError::NoAvailableDevice(task.id.clone()),
                report: None,
            };
        }

        let message = task.message();
        let mut report = ExecutionReport::new(&task.id, plan.count);
        for iteration in 1..=plan.count {
            if iteration > 1 && !run.wait_interval().await {
                break;
            }
            if run.is_aborted() {
                break;
            }
            run.mark_attempt(iteration);
            for device in &devices {
                let result = self.deliver(task, device, &message, iteration, plan.count).await;
                report.deliveries.push(result);
            }
            report.completed_iterations = iteration;
        }
        report.aborted = run.is_aborted();

        tracing::info!(
            "📤 Task '{}' executed: {} delivered, {} failed ({}/{} attempts)",
            task.title,
            report.success_count(),
            report.failure_count(),
            report.completed_iterations,
            report.total_iterations
        );

        if report.aborted {
            ExecutionOutcome::Aborted(report)
        } else if report.success_count() > 0 {
            ExecutionOutcome::Delivered(report)
        } else {
            ExecutionOutcome::Failed {
                error: MemoCueError::Dispatch(format!(
                    "all {} deliveries failed",
                    report.deliveries.len()
                )),
                report: Some(report),
            }
        }
    }

    async fn deliver(
        &self,
        task: &Task,
        device: &Device,
        message: &PushMessage,
        iteration: u32,
        total: u32,
    ) -> DeliveryResult {
        let started = Instant::now();
        let outcome = match self.providers.get(&device.provider_type) {
            Ok(provider) => AssertUnwindSafe(provider.send(device, message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(MemoCueError::Dispatch(format!(
                        "provider panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                }),
            Err(e) => Err(e),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (error, message_id) = match &outcome {
            Ok(receipt) => (None, receipt.message_id.clone()),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Delivery of '{}' to {} failed (attempt {}/{}): {e}",
                    task.title,
                    device.name,
                    iteration,
                    total
                );
                (Some(e.to_string()), None)
            }
        };

        self.log
            .record(ExecutionRecord::new(
                task,
                device,
                iteration,
                total,
                error.clone(),
                duration_ms,
            ))
            .await;

        DeliveryResult {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            iteration,
            success: error.is_none(),
            error,
            message_id,
            duration_ms,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
