//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use memocue_core::error::{MemoCueError, Result};
use memocue_core::traits::{DeviceDirectory, ExecutionLog, PushProvider, TaskStore};
use memocue_core::types::{Device, ExecutionRecord, PushMessage, PushReceipt, Task, TaskPatch};

pub fn device(id: &str, provider: &str) -> Device {
    Device {
        id: id.into(),
        name: format!("{id}-name"),
        provider_type: provider.into(),
        enabled: true,
        config: serde_json::Value::Null,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub tasks: Mutex<HashMap<String, Task>>,
    pub devices: Mutex<Vec<Device>>,
    pub patches: Mutex<Vec<(String, TaskPatch)>>,
    lookup_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn insert_device(&self, device: Device) {
        self.devices.lock().push(device);
    }

    /// Make every device lookup take `delay`.
    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = delay;
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_enabled_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.lock().values().filter(|t| t.enabled).cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.task(id))
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| MemoCueError::TaskNotFound(id.to_string()))?;
        patch.apply(task);
        self.patches.lock().push((id.to_string(), patch));
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn resolve_devices(&self, ids: &[String]) -> Result<Vec<Device>> {
        let delay = *self.lookup_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let devices = self.devices.lock();
        Ok(ids
            .iter()
            .filter_map(|id| devices.iter().find(|d| d.id == *id).cloned())
            .collect())
    }
}

/// Provider that records every send and can be told to fail or panic.
pub struct RecordingProvider {
    name: String,
    pub sent: Mutex<Vec<(String, String)>>,
    failing: Mutex<Vec<String>>,
    panicking: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    notify: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl RecordingProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            panicking: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            notify: Mutex::new(None),
        }
    }

    pub fn fail_for(&self, device_id: &str) {
        self.failing.lock().push(device_id.to_string());
    }

    pub fn recover(&self) {
        self.failing.lock().clear();
    }

    pub fn panic_for(&self, device_id: &str) {
        self.panicking.lock().push(device_id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Receive the device id of every send attempt as it happens.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify.lock() = Some(tx);
        rx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl PushProvider for RecordingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, device: &Device, message: &PushMessage) -> Result<PushReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.notify.lock().as_ref() {
            let _ = tx.send(device.id.clone());
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.lock().contains(&device.id) {
            panic!("provider exploded for {}", device.id);
        }
        if self.failing.lock().contains(&device.id) {
            return Err(MemoCueError::Dispatch(format!("{} unreachable", device.id)));
        }
        self.sent.lock().push((device.id.clone(), message.title.clone()));
        Ok(PushReceipt {
            provider: self.name.clone(),
            message_id: None,
        })
    }
}

#[derive(Default)]
pub struct MemoryLog {
    pub records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ExecutionLog for MemoryLog {
    async fn record(&self, entry: ExecutionRecord) {
        self.records.lock().push(entry);
    }
}
