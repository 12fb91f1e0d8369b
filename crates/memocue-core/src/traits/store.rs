//! Task and device persistence seams.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Device, Task, TaskPatch};

/// Source of truth for task records.
///
/// The engine only ever reads enabled tasks, re-reads a single task after an
/// execution, and writes back trigger bookkeeping through [`TaskPatch`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_enabled_tasks(&self) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()>;
}

/// Resolves device ids to delivery targets.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Devices matching `ids`, in the order requested. Unknown ids are skipped.
    async fn resolve_devices(&self, ids: &[String]) -> Result<Vec<Device>>;
}
