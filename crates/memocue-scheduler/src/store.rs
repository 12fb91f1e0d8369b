//! File-based task & device store — lightweight persistence.
//! Records live in `tasks.json` / `devices.json`, human-readable and editable
//! by the dashboard. Writers serialize on an advisory lock file and replace
//! the data file atomically, so readers never see a half-written array.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use memocue_core::error::{MemoCueError, Result};
use memocue_core::traits::{DeviceDirectory, TaskStore};
use memocue_core::types::{Device, Task, TaskPatch};

use crate::dispatch::ProviderRegistry;

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// JSON file store for tasks and devices.
#[derive(Debug, Clone)]
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    /// Create a store rooted at `dir` (created if missing).
    pub fn new(dir: &Path) -> Self {
        std::fs::create_dir_all(dir).ok();
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tasks_file(&self) -> PathBuf {
        self.dir.join("tasks.json")
    }

    fn devices_file(&self) -> PathBuf {
        self.dir.join("devices.json")
    }

    /// Every task on disk, enabled or not.
    pub fn load_all_tasks(&self) -> Result<Vec<Task>> {
        read_records(&self.tasks_file())
    }

    pub fn find_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load_all_tasks()?.into_iter().find(|t| t.id == id))
    }

    /// Insert or replace a task by id.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        self.modify::<Task, _, _>(&self.tasks_file(), |tasks| {
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task.clone(),
                None => tasks.push(task.clone()),
            }
            Ok(())
        })?;
        tracing::debug!("💾 Saved task '{}' ({})", task.title, task.id);
        Ok(())
    }

    /// Delete a task. Returns whether it existed.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        self.modify::<Task, _, _>(&self.tasks_file(), |tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            Ok(tasks.len() < before)
        })
    }

    /// Apply a partial update to one task.
    pub fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<()> {
        self.modify::<Task, _, _>(&self.tasks_file(), |tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| MemoCueError::TaskNotFound(id.to_string()))?;
            patch.apply(task);
            Ok(())
        })
    }

    pub fn load_devices(&self) -> Result<Vec<Device>> {
        read_records(&self.devices_file())
    }

    /// Insert or replace a device. Unknown provider types are rejected.
    pub fn register_device(&self, device: &Device, providers: &ProviderRegistry) -> Result<()> {
        providers.ensure_supported(device)?;
        self.modify::<Device, _, _>(&self.devices_file(), |devices| {
            match devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => *existing = device.clone(),
                None => devices.push(device.clone()),
            }
            Ok(())
        })?;
        tracing::info!("📱 Registered device '{}' ({})", device.name, device.provider_type);
        Ok(())
    }

    /// Read-modify-write `path` under the store lock.
    fn modify<T, F, R>(&self, path: &Path, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> Result<R>,
    {
        let lock = self.acquire_lock()?;
        let mut records: Vec<T> = read_records(path)?;
        let out = f(&mut records)?;
        write_atomic(path, &records)?;
        drop(lock);
        Ok(out)
    }

    /// Exclusive lock on `.store.lock`, retried with growing backoff.
    fn acquire_lock(&self) -> Result<File> {
        let path = self.dir.join(".store.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        for attempt in 1..=LOCK_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(_) if attempt < LOCK_ATTEMPTS => {
                    std::thread::sleep(LOCK_BACKOFF * attempt);
                }
                Err(e) => {
                    return Err(MemoCueError::Store(format!(
                        "Store lock {} busy after {} attempts: {e}",
                        path.display(),
                        LOCK_ATTEMPTS
                    )));
                }
            }
        }
        Err(MemoCueError::Store(format!("Store lock {} unavailable", path.display())))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(JsonTaskStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| MemoCueError::Store(format!("Store worker failed: {e}")))?
    }
}

/// Parse a JSON array file. A missing file is empty; individual records
/// that fail to parse are skipped with a warning.
fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)?;
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<serde_json::Value> = serde_json::from_str(&json)
        .map_err(|e| MemoCueError::Store(format!("Failed to parse {}: {e}", path.display())))?;
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("⚠️ Skipping record #{} in {}: {e}", i, path.display());
                None
            }
        })
        .collect())
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `value` as pretty JSON to a uniquely named sibling, then rename it
/// over `path`. Readers never see a partial file.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}.{seq}.tmp", std::process::id()));
    if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn load_enabled_tasks(&self) -> Result<Vec<Task>> {
        self.blocking(|store| {
            Ok(store
                .load_all_tasks()?
                .into_iter()
                .filter(|t| t.enabled)
                .collect())
        })
        .await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.blocking(move |store| store.find_task(&id)).await
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |store| store.patch_task(&id, &patch)).await
    }
}

#[async_trait]
impl DeviceDirectory for JsonTaskStore {
    async fn resolve_devices(&self, ids: &[String]) -> Result<Vec<Device>> {
        let ids = ids.to_vec();
        self.blocking(move |store| {
            let devices = store.load_devices()?;
            Ok(ids
                .iter()
                .filter_map(|id| devices.iter().find(|d| d.id == *id).cloned())
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memocue_core::config::PushConfig;
    use memocue_core::types::{Schedule, TimeOfDay};

    fn task(title: &str) -> Task {
        Task::new(title, Schedule::Daily { times: vec![TimeOfDay::new(8, 0).unwrap()] })
    }

    fn device(id: &str, provider: &str) -> Device {
        Device {
            id: id.into(),
            name: format!("{id}-phone"),
            provider_type: provider.into(),
            enabled: true,
            config: serde_json::json!({"key": "abc"}),
        }
    }

    #[test]
    fn test_save_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path());
        let mut t = task("vitamins");
        store.save_task(&t).unwrap();

        t.title = "vitamins D".into();
        store.save_task(&t).unwrap();

        let all = store.load_all_tasks().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.find_task(&t.id).unwrap().unwrap().title, "vitamins D");
        assert!(store.delete_task(&t.id).unwrap());
        assert!(!store.delete_task(&t.id).unwrap());
    }

    #[test]
    fn test_patch_missing_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path());
        let err = store.patch_task("nope", &TaskPatch::disable()).unwrap_err();
        assert!(matches!(err, MemoCueError::TaskNotFound(_)));
    }

    #[test]
    fn test_malformed_record_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_value(task("good")).unwrap();
        let bad = serde_json::json!({"id": "bad", "title": "x", "schedule": {"type": "daily", "times": ["99:00"]}});
        std::fs::write(
            dir.path().join("tasks.json"),
            serde_json::to_string(&vec![good, bad]).unwrap(),
        )
        .unwrap();

        let store = JsonTaskStore::new(dir.path());
        let tasks = store.load_all_tasks().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "good");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tasks.json"), "{ not json").unwrap();
        let store = JsonTaskStore::new(dir.path());
        assert!(matches!(store.load_all_tasks(), Err(MemoCueError::Store(_))));
    }

    #[test]
    fn test_lock_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path());
        let held = store.acquire_lock().unwrap();
        // A second handle on the same file conflicts with the first.
        let err = store.save_task(&task("blocked")).unwrap_err();
        assert!(matches!(err, MemoCueError::Store(_)));
        drop(held);
        store.save_task(&task("unblocked")).unwrap();
    }

    #[test]
    fn test_register_device_checks_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path());
        let providers = ProviderRegistry::with_defaults(&PushConfig::default()).unwrap();

        store.register_device(&device("d1", "bark"), &providers).unwrap();
        let err = store.register_device(&device("d2", "pager"), &providers).unwrap_err();
        assert!(matches!(err, MemoCueError::UnknownProvider(_)));
        assert_eq!(store.load_devices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trait_surface() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::new(dir.path());
        let providers = ProviderRegistry::with_defaults(&PushConfig::default()).unwrap();
        store.register_device(&device("d1", "bark"), &providers).unwrap();
        store.register_device(&device("d2", "webhook"), &providers).unwrap();

        let on = task("on");
        let mut off = task("off");
        off.enabled = false;
        store.save_task(&on).unwrap();
        store.save_task(&off).unwrap();

        let enabled = store.load_enabled_tasks().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, on.id);

        let next = chrono::Utc::now();
        store.update_task(&on.id, TaskPatch::next_push_at(Some(next))).await.unwrap();
        let reloaded = store.get_task(&on.id).await.unwrap().unwrap();
        assert_eq!(reloaded.next_push_at, Some(next));

        let devices = store
            .resolve_devices(&["d2".into(), "ghost".into(), "d1".into()])
            .await
            .unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d1"]);
    }
}
