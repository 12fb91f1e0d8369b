//! Execution log book — newest-first ring buffer of delivery attempts.
//! Persisted to `logs.json` and fanned out live to subscribers (dashboard
//! streams, CLI tails) over a broadcast channel.
//!
//! Saves are serialized by a write lock and each one snapshots the buffer
//! while holding it, so the file always ends up with the latest state.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use memocue_core::traits::ExecutionLog;
use memocue_core::types::{ExecutionRecord, ExecutionStatus};

const EVENT_CAPACITY: usize = 256;

/// Query over the stored records. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub task_id: Option<String>,
    pub device_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        self.task_id.as_ref().is_none_or(|id| *id == record.task_id)
            && self.device_id.as_ref().is_none_or(|id| *id == record.device_id)
            && self.status.is_none_or(|s| s == record.status)
            && self.since.is_none_or(|t| record.timestamp >= t)
            && self.until.is_none_or(|t| record.timestamp <= t)
    }
}

type Records = Arc<Mutex<VecDeque<ExecutionRecord>>>;

#[derive(Clone)]
struct LogFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl LogFile {
    fn save(&self, records: &Records) {
        let _writing = self.write_lock.lock();
        let snapshot: Vec<ExecutionRecord> = records.lock().iter().cloned().collect();
        if let Err(e) = crate::store::write_atomic(&self.path, &snapshot) {
            tracing::warn!("⚠️ Failed to save execution log: {e}");
        }
    }
}

/// In-memory execution history with optional file persistence.
pub struct ExecutionLogBook {
    file: Option<LogFile>,
    max_records: usize,
    records: Records,
    events: broadcast::Sender<ExecutionRecord>,
}

impl ExecutionLogBook {
    /// Memory-only log book.
    pub fn in_memory(max_records: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            file: None,
            max_records: max_records.max(1),
            records: Arc::new(Mutex::new(VecDeque::new())),
            events,
        }
    }

    /// Log book backed by `<dir>/logs.json`, loading whatever is there.
    pub fn open(dir: &Path, max_records: usize) -> Self {
        std::fs::create_dir_all(dir).ok();
        let path = dir.join("logs.json");
        let mut book = Self::in_memory(max_records);
        let mut records = load_records(&path);
        records.truncate(book.max_records);
        tracing::debug!("📒 Loaded {} execution records from {}", records.len(), path.display());
        book.records = Arc::new(Mutex::new(records.into()));
        book.file = Some(LogFile {
            path,
            write_lock: Arc::new(Mutex::new(())),
        });
        book
    }

    /// Live feed of new records.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionRecord> {
        self.events.subscribe()
    }

    /// Store a record (newest first), persist, and broadcast it.
    pub fn push(&self, record: ExecutionRecord) {
        self.insert(record);
        self.persist();
    }

    fn insert(&self, record: ExecutionRecord) {
        {
            let mut records = self.records.lock();
            records.push_front(record.clone());
            records.truncate(self.max_records);
        }
        // No subscribers is fine.
        let _ = self.events.send(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Most recent `limit` records.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.records.lock().iter().take(limit).cloned().collect()
    }

    pub fn filter(&self, filter: &LogFilter) -> Vec<ExecutionRecord> {
        let records = self.records.lock();
        let matching = records.iter().filter(|r| filter.matches(r)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn last_for_task(&self, task_id: &str) -> Option<ExecutionRecord> {
        self.records.lock().iter().find(|r| r.task_id == task_id).cloned()
    }

    /// Latest record per task for each of `task_ids` that has one.
    pub fn last_for_tasks(&self, task_ids: &[String]) -> Vec<ExecutionRecord> {
        task_ids.iter().filter_map(|id| self.last_for_task(id)).collect()
    }

    /// Drop records older than `days`. Returns how many were removed.
    pub fn clean_older_than(&self, days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let removed = {
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|r| r.timestamp >= cutoff);
            before - records.len()
        };
        if removed > 0 {
            tracing::info!("🧹 Removed {} execution records older than {} days", removed, days);
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        if let Some(file) = &self.file {
            file.save(&self.records);
        }
    }
}

fn load_records(path: &Path) -> Vec<ExecutionRecord> {
    if !path.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Failed to parse {}: {e}", path.display());
            Vec::new()
        }),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read {}: {e}", path.display());
            Vec::new()
        }
    }
}

#[async_trait]
impl ExecutionLog for ExecutionLogBook {
    async fn record(&self, entry: ExecutionRecord) {
        self.insert(entry);
        let Some(file) = self.file.clone() else {
            return;
        };
        let records = self.records.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || file.save(&records)).await {
            tracing::warn!("⚠️ Execution log save task failed: {e}");
        }
    }
}
