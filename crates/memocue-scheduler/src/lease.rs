//! Instance lease — keeps exactly one process driving the scheduler clock.
//!
//! The lease is a small JSON record in a shared directory. A holder on the
//! same host whose process still exists is live; a holder on another host,
//! or a dead process, is stale and may be taken over. The heartbeat keeps
//! `lastHeartbeat` fresh for operators and notices when the record has been
//! taken, at which point this instance stops counting as the holder.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use memocue_core::config::MemoCueConfig;
use memocue_core::error::{MemoCueError, Result};

/// On-disk lease record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Answers "is this process still running on this host?".
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Process table of the operating system.
pub struct SystemProcesses;

impl ProcessTable for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            // Signal 0 only checks existence and permission.
            let Ok(raw) = i32::try_from(pid) else {
                return false;
            };
            kill(Pid::from_raw(raw), None).is_ok()
        }

        #[cfg(windows)]
        {
            std::process::Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}"), "/NH"])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = pid;
            true
        }
    }
}

struct Held {
    acquired_at: DateTime<Utc>,
    heartbeat: CancellationToken,
}

/// Identity and location used by the blocking check-and-write.
#[derive(Clone)]
struct Claimant {
    path: PathBuf,
    owner_id: u32,
    host_id: String,
    processes: Arc<dyn ProcessTable>,
}

impl Claimant {
    fn owns(&self, record: &LeaseRecord) -> bool {
        record.pid == self.owner_id && record.hostname == self.host_id
    }

    fn holder_alive(&self, record: &LeaseRecord) -> bool {
        record.hostname == self.host_id && self.processes.is_alive(record.pid)
    }

    /// Write our record unless a live holder exists.
    fn claim(&self, acquired_at: DateTime<Utc>) -> Result<bool> {
        let _guard = lock_guard(&self.path)?;
        if let Some(existing) = read_record(&self.path) {
            if self.holder_alive(&existing) {
                tracing::info!(
                    "🔒 Scheduler lease held by pid {} on {} since {}",
                    existing.pid,
                    existing.hostname,
                    existing.acquired_at
                );
                return Ok(false);
            }
            tracing::warn!(
                "⚠️ Taking over stale scheduler lease (pid {} on {})",
                existing.pid,
                existing.hostname
            );
        }

        let record = LeaseRecord {
            pid: self.owner_id,
            hostname: self.host_id.clone(),
            acquired_at,
            last_heartbeat: acquired_at,
        };
        write_record(&self.path, &record)?;
        Ok(true)
    }

    /// Delete the record if it is still ours.
    fn surrender(&self) -> Result<()> {
        let _guard = lock_guard(&self.path)?;
        if read_record(&self.path).is_some_and(|r| self.owns(&r)) {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Refresh `lastHeartbeat` if the record is still ours.
    /// `Ok(false)` once another instance has taken the lease.
    fn refresh(&self, acquired_at: DateTime<Utc>) -> Result<bool> {
        let _guard = lock_guard(&self.path)?;
        match read_record(&self.path) {
            Some(record) if self.owns(&record) => {
                let record = LeaseRecord {
                    last_heartbeat: Utc::now(),
                    acquired_at,
                    ..record
                };
                write_record(&self.path, &record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// File-based lease with a background heartbeat.
pub struct InstanceLease {
    claimant: Claimant,
    heartbeat: Duration,
    held: Arc<Mutex<Option<Held>>>,
}

impl InstanceLease {
    /// Lease at `path` owned by the current process on the current host.
    pub fn new(path: &Path, heartbeat: Duration) -> Self {
        Self {
            claimant: Claimant {
                path: path.to_path_buf(),
                owner_id: std::process::id(),
                host_id: current_hostname(),
                processes: Arc::new(SystemProcesses),
            },
            heartbeat,
            held: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(config: &MemoCueConfig) -> Self {
        Self::new(
            &config.lease_path(),
            Duration::from_secs(config.lease.heartbeat_secs.max(1)),
        )
    }

    /// Override the owner identity (used when several leases share a process).
    pub fn with_identity(mut self, owner_id: u32, host_id: &str) -> Self {
        self.claimant.owner_id = owner_id;
        self.claimant.host_id = host_id.to_string();
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.claimant.processes = processes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.claimant.path
    }

    /// Whether this instance currently holds the lease. Turns false on
    /// `release()` or when the heartbeat finds the record taken.
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// The record currently on disk, if any.
    pub fn read_record(&self) -> Option<LeaseRecord> {
        read_record(&self.claimant.path)
    }

    /// Try to become the lease holder. `Ok(false)` when a live holder exists.
    pub async fn acquire(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }

        let acquired_at = Utc::now();
        let claimant = self.claimant.clone();
        let claimed = tokio::task::spawn_blocking(move || claimant.claim(acquired_at))
            .await
            .map_err(|e| MemoCueError::Lease(format!("Lease worker failed: {e}")))??;
        if !claimed {
            return Ok(false);
        }

        let token = CancellationToken::new();
        self.spawn_heartbeat(token.clone(), acquired_at);
        *self.held.lock() = Some(Held {
            acquired_at,
            heartbeat: token,
        });
        tracing::info!("🔑 Scheduler lease acquired: {}", self.claimant.path.display());
        Ok(true)
    }

    /// Stop the heartbeat and delete the record if it is still ours.
    pub async fn release(&self) -> Result<()> {
        let Some(held) = self.held.lock().take() else {
            return Ok(());
        };
        held.heartbeat.cancel();
        let claimant = self.claimant.clone();
        tokio::task::spawn_blocking(move || claimant.surrender())
            .await
            .map_err(|e| MemoCueError::Lease(format!("Lease worker failed: {e}")))??;
        tracing::info!(
            "🔓 Scheduler lease released (held since {})",
            held.acquired_at
        );
        Ok(())
    }

    fn spawn_heartbeat(&self, token: CancellationToken, acquired_at: DateTime<Utc>) {
        let claimant = self.claimant.clone();
        let held = self.held.clone();
        let period = self.heartbeat;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let worker = claimant.clone();
                match tokio::task::spawn_blocking(move || worker.refresh(acquired_at)).await {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => {
                        tracing::error!("❌ Scheduler lease lost: {}", claimant.path.display());
                        let mut held = held.lock();
                        if held.as_ref().is_some_and(|h| h.acquired_at == acquired_at) {
                            *held = None;
                        }
                        break;
                    }
                    Ok(Err(e)) => tracing::warn!("⚠️ Lease heartbeat failed: {e}"),
                    Err(e) => tracing::warn!("⚠️ Lease heartbeat worker failed: {e}"),
                }
            }
        });
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if let Some(held) = self.held.lock().take() {
            held.heartbeat.cancel();
        }
    }
}

fn current_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into())
}

/// Exclusive lock on the sidecar guard file. Every check-and-write of the
/// lease record happens under it, across processes.
fn lock_guard(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let guard_path = path.with_extension("lock.guard");
    let guard = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&guard_path)?;
    guard
        .lock_exclusive()
        .map_err(|e| MemoCueError::Lease(format!("Failed to lock {}: {e}", guard_path.display())))?;
    Ok(guard)
}

/// Replace the record as another instance would.
#[cfg(test)]
pub(crate) fn install_record(path: &Path, record: &LeaseRecord) {
    let _guard = lock_guard(path).unwrap();
    write_record(path, record).unwrap();
}

fn read_record(path: &Path) -> Option<LeaseRecord> {
    let json = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&json) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("⚠️ Unreadable lease file {}: {e}", path.display());
            None
        }
    }
}

fn write_record(path: &Path, record: &LeaseRecord) -> Result<()> {
    crate::store::write_atomic(path, record)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProcesses(bool);

    impl ProcessTable for FixedProcesses {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn lease(dir: &Path, owner: u32, alive: bool) -> InstanceLease {
        InstanceLease::new(&dir.join("memocue-scheduler.lock"), Duration::from_secs(10))
            .with_identity(owner, "host-a")
            .with_processes(Arc::new(FixedProcesses(alive)))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let a = lease(dir.path(), 1001, true);
        assert!(a.acquire().await.unwrap());
        assert!(a.is_held());
        assert!(a.acquire().await.unwrap());

        let record = a.read_record().unwrap();
        assert_eq!(record.pid, 1001);
        assert_eq!(record.hostname, "host-a");

        a.release().await.unwrap();
        assert!(!a.is_held());
        assert!(a.read_record().is_none());
    }

    #[tokio::test]
    async fn test_live_holder_blocks_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let a = lease(dir.path(), 1001, true);
        let b = lease(dir.path(), 1002, true);
        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
        assert!(!b.is_held());
        assert_eq!(b.read_record().unwrap().pid, 1001);

        // b cannot delete a's record
        b.release().await.unwrap();
        assert!(a.read_record().is_some());
    }

    #[tokio::test]
    async fn test_dead_holder_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let a = lease(dir.path(), 1001, true);
        assert!(a.acquire().await.unwrap());

        let b = lease(dir.path(), 1002, false);
        assert!(b.acquire().await.unwrap());
        assert_eq!(b.read_record().unwrap().pid, 1002);

        // a no longer owns the record, so its release leaves b's in place
        a.release().await.unwrap();
        assert_eq!(b.read_record().unwrap().pid, 1002);
    }

    #[tokio::test]
    async fn test_foreign_host_holder_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memocue-scheduler.lock");
        let now = Utc::now();
        let foreign = LeaseRecord {
            pid: 7,
            hostname: "host-b".into(),
            acquired_at: now,
            last_heartbeat: now,
        };
        write_record(&path, &foreign).unwrap();

        // a fresh heartbeat from another host does not keep the lease
        let a = lease(dir.path(), 1001, true);
        assert!(a.acquire().await.unwrap());
        let record = a.read_record().unwrap();
        assert_eq!(record.hostname, "host-a");
        assert_eq!(record.pid, 1001);
        a.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_waits_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memocue-scheduler.lock");
        let guard = lock_guard(&path).unwrap();

        let a = Arc::new(lease(dir.path(), 1001, true));
        let contender = a.clone();
        let acquiring = tokio::spawn(async move { contender.acquire().await });

        // the single runtime thread keeps running timers while the claim waits
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!acquiring.is_finished());

        drop(guard);
        assert!(acquiring.await.unwrap().unwrap());
        assert!(a.is_held());
        a.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lease_is_no_longer_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lost.lock");
        let a = InstanceLease::new(&path, Duration::from_millis(20))
            .with_identity(1001, "host-a")
            .with_processes(Arc::new(FixedProcesses(true)));
        assert!(a.acquire().await.unwrap());

        let now = Utc::now();
        let intruder = LeaseRecord {
            pid: 2002,
            hostname: "host-b".into(),
            acquired_at: now,
            last_heartbeat: now,
        };
        install_record(&path, &intruder);

        for _ in 0..100 {
            if !a.is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!a.is_held());
        // release leaves the other holder's record alone
        a.release().await.unwrap();
        assert_eq!(a.read_record().unwrap().pid, 2002);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_record() {
        let dir = tempfile::tempdir().unwrap();
        let a = InstanceLease::new(&dir.path().join("hb.lock"), Duration::from_millis(20))
            .with_identity(1001, "host-a")
            .with_processes(Arc::new(FixedProcesses(true)));
        assert!(a.acquire().await.unwrap());
        let first = a.read_record().unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let later = a.read_record().unwrap();
        assert_eq!(later.acquired_at, first.acquired_at);
        assert!(later.last_heartbeat > first.last_heartbeat);
        a.release().await.unwrap();
    }

    #[test]
    fn test_system_processes_include_self() {
        assert!(SystemProcesses.is_alive(std::process::id()));
    }
}
