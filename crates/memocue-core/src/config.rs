//! MemoCue configuration system.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MemoCueError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoCueConfig {
    /// Directory holding tasks.json, devices.json and logs.json.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// IANA timezone every schedule is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub logs: LogConfig,
}

fn default_data_dir() -> String { "./data".into() }
fn default_timezone() -> String { "Asia/Shanghai".into() }

impl Default for MemoCueConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timezone: default_timezone(),
            scheduler: SchedulerConfig::default(),
            lease: LeaseConfig::default(),
            push: PushConfig::default(),
            logs: LogConfig::default(),
        }
    }
}

impl MemoCueConfig {
    /// Load config from the default path (~/.memocue/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MemoCueError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MemoCueError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("⚙️ Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MemoCueError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the MemoCue home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".memocue")
    }

    /// Environment variables used by existing deployments take precedence
    /// over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(tz) = std::env::var("MEMOCUE_TIMEZONE").or_else(|_| std::env::var("TZ")) {
            if !tz.trim().is_empty() {
                self.timezone = tz;
            }
        }
        if let Ok(dir) = std::env::var("LOCK_FILE_DIR") {
            self.lease.dir = Some(dir);
        }
        if let Ok(server) = std::env::var("BARK_SERVER") {
            self.push.bark_server = server;
        }
    }

    /// Parsed timezone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| MemoCueError::Config(format!("Invalid timezone '{}': {e}", self.timezone)))
    }

    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    /// Full path of the lease file.
    pub fn lease_path(&self) -> PathBuf {
        let dir = match &self.lease.dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => self.data_path().join("locks"),
        };
        dir.join(&self.lease.file_name)
    }
}

/// Scheduler core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling period of the due-check loop.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Retries after the first failed execution before the job is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Gap between repeat-send attempts when a task enables repeat without one.
    #[serde(default = "default_repeat_interval")]
    pub default_repeat_interval_minutes: u32,
}

fn default_tick_interval() -> u64 { 60 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 1000 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_repeat_interval() -> u32 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            default_repeat_interval_minutes: default_repeat_interval(),
        }
    }
}

/// Single-runner lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Shared directory for the lease file (default: `<data_dir>/locks`).
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_lease_file")]
    pub file_name: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn bool_true() -> bool { true }
fn default_lease_file() -> String { "memocue-scheduler.lock".into() }
fn default_heartbeat() -> u64 { 10 }

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            file_name: default_lease_file(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

/// Push provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Bark server used when a device does not name its own.
    #[serde(default = "default_bark_server")]
    pub bark_server: String,
    #[serde(default = "default_push_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_bark_server() -> String { "https://api.day.app".into() }
fn default_push_timeout() -> u64 { 10 }
fn default_user_agent() -> String { format!("memocue/{}", env!("CARGO_PKG_VERSION")) }

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            bark_server: default_bark_server(),
            timeout_secs: default_push_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Execution log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_max_records() -> usize { 1000 }
fn default_retention_days() -> u32 { 30 }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            retention_days: default_retention_days(),
        }
    }
}
