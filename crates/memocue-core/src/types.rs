//! Domain data model — tasks, schedules, devices and execution records.
//!
//! Field names serialize in camelCase so the JSON files written by
//! [`TaskStore`](crate::traits::TaskStore) implementations stay compatible
//! with the records the dashboard edits.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoCueError;

/// Wall-clock time of day, written as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = MemoCueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map(Self)
            .map_err(|e| MemoCueError::Schedule(format!("invalid time '{s}': {e}")))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = MemoCueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

/// When a task fires. Weekday numbers count from Sunday = 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Schedule {
    /// A single instant.
    Once {
        #[serde(alias = "datetime")]
        at: DateTime<Utc>,
    },
    /// Every hour at `minute`, optionally restricted to `[start_hour, end_hour]`.
    Hourly {
        minute: u32,
        start_hour: Option<u32>,
        end_hour: Option<u32>,
    },
    Daily { times: Vec<TimeOfDay> },
    Weekly { days: Vec<u32>, time: TimeOfDay },
    Monthly { days: Vec<u32>, time: TimeOfDay },
    /// Every `interval` months counted from `first_date`, clamped to month end.
    MonthlyInterval {
        interval: u32,
        first_date: NaiveDate,
        time: TimeOfDay,
    },
    /// Every `minutes` after the last delivery.
    Interval {
        #[serde(alias = "interval")]
        minutes: u32,
    },
    Workdays { times: Vec<TimeOfDay> },
    Weekend { times: Vec<TimeOfDay> },
    Cron { expression: String },
    /// Explicit list of instants.
    Custom { dates: Vec<DateTime<Utc>> },
}

impl Schedule {
    /// Short identifier used in status output and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Once { .. } => "once",
            Self::Hourly { .. } => "hourly",
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
            Self::MonthlyInterval { .. } => "monthlyInterval",
            Self::Interval { .. } => "interval",
            Self::Workdays { .. } => "workdays",
            Self::Weekend { .. } => "weekend",
            Self::Cron { .. } => "cron",
            Self::Custom { .. } => "custom",
        }
    }

    /// Hourly and cron schedules fire too often for repeat bursts.
    pub fn allows_repeat(&self) -> bool {
        !matches!(self, Self::Hourly { .. } | Self::Cron { .. })
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Self::Once { .. })
    }

    /// The cron expression, for schedules that get a native trigger.
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Cron { expression } => Some(expression),
            _ => None,
        }
    }
}

/// Multi-shot delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_repeat_count")]
    pub count: u32,
    /// Minutes between attempts; 0 falls back to the configured default.
    #[serde(default)]
    pub interval_minutes: u32,
}

fn default_repeat_count() -> u32 { 1 }

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            count: default_repeat_count(),
            interval_minutes: 0,
        }
    }
}

/// Notification priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A scheduled reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub repeat: RepeatPolicy,
    /// Per-task override of the configured retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub last_push_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_push_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn bool_true() -> bool { true }

impl Task {
    /// Create an enabled task with a fresh id.
    pub fn new(title: &str, schedule: Schedule) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: String::new(),
            enabled: true,
            schedule,
            device_ids: Vec::new(),
            priority: Priority::Normal,
            url: None,
            sound: None,
            group: None,
            icon: None,
            repeat: RepeatPolicy::default(),
            max_retries: None,
            last_push_at: None,
            next_push_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = content.to_string();
        self
    }

    pub fn with_devices<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_repeat(mut self, count: u32, interval_minutes: u32) -> Self {
        self.repeat = RepeatPolicy {
            enabled: true,
            count,
            interval_minutes,
        };
        self
    }

    /// The payload handed to push providers.
    pub fn message(&self) -> PushMessage {
        PushMessage {
            title: self.title.clone(),
            body: self.content.clone(),
            url: self.url.clone(),
            sound: self.sound.clone(),
            group: self.group.clone(),
            icon: self.icon.clone(),
            priority: self.priority,
        }
    }
}

/// Partial update written back to the task store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// `Some(None)` clears the stored trigger.
    pub next_push_at: Option<Option<DateTime<Utc>>>,
    pub last_push_at: Option<DateTime<Utc>>,
    pub enabled: Option<bool>,
}

impl TaskPatch {
    pub fn next_push_at(at: Option<DateTime<Utc>>) -> Self {
        Self {
            next_push_at: Some(at),
            ..Self::default()
        }
    }

    pub fn last_push_at(at: DateTime<Utc>) -> Self {
        Self {
            last_push_at: Some(at),
            ..Self::default()
        }
    }

    pub fn disable() -> Self {
        Self {
            enabled: Some(false),
            ..Self::default()
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(next) = self.next_push_at {
            task.next_push_at = next;
        }
        if let Some(last) = self.last_push_at {
            task.last_push_at = Some(last);
        }
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }
    }
}

/// A delivery target (phone, webhook endpoint, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    #[serde(default = "bool_true", alias = "isActive")]
    pub enabled: bool,
    /// Provider-specific settings (keys, server URLs, headers).
    #[serde(default)]
    pub config: serde_json::Value,
}

/// What gets pushed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub sound: Option<String>,
    pub group: Option<String>,
    pub icon: Option<String>,
    pub priority: Priority,
}

/// Provider acknowledgement of a successful push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushReceipt {
    pub provider: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// One delivery attempt to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub task_title: String,
    pub device_id: String,
    pub device_name: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub total_iterations: u32,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn new(
        task: &Task,
        device: &Device,
        iteration: u32,
        total_iterations: u32,
        error: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            status: if error.is_none() {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            error,
            timestamp: Utc::now(),
            iteration,
            total_iterations,
            duration_ms,
        }
    }
}
