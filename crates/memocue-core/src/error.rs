//! Error types for MemoCue.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MemoCueError>;

#[derive(Debug, Error)]
pub enum MemoCueError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Every referenced device is missing or disabled.
    #[error("No available device for task {0}")]
    NoAvailableDevice(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),

    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}
