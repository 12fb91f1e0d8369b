//! # MemoCue Core
//!
//! Shared vocabulary for the MemoCue workspace: configuration, the error
//! type, the task/device/record data model, and the collaborator traits the
//! scheduler engine is written against.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::MemoCueConfig;
pub use error::{MemoCueError, Result};
pub use traits::{DeviceDirectory, ExecutionLog, PushProvider, TaskStore};
pub use types::*;
