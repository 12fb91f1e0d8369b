//! Collaborator traits the scheduler engine is written against.

pub mod log;
pub mod push;
pub mod store;

pub use log::ExecutionLog;
pub use push::PushProvider;
pub use store::{DeviceDirectory, TaskStore};
