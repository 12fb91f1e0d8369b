//! Execution log sink.

use async_trait::async_trait;

use crate::types::ExecutionRecord;

/// Fire-and-forget record of each delivery attempt.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn record(&self, entry: ExecutionRecord);
}
