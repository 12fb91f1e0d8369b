//! Push provider trait — every delivery channel implements this.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Device, PushMessage, PushReceipt};

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Registry key, lowercase (e.g. "bark").
    fn name(&self) -> &str;

    /// Deliver one message to one device.
    async fn send(&self, device: &Device, message: &PushMessage) -> Result<PushReceipt>;
}
