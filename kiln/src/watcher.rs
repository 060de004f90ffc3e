use async_trait::async_trait;
use std::time::Duration;

use crate::cancellation::sleep_or_cancel;
use crate::error::Result;
use crate::lease::LeaseTokenRegistry;
use crate::runtime::process::{BackgroundProcess, ProcessContext};

/// Periodically checks this server's lease tokens against storage and aborts
/// those whose job was changed externally.
pub struct CancellationWatcher {
    registry: LeaseTokenRegistry,
    interval: Duration,
}

impl CancellationWatcher {
    pub fn new(registry: LeaseTokenRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }
}

#[async_trait]
impl BackgroundProcess for CancellationWatcher {
    fn name(&self) -> &str {
        "CancellationWatcher"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let connection = ctx.storage.connection().await?;
        let aborted = self
            .registry
            .check_all(&ctx.server_id, connection.as_ref())
            .await?;
        if aborted > 0 {
            tracing::debug!(aborted, "aborted jobs changed outside of this server");
        }
        sleep_or_cancel(ctx.tokens.stopping(), self.interval).await;
        Ok(())
    }
}
