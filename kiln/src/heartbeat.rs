//! Liveness: the heartbeat keeps this server's record fresh, the watchdog
//! evicts records of servers that stopped doing so.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::cancellation::sleep_or_cancel;
use crate::error::{Error, Result};
use crate::runtime::process::{BackgroundProcess, ProcessContext};
use crate::telemetry;

/// Refreshes the server record every `interval`.
///
/// Runs on a token set that only follows the host's `Shutdown`, so a
/// generation restart does not stop it. When the record has been removed by
/// a peer, or heartbeats keep failing for longer than `server_timeout`, it
/// asks for a restart; the next generation announces the server again.
pub struct ServerHeartbeat {
    interval: Duration,
    server_timeout: Duration,
    faulted_since: Mutex<Option<Instant>>,
}

impl ServerHeartbeat {
    pub fn new(interval: Duration, server_timeout: Duration) -> Self {
        Self {
            interval,
            server_timeout,
            faulted_since: Mutex::new(None),
        }
    }

    async fn beat(&self, ctx: &ProcessContext) -> Result<()> {
        let connection = ctx.storage.connection().await?;
        connection.heartbeat(&ctx.server_id).await
    }

    fn on_fault(&self, ctx: &ProcessContext, error: &Error) {
        let since = *self.faulted_since.lock().get_or_insert_with(Instant::now);
        let faulted_for = since.elapsed();
        if faulted_for >= self.server_timeout {
            tracing::error!(
                faulted_ms = faulted_for.as_millis() as u64,
                error = %error,
                "heartbeat failing for longer than the server timeout, requesting restart"
            );
            if ctx.restart.request(format!("heartbeat failing since {faulted_for:?}: {error}")) {
                telemetry::record_server_restart("heartbeat_faulted");
                // The next generation gets a full timeout of its own.
                self.faulted_since.lock().take();
            }
        } else {
            tracing::warn!(
                faulted_ms = faulted_for.as_millis() as u64,
                error = %error,
                "heartbeat failed"
            );
        }
    }
}

#[async_trait]
impl BackgroundProcess for ServerHeartbeat {
    fn name(&self) -> &str {
        "ServerHeartbeat"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let span = telemetry::heartbeat_span(&ctx.server_id);
        match self.beat(ctx).instrument(span).await {
            Ok(()) => {
                if self.faulted_since.lock().take().is_some() {
                    tracing::info!("heartbeat recovered");
                }
                tracing::trace!("heartbeat sent");
            }
            Err(error) if error.is_cancellation() => return Err(error),
            Err(Error::ServerGone(server_id)) => {
                if ctx.tokens.shutdown().is_cancelled() {
                    return Ok(());
                }
                tracing::warn!(
                    %server_id,
                    "server record was removed by another server, requesting restart"
                );
                if ctx.restart.request("server record was removed") {
                    telemetry::record_server_restart("server_gone");
                }
            }
            Err(error) => self.on_fault(ctx, &error),
        }

        sleep_or_cancel(ctx.tokens.stopping(), self.interval).await;
        Ok(())
    }
}

/// Deletes server records whose heartbeat is older than `server_timeout`.
pub struct ServerWatchdog {
    check_interval: Duration,
    server_timeout: Duration,
}

impl ServerWatchdog {
    pub fn new(check_interval: Duration, server_timeout: Duration) -> Self {
        Self {
            check_interval,
            server_timeout,
        }
    }
}

#[async_trait]
impl BackgroundProcess for ServerWatchdog {
    fn name(&self) -> &str {
        "ServerWatchdog"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let connection = ctx.storage.connection().await?;
        let removed = connection
            .remove_timed_out_servers(self.server_timeout)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "removed timed out servers");
        } else {
            tracing::trace!("no timed out servers");
        }
        sleep_or_cancel(ctx.tokens.stopping(), self.check_interval).await;
        Ok(())
    }
}
