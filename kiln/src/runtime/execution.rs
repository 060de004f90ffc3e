//! The execution harness that keeps a [`BackgroundProcess`] alive.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::process::{BackgroundProcess, ProcessContext};
use crate::cancellation::sleep_or_cancel;
use crate::error::Result;
use crate::identity::ExecutionId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Call `execute` again after every success until `Stopping`.
    #[default]
    Loop,
    /// Return after the first success.
    RunOnce,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    /// Consecutive failures tolerated before giving up. `None` never gives up.
    pub max_attempts: Option<u32>,
    pub max_delay_ms: u64,
    pub mode: ExecutionMode,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_delay_ms: 5 * 60_000,
            mode: ExecutionMode::Loop,
        }
    }
}

impl ExecutionPolicy {
    pub fn run_once() -> Self {
        Self {
            mode: ExecutionMode::RunOnce,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Delay before retry `attempt` (0-based): uniform in `[i², (i+1)²]`
/// seconds, capped at `max_delay`.
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let i = u64::from(attempt);
    let low = i.saturating_mul(i).saturating_mul(1000);
    let high = (i + 1).saturating_mul(i + 1).saturating_mul(1000);
    let picked = rand::thread_rng().gen_range(low..=high);
    Duration::from_millis(picked).min(max_delay)
}

/// Runs `process` under `policy` until it finishes or `Stopping` fires.
///
/// Cancellation ends the run immediately. Other errors are retried with
/// [`backoff_delay`]; once `max_attempts` consecutive failures pile up the
/// last error is returned. A success resets the failure count.
pub async fn run(
    process: Arc<dyn BackgroundProcess>,
    ctx: ProcessContext,
    policy: ExecutionPolicy,
) -> Result<()> {
    let name = process.name().to_string();
    let mut failures: u32 = 0;

    loop {
        if ctx.is_stopping() {
            tracing::debug!(process = %name, "stopping requested, leaving execution loop");
            return Ok(());
        }

        let run_ctx = ctx.with_execution_id(ExecutionId::new());
        match process.execute(&run_ctx).await {
            Ok(()) => {
                if failures > 0 {
                    tracing::info!(process = %name, failures, "process recovered");
                }
                failures = 0;
                if policy.mode == ExecutionMode::RunOnce {
                    return Ok(());
                }
            }
            Err(error) if error.is_cancellation() => {
                if ctx.tokens.level().is_some() {
                    tracing::debug!(process = %name, "process cancelled");
                    return Ok(());
                }
                tracing::warn!(process = %name, error = %error, "process reported cancellation while running");
                return Err(error);
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                if policy.max_attempts.is_some_and(|max| failures >= max) {
                    tracing::error!(
                        process = %name,
                        attempts = failures,
                        error = %error,
                        fatal = true,
                        "process failed, retry attempts exhausted"
                    );
                    return Err(error);
                }
                let delay = backoff_delay(failures - 1, policy.max_delay());
                tracing::warn!(
                    process = %name,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "process failed, will retry"
                );
                if !sleep_or_cancel(ctx.tokens.stopping(), delay).await {
                    return Ok(());
                }
            }
        }
    }
}
