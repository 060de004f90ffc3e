use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::default_server_name;
use crate::state::DEFAULT_QUEUE;

fn ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Queue names are lowercase letters, digits, underscores and dashes.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(Error::Config("queue name must not be empty".into()));
    }
    let valid = queue
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if !valid {
        return Err(Error::Config(format!(
            "queue name '{queue}' may contain only lowercase letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus * 5).min(20)
}

/// Settings for one background job server.
///
/// Durations are stored as milliseconds so the struct deserializes from
/// plain config files; use the accessor methods to get [`Duration`]s.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Prefix of the server id. Defaults to the host name.
    pub server_name: String,
    /// Queues to fetch from, highest priority first.
    pub queues: Vec<String>,
    pub worker_count: usize,
    /// Grace period after `Stopping` before `Stopped` is signalled.
    pub stop_timeout_ms: u64,
    /// Grace period after `Stopped` before `Shutdown` is signalled.
    pub shutdown_timeout_ms: u64,
    /// Final wait after `Shutdown` before components are abandoned.
    pub last_chance_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Servers silent for longer than this are considered dead.
    pub server_timeout_ms: u64,
    pub server_check_interval_ms: u64,
    pub cancellation_check_interval_ms: u64,
    pub schedule_polling_interval_ms: u64,
    /// Pause before a restarted server generation starts.
    pub restart_delay_ms: u64,
    pub worker: WorkerOptions,
    pub delayed: DelayedSchedulerOptions,
    pub recurring: RecurringSchedulerOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            worker_count: default_worker_count(),
            stop_timeout_ms: 0,
            shutdown_timeout_ms: 15_000,
            last_chance_timeout_ms: 1_000,
            heartbeat_interval_ms: 30_000,
            server_timeout_ms: 5 * 60_000,
            server_check_interval_ms: 5 * 60_000,
            cancellation_check_interval_ms: 5_000,
            schedule_polling_interval_ms: 15_000,
            restart_delay_ms: 15_000,
            worker: WorkerOptions::default(),
            delayed: DelayedSchedulerOptions::default(),
            recurring: RecurringSchedulerOptions::default(),
        }
    }
}

impl ServerOptions {
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = ms(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = ms(timeout);
        self
    }

    pub fn with_last_chance_timeout(mut self, timeout: Duration) -> Self {
        self.last_chance_timeout_ms = ms(timeout);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = ms(interval);
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout_ms = ms(timeout);
        self
    }

    pub fn with_server_check_interval(mut self, interval: Duration) -> Self {
        self.server_check_interval_ms = ms(interval);
        self
    }

    pub fn with_cancellation_check_interval(mut self, interval: Duration) -> Self {
        self.cancellation_check_interval_ms = ms(interval);
        self
    }

    /// Sets the polling delay of both schedulers.
    pub fn with_schedule_polling_interval(mut self, interval: Duration) -> Self {
        self.schedule_polling_interval_ms = ms(interval);
        self.delayed.polling_delay_ms = ms(interval);
        self.recurring = self.recurring.with_polling_delay(interval);
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = ms(delay);
        self
    }

    pub fn with_worker_options(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_delayed_options(mut self, delayed: DelayedSchedulerOptions) -> Self {
        self.delayed = delayed;
        self
    }

    pub fn with_recurring_options(mut self, recurring: RecurringSchedulerOptions) -> Self {
        self.recurring = recurring;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn last_chance_timeout(&self) -> Duration {
        Duration::from_millis(self.last_chance_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn server_check_interval(&self) -> Duration {
        Duration::from_millis(self.server_check_interval_ms)
    }

    pub fn cancellation_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_check_interval_ms)
    }

    pub fn schedule_polling_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_polling_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(Error::Config("server name must not be empty".into()));
        }
        if self.queues.is_empty() {
            return Err(Error::Config("at least one queue is required".into()));
        }
        for queue in &self.queues {
            validate_queue_name(queue)?;
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be positive".into()));
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("server_timeout_ms", self.server_timeout_ms),
            ("server_check_interval_ms", self.server_check_interval_ms),
            ("cancellation_check_interval_ms", self.cancellation_check_interval_ms),
            ("schedule_polling_interval_ms", self.schedule_polling_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Bound on the claim step, composed with `Stopping`.
    pub job_initialization_timeout_ms: u64,
    pub max_state_change_attempts: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            job_initialization_timeout_ms: 60_000,
            max_state_change_attempts: 10,
        }
    }
}

impl WorkerOptions {
    pub fn with_job_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.job_initialization_timeout_ms = ms(timeout);
        self
    }

    pub fn with_max_state_change_attempts(mut self, attempts: u32) -> Self {
        self.max_state_change_attempts = attempts;
        self
    }

    pub fn job_initialization_timeout(&self) -> Duration {
        Duration::from_millis(self.job_initialization_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedSchedulerOptions {
    pub polling_delay_ms: u64,
    pub batch_size: usize,
    pub max_state_change_attempts: u32,
    /// Parallel units per pass when storage supports batched reads.
    pub max_degree_of_parallelism: usize,
    pub lock_timeout_ms: u64,
}

impl Default for DelayedSchedulerOptions {
    fn default() -> Self {
        Self {
            polling_delay_ms: 15_000,
            batch_size: 1000,
            max_state_change_attempts: 5,
            max_degree_of_parallelism: 1,
            lock_timeout_ms: 60_000,
        }
    }
}

impl DelayedSchedulerOptions {
    pub fn with_polling_delay(mut self, delay: Duration) -> Self {
        self.polling_delay_ms = ms(delay);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_state_change_attempts(mut self, attempts: u32) -> Self {
        self.max_state_change_attempts = attempts;
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.max_degree_of_parallelism = degree;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = ms(timeout);
        self
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringSchedulerOptions {
    pub polling_delay_ms: u64,
    pub batch_size: usize,
    pub max_retry_attempts: u32,
    /// Window used to merge near-simultaneous ticks across servers.
    ///
    /// A pass fires instants up to `now + precision / 2`, so clock skew
    /// between peers larger than that can still cause a tick to be claimed
    /// by two passes in different windows.
    pub precision_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for RecurringSchedulerOptions {
    fn default() -> Self {
        Self {
            polling_delay_ms: 15_000,
            batch_size: 1000,
            max_retry_attempts: 5,
            precision_ms: 30_000,
            lock_timeout_ms: 60_000,
        }
    }
}

impl RecurringSchedulerOptions {
    /// Also resets `precision` to twice the delay.
    pub fn with_polling_delay(mut self, delay: Duration) -> Self {
        self.polling_delay_ms = ms(delay);
        self.precision_ms = self.polling_delay_ms.saturating_mul(2);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_precision(mut self, precision: Duration) -> Self {
        self.precision_ms = ms(precision);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = ms(timeout);
        self
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn precision(&self) -> Duration {
        Duration::from_millis(self.precision_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
