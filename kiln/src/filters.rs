//! The two filter extension points.
//!
//! [`ElectStateFilter`]s run inside every filtered state transition and may
//! replace the candidate state. [`ServerFilter`]s wrap job performance and are
//! driven by [`FilterPipeline`] in two explicit passes: `on_performing`
//! outermost first, then `on_performed` innermost first.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job::{BackgroundJob, JobData, JobId};
use crate::state::{JobState, StateData, StateKind};
use crate::storage::StorageConnection;

/// Job parameter holding how many automatic retries already happened.
pub const RETRY_COUNT_PARAMETER: &str = "RetryCount";

pub struct ElectStateContext<'a> {
    pub job_id: &'a JobId,
    pub job: &'a JobData,
    pub current_state: Option<&'a StateData>,
    pub candidate: JobState,
    pub connection: &'a dyn StorageConnection,
}

#[async_trait]
pub trait ElectStateFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<()>;
}

/// What happens once [`AutomaticRetry`] runs out of attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttemptsExceeded {
    #[default]
    Fail,
    Delete,
}

/// Turns a Failed candidate into a Scheduled one until attempts run out.
#[derive(Clone, Debug)]
pub struct AutomaticRetry {
    pub attempts: u32,
    pub on_attempts_exceeded: AttemptsExceeded,
}

impl Default for AutomaticRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            on_attempts_exceeded: AttemptsExceeded::Fail,
        }
    }
}

impl AutomaticRetry {
    pub const NAME: &'static str = "AutomaticRetry";

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_attempts_exceeded(mut self, action: AttemptsExceeded) -> Self {
        self.on_attempts_exceeded = action;
        self
    }

    /// `n⁴ + 15 + rand(30)·(n + 1)` seconds for retry number `n`.
    pub fn retry_delay(retry_count: u32) -> Duration {
        let n = u64::from(retry_count);
        let jitter = rand::thread_rng().gen_range(0..30u64) * (n + 1);
        Duration::from_secs(n.saturating_pow(4).saturating_add(15).saturating_add(jitter))
    }
}

#[async_trait]
impl ElectStateFilter for AutomaticRetry {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<()> {
        let StateKind::Failed { message, .. } = &ctx.candidate.kind else {
            return Ok(());
        };

        let retry_count = ctx
            .connection
            .get_job_parameter(ctx.job_id, RETRY_COUNT_PARAMETER)
            .await?
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;

        if retry_count <= self.attempts {
            let reason = format!("Retry attempt {retry_count} of {}: {message}", self.attempts);
            ctx.connection
                .set_job_parameter(ctx.job_id, RETRY_COUNT_PARAMETER, &retry_count.to_string())
                .await?;
            tracing::warn!(
                job_id = %ctx.job_id,
                retry_count,
                attempts = self.attempts,
                "job failed, scheduling automatic retry"
            );
            ctx.candidate = JobState::scheduled_in(Self::retry_delay(retry_count)).with_reason(reason);
        } else if self.on_attempts_exceeded == AttemptsExceeded::Delete {
            ctx.candidate = JobState::deleted().with_reason(format!(
                "Exceeded the maximum number of retry attempts ({}).",
                self.attempts
            ));
        } else if self.attempts > 0 {
            tracing::error!(
                job_id = %ctx.job_id,
                attempts = self.attempts,
                "job failed after exhausting automatic retries"
            );
        }
        Ok(())
    }
}

pub struct PerformingContext {
    pub job: BackgroundJob,
    pub items: HashMap<String, serde_json::Value>,
    /// Set by a filter to skip the job and the remaining inner filters.
    pub canceled: bool,
}

pub struct PerformedContext {
    pub job: BackgroundJob,
    pub items: HashMap<String, serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Error>,
    pub canceled: bool,
    /// Set by a filter to stop `error` from propagating.
    pub exception_handled: bool,
}

pub struct ServerExceptionContext<'a> {
    pub job: &'a BackgroundJob,
    pub error: &'a Error,
    pub exception_handled: bool,
}

#[async_trait]
pub trait ServerFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn on_performing(&self, _ctx: &mut PerformingContext) -> Result<()> {
        Ok(())
    }

    async fn on_performed(&self, _ctx: &mut PerformedContext) -> Result<()> {
        Ok(())
    }

    async fn on_server_exception(&self, _ctx: &mut ServerExceptionContext<'_>) -> Result<()> {
        Ok(())
    }
}

fn passes_through(error: &Error) -> bool {
    error.is_cancellation() || error.is_job_aborted()
}

fn filter_error(filter: &dyn ServerFilter, error: Error) -> Error {
    if passes_through(&error) {
        return error;
    }
    Error::Filter {
        filter: filter.name().to_string(),
        source: anyhow::Error::new(error),
    }
}

/// Ordered server filters, outermost first.
#[derive(Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<Arc<dyn ServerFilter>>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Arc<dyn ServerFilter>>) -> Self {
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs `perform` inside the filters.
    ///
    /// Cancellation and lease-abort errors bypass every hook and propagate
    /// untouched.
    pub async fn run<F, Fut>(&self, job: &BackgroundJob, perform: F) -> Result<Option<serde_json::Value>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<serde_json::Value>>> + Send,
    {
        let mut performing = PerformingContext {
            job: job.clone(),
            items: HashMap::new(),
            canceled: false,
        };

        let mut entered = 0;
        let mut early_error = None;
        for filter in &self.filters {
            if let Err(error) = filter.on_performing(&mut performing).await {
                if passes_through(&error) {
                    return Err(error);
                }
                early_error = Some(filter_error(filter.as_ref(), error));
                break;
            }
            if performing.canceled {
                tracing::debug!(job_id = %job.id, filter = filter.name(), "job canceled by filter");
                break;
            }
            entered += 1;
        }

        let (result, error) = match early_error {
            Some(error) => (None, Some(error)),
            None if performing.canceled => (None, None),
            None => match perform().await {
                Ok(result) => (result, None),
                Err(error) if passes_through(&error) => return Err(error),
                Err(error) => (None, Some(error)),
            },
        };

        let mut performed = PerformedContext {
            job: performing.job,
            items: performing.items,
            result,
            error,
            canceled: performing.canceled,
            exception_handled: false,
        };

        for filter in self.filters[..entered].iter().rev() {
            if let Err(error) = filter.on_performed(&mut performed).await {
                if passes_through(&error) {
                    return Err(error);
                }
                performed.error = Some(filter_error(filter.as_ref(), error));
                performed.exception_handled = false;
            }
        }

        match performed.error {
            Some(error) if !performed.exception_handled => self.on_exception(job, error).await,
            _ => Ok(performed.result),
        }
    }

    async fn on_exception(&self, job: &BackgroundJob, error: Error) -> Result<Option<serde_json::Value>> {
        let mut ctx = ServerExceptionContext {
            job,
            error: &error,
            exception_handled: false,
        };
        for filter in self.filters.iter().rev() {
            if let Err(hook_error) = filter.on_server_exception(&mut ctx).await {
                tracing::warn!(
                    job_id = %job.id,
                    filter = filter.name(),
                    error = %hook_error,
                    "exception filter failed"
                );
            }
        }
        if ctx.exception_handled {
            Ok(None)
        } else {
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InvocationData;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        cancel: bool,
        handle: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                cancel: false,
                handle: false,
            }
        }
    }

    #[async_trait]
    impl ServerFilter for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_performing(&self, ctx: &mut PerformingContext) -> Result<()> {
            self.log.lock().push(format!("{}:performing", self.name));
            ctx.canceled = self.cancel;
            Ok(())
        }

        async fn on_performed(&self, ctx: &mut PerformedContext) -> Result<()> {
            self.log.lock().push(format!("{}:performed", self.name));
            if self.handle && ctx.error.is_some() {
                ctx.exception_handled = true;
            }
            Ok(())
        }

        async fn on_server_exception(&self, _ctx: &mut ServerExceptionContext<'_>) -> Result<()> {
            self.log.lock().push(format!("{}:exception", self.name));
            Ok(())
        }
    }

    fn job() -> BackgroundJob {
        BackgroundJob {
            id: JobId::from("1"),
            invocation: InvocationData::new("T", "m"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn hooks_run_outer_to_inner_then_inner_to_outer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FilterPipeline::new(vec![
            Arc::new(Recorder::new("outer", &log)),
            Arc::new(Recorder::new("inner", &log)),
        ]);
        let inner_log = Arc::clone(&log);
        let result = pipeline
            .run(&job(), || async move {
                inner_log.lock().push("job".to_string());
                Ok(Some(serde_json::json!(42)))
            })
            .await
            .unwrap();

        assert_eq!(result, Some(serde_json::json!(42)));
        assert_eq!(
            *log.lock(),
            vec![
                "outer:performing",
                "inner:performing",
                "job",
                "inner:performed",
                "outer:performed"
            ]
        );
    }

    #[tokio::test]
    async fn canceling_filter_skips_job_and_its_own_performed_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut canceler = Recorder::new("inner", &log);
        canceler.cancel = true;
        let pipeline = FilterPipeline::new(vec![
            Arc::new(Recorder::new("outer", &log)),
            Arc::new(canceler),
        ]);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = pipeline
            .run(&job(), || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(result, None);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(
            *log.lock(),
            vec!["outer:performing", "inner:performing", "outer:performed"]
        );
    }

    #[tokio::test]
    async fn handled_exception_does_not_propagate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handler = Recorder::new("inner", &log);
        handler.handle = true;
        let pipeline = FilterPipeline::new(vec![
            Arc::new(Recorder::new("outer", &log)),
            Arc::new(handler),
        ]);
        let result = pipeline
            .run(&job(), || async { Err(Error::performance(anyhow::anyhow!("boom"))) })
            .await;

        assert!(matches!(result, Ok(None)));
        assert!(!log.lock().iter().any(|entry| entry.ends_with(":exception")));
    }

    #[tokio::test]
    async fn unhandled_exception_reaches_exception_hooks_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FilterPipeline::new(vec![
            Arc::new(Recorder::new("outer", &log)),
            Arc::new(Recorder::new("inner", &log)),
        ]);
        let result = pipeline
            .run(&job(), || async { Err(Error::performance(anyhow::anyhow!("boom"))) })
            .await;

        assert!(matches!(result, Err(Error::Performance { .. })));
        let log = log.lock();
        assert_eq!(&log[log.len() - 2..], ["inner:exception", "outer:exception"]);
    }

    #[tokio::test]
    async fn aborted_jobs_bypass_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FilterPipeline::new(vec![Arc::new(Recorder::new("only", &log))]);
        let result = pipeline
            .run(&job(), || async { Err(Error::JobAborted(JobId::from("1"))) })
            .await;

        assert!(matches!(result, Err(Error::JobAborted(_))));
        assert_eq!(*log.lock(), vec!["only:performing"]);
    }

    #[test]
    fn retry_delay_grows_with_attempts() {
        for attempt in 1..=5u32 {
            let delay = AutomaticRetry::retry_delay(attempt).as_secs();
            let n = u64::from(attempt);
            assert!(delay >= n.pow(4) + 15);
            assert!(delay < n.pow(4) + 15 + 30 * (n + 1));
        }
    }
}
