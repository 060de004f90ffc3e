use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln::{Error, InvocationData, JobId, JobPerformer, PerformContext, Result, ServerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::TestJob;

/// What [`MockPerformer`] does with the next job.
#[derive(Clone, Debug, Default)]
pub enum Behavior {
    /// Runs [`TestJob`] invocations for what they describe and succeeds on
    /// anything else.
    #[default]
    FromJob,
    Succeed(Option<serde_json::Value>),
    Fail(String),
    /// Blocks until the job's cancellation fires, then reports it.
    Hang,
    /// Sleeps, giving up early if cancelled.
    Sleep(Duration),
}

#[derive(Clone, Debug)]
pub struct PerformRecord {
    pub job_id: JobId,
    pub invocation: InvocationData,
    pub server_id: ServerId,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MockPerformer {
    performs: Arc<Mutex<Vec<PerformRecord>>>,
    behavior: Arc<Mutex<Behavior>>,
    finished: Arc<AtomicUsize>,
}

impl MockPerformer {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::default())
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            performs: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(behavior)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn record(&self) -> Vec<PerformRecord> {
        self.performs.lock().clone()
    }

    /// Performs started so far.
    pub fn perform_count(&self) -> usize {
        self.performs.lock().len()
    }

    /// Performs that returned, whatever the outcome.
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn performed(&self, job_id: &JobId) -> usize {
        self.performs
            .lock()
            .iter()
            .filter(|record| &record.job_id == job_id)
            .count()
    }

    pub fn assert_perform_count_eq(&self, expected: usize) {
        let actual = self.perform_count();
        assert_eq!(
            actual, expected,
            "Expected {} performs, got {}",
            expected, actual
        );
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn clear(&self) {
        self.performs.lock().clear();
        self.finished.store(0, Ordering::SeqCst);
    }

    async fn run(&self, behavior: Behavior, ctx: &PerformContext) -> Result<Option<serde_json::Value>> {
        match behavior {
            Behavior::FromJob => match TestJob::from_invocation(&ctx.job.invocation) {
                Some(TestJob::Simple { name }) => Ok(Some(serde_json::Value::String(name))),
                Some(TestJob::Slow { duration_ms, name }) => {
                    sleep_or_cancelled(ctx, Duration::from_millis(duration_ms)).await?;
                    Ok(Some(serde_json::Value::String(name)))
                }
                Some(TestJob::Failing { error, .. }) => Err(Error::performance(anyhow::anyhow!(error))),
                None => Ok(None),
            },
            Behavior::Succeed(value) => Ok(value),
            Behavior::Fail(message) => Err(Error::performance(anyhow::anyhow!(message))),
            Behavior::Hang => {
                ctx.cancellation.cancelled().await;
                ctx.cancellation.throw_if_cancellation_requested()?;
                Ok(None)
            }
            Behavior::Sleep(duration) => {
                sleep_or_cancelled(ctx, duration).await?;
                Ok(None)
            }
        }
    }
}

impl Default for MockPerformer {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_or_cancelled(ctx: &PerformContext, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = ctx.cancellation.cancelled() => ctx.cancellation.throw_if_cancellation_requested(),
    }
}

#[async_trait]
impl JobPerformer for MockPerformer {
    async fn perform(&self, ctx: &PerformContext) -> Result<Option<serde_json::Value>> {
        self.performs.lock().push(PerformRecord {
            job_id: ctx.job.id.clone(),
            invocation: ctx.job.invocation.clone(),
            server_id: ctx.server_id.clone(),
            started_at: Utc::now(),
        });
        let behavior = self.behavior.lock().clone();
        let result = self.run(behavior, ctx).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}
