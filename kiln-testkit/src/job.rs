use chrono::{DateTime, Utc};
use kiln::{InMemoryStorage, InvocationData, JobId};
use serde_json::Value;
use std::time::Duration;

/// Jobs [`MockPerformer`](crate::MockPerformer) can run without any
/// registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestJob {
    Simple { name: String },
    Slow { duration_ms: u64, name: String },
    Failing { error: String, name: String },
}

impl TestJob {
    pub const TYPE_NAME: &'static str = "TestJob";

    pub fn simple(name: impl Into<String>) -> Self {
        TestJob::Simple { name: name.into() }
    }

    pub fn slow(name: impl Into<String>, duration: Duration) -> Self {
        TestJob::Slow {
            duration_ms: duration.as_millis() as u64,
            name: name.into(),
        }
    }

    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        TestJob::Failing {
            error: error.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TestJob::Simple { name } => name,
            TestJob::Slow { name, .. } => name,
            TestJob::Failing { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TestJob::Simple { .. } => "simple",
            TestJob::Slow { .. } => "slow",
            TestJob::Failing { .. } => "failing",
        }
    }

    pub fn invocation(&self) -> InvocationData {
        let invocation = InvocationData::new(Self::TYPE_NAME, self.kind()).with_arg(self.name());
        match self {
            TestJob::Simple { .. } => invocation,
            TestJob::Slow { duration_ms, .. } => invocation.with_arg(*duration_ms),
            TestJob::Failing { error, .. } => invocation.with_arg(error.as_str()),
        }
    }

    /// Reads a job back from its invocation; `None` for anything else.
    pub fn from_invocation(invocation: &InvocationData) -> Option<Self> {
        if invocation.type_name != Self::TYPE_NAME {
            return None;
        }
        let name = invocation.args.first()?.as_str()?.to_string();
        match invocation.method.as_str() {
            "simple" => Some(TestJob::Simple { name }),
            "slow" => {
                let duration_ms = invocation.args.get(1).and_then(Value::as_u64)?;
                Some(TestJob::Slow { duration_ms, name })
            }
            "failing" => {
                let error = invocation.args.get(1)?.as_str()?.to_string();
                Some(TestJob::Failing { error, name })
            }
            _ => None,
        }
    }
}

impl From<TestJob> for InvocationData {
    fn from(job: TestJob) -> Self {
        job.invocation()
    }
}

/// Creates `job` Enqueued on `queue`, bypassing elect-state filters.
pub async fn enqueue(storage: &InMemoryStorage, job: TestJob, queue: &str) -> JobId {
    crate::client(storage)
        .enqueue(job.invocation(), queue)
        .await
        .expect("failed to enqueue test job")
}

/// Creates `job` Scheduled for `enqueue_at`, remembering `queue`.
pub async fn schedule(
    storage: &InMemoryStorage,
    job: TestJob,
    queue: &str,
    enqueue_at: DateTime<Utc>,
) -> JobId {
    crate::client(storage)
        .schedule_at(job.invocation(), queue, enqueue_at)
        .await
        .expect("failed to schedule test job")
}
