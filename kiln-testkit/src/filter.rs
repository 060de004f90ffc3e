use async_trait::async_trait;
use kiln::{
    ElectStateContext, ElectStateFilter, JobId, PerformedContext, PerformingContext, Result,
    ServerExceptionContext, ServerFilter,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterCall {
    Performing(JobId),
    Performed { job_id: JobId, failed: bool },
    ServerException(JobId),
    StateElection { job_id: JobId, candidate: String },
}

/// Records every server and elect-state hook it is called with.
#[derive(Clone, Default)]
pub struct RecordingFilter {
    calls: Arc<Mutex<Vec<FilterCall>>>,
    cancel_performing: Arc<AtomicBool>,
    handle_exceptions: Arc<AtomicBool>,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips the job from `on_performing`.
    pub fn cancelling(self) -> Self {
        self.cancel_performing.store(true, Ordering::SeqCst);
        self
    }

    /// Marks failures as handled from `on_performed`.
    pub fn handling_exceptions(self) -> Self {
        self.handle_exceptions.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<FilterCall> {
        self.calls.lock().clone()
    }

    /// Candidate state names elected for `job_id`, in order.
    pub fn elections(&self, job_id: &JobId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                FilterCall::StateElection { job_id: id, candidate } if id == job_id => {
                    Some(candidate.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl ServerFilter for RecordingFilter {
    fn name(&self) -> &str {
        "RecordingFilter"
    }

    async fn on_performing(&self, ctx: &mut PerformingContext) -> Result<()> {
        self.calls.lock().push(FilterCall::Performing(ctx.job.id.clone()));
        if self.cancel_performing.load(Ordering::SeqCst) {
            ctx.canceled = true;
        }
        Ok(())
    }

    async fn on_performed(&self, ctx: &mut PerformedContext) -> Result<()> {
        self.calls.lock().push(FilterCall::Performed {
            job_id: ctx.job.id.clone(),
            failed: ctx.error.is_some(),
        });
        if ctx.error.is_some() && self.handle_exceptions.load(Ordering::SeqCst) {
            ctx.exception_handled = true;
        }
        Ok(())
    }

    async fn on_server_exception(&self, ctx: &mut ServerExceptionContext<'_>) -> Result<()> {
        self.calls
            .lock()
            .push(FilterCall::ServerException(ctx.job.id.clone()));
        Ok(())
    }
}

#[async_trait]
impl ElectStateFilter for RecordingFilter {
    fn name(&self) -> &str {
        "RecordingFilter"
    }

    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<()> {
        self.calls.lock().push(FilterCall::StateElection {
            job_id: ctx.job_id.clone(),
            candidate: ctx.candidate.name().to_string(),
        });
        Ok(())
    }
}
