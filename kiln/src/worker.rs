//! The worker: fetch, claim, perform, settle.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cancellation::{sleep_or_cancel, CancelLevel};
use crate::config::WorkerOptions;
use crate::error::{Error, Result};
use crate::events::ServerEventPayload;
use crate::identity::{ExecutionId, ServerId};
use crate::job::JobId;
use crate::lease::{JobCancellationToken, LeaseTokenRegistry};
use crate::performer::{BackgroundJobPerformer, PerformContext};
use crate::runtime::process::{BackgroundProcess, ProcessContext};
use crate::state::{JobState, ENQUEUED, PROCESSING};
use crate::state_changer::{ChangeStateRequest, StateChanger};
use crate::storage::{FetchedJob, StorageConnection};
use crate::telemetry;

pub const PROCESSING_FAILED_REASON: &str = "An exception occurred during processing of a background job.";

/// Where a state-change retry loop gives up when cancelled.
struct AbortOn<'a> {
    token: &'a CancellationToken,
    level: CancelLevel,
}

pub struct Worker {
    queues: Vec<String>,
    count: usize,
    options: WorkerOptions,
    state_changer: StateChanger,
    performer: BackgroundJobPerformer,
    registry: LeaseTokenRegistry,
}

impl Worker {
    pub fn new(
        queues: Vec<String>,
        count: usize,
        options: WorkerOptions,
        state_changer: StateChanger,
        performer: BackgroundJobPerformer,
        registry: LeaseTokenRegistry,
    ) -> Self {
        Self {
            queues,
            count,
            options,
            state_changer,
            performer,
            registry,
        }
    }

    async fn process(
        &self,
        ctx: &ProcessContext,
        connection: &dyn StorageConnection,
        fetched: &mut dyn FetchedJob,
    ) -> Result<()> {
        let job_id = fetched.job_id().clone();
        let owner = (ctx.server_id.clone(), ctx.execution_id);

        let deadline = Instant::now() + self.options.job_initialization_timeout();
        let claim = JobState::processing(ctx.server_id.clone(), ctx.execution_id);
        let applied = self
            .try_change_state(
                ctx,
                connection,
                &job_id,
                claim,
                &[ENQUEUED, PROCESSING],
                None,
                Some(deadline),
                AbortOn {
                    token: ctx.tokens.stopping(),
                    level: CancelLevel::Stopping,
                },
            )
            .await?;

        if applied.as_deref() != Some(PROCESSING) {
            tracing::debug!(
                %job_id,
                applied = applied.as_deref().unwrap_or("<none>"),
                "job was not claimed, removing it from the queue"
            );
            fetched.acknowledge().await?;
            return Ok(());
        }

        let Some(next_state) = self.perform(ctx, connection, &job_id).await? else {
            fetched.acknowledge().await?;
            return Ok(());
        };

        let settled = self
            .try_change_state(
                ctx,
                connection,
                &job_id,
                next_state,
                &[PROCESSING],
                Some(owner),
                None,
                AbortOn {
                    token: ctx.tokens.shutdown(),
                    level: CancelLevel::Shutdown,
                },
            )
            .await?;

        fetched.acknowledge().await?;
        if let Some(state) = settled {
            ctx.publish(ServerEventPayload::JobSettled { job_id, state });
        }
        Ok(())
    }

    /// Performs the job and turns the outcome into the next state.
    ///
    /// `Ok(None)` means the job should be forgotten: it vanished or its
    /// claim was revoked while it ran.
    async fn perform(
        &self,
        ctx: &ProcessContext,
        connection: &dyn StorageConnection,
        job_id: &JobId,
    ) -> Result<Option<JobState>> {
        let Some(job_data) = connection.get_job_data(job_id).await? else {
            tracing::warn!(%job_id, "job data is gone, skipping");
            return Ok(None);
        };

        let job = job_data.to_background_job(job_id.clone());
        let latency = (Utc::now() - job.created_at).to_std().unwrap_or_default();
        let cancellation = JobCancellationToken::new(
            job_id.clone(),
            ctx.server_id.clone(),
            ctx.execution_id,
            ctx.tokens.stopped(),
            CancelLevel::Stopped,
            &self.registry,
        );
        let perform_ctx = PerformContext {
            job,
            server_id: ctx.server_id.clone(),
            cancellation,
        };

        let started = Instant::now();
        let result = self.performer.perform(&perform_ctx).await;
        let duration = started.elapsed();

        if perform_ctx.cancellation.is_aborted() {
            tracing::info!(%job_id, "job was aborted, its new owner decides its fate");
            telemetry::record_job_performed("aborted", latency, duration);
            return Ok(None);
        }

        match result {
            Ok(value) => {
                telemetry::record_job_performed("succeeded", latency, duration);
                Ok(Some(JobState::succeeded(value, latency, duration)))
            }
            Err(Error::JobAborted(_)) => {
                telemetry::record_job_performed("aborted", latency, duration);
                Ok(None)
            }
            Err(error) if error.is_cancellation() && ctx.is_stopped() => {
                tracing::info!(%job_id, "job was cancelled by server shutdown");
                Err(error)
            }
            Err(error) => {
                tracing::warn!(%job_id, error = %error, "job failed");
                telemetry::record_job_performed("failed", latency, duration);
                Ok(Some(
                    JobState::failed(&error, Some(ctx.server_id.clone()))
                        .with_reason(PROCESSING_FAILED_REASON),
                ))
            }
        }
    }

    /// Retries a transition with linear backoff, then forces Failed.
    #[allow(clippy::too_many_arguments)]
    async fn try_change_state(
        &self,
        ctx: &ProcessContext,
        connection: &dyn StorageConnection,
        job_id: &JobId,
        state: JobState,
        expected: &[&str],
        owner: Option<(ServerId, ExecutionId)>,
        deadline: Option<Instant>,
        abort: AbortOn<'_>,
    ) -> Result<Option<String>> {
        let attempts = self.options.max_state_change_attempts;
        let request = || {
            let request = ChangeStateRequest::new(job_id.clone(), state.clone()).expecting(expected);
            match &owner {
                Some((server_id, worker_id)) => request.owned_by(server_id.clone(), *worker_id),
                None => request,
            }
        };

        let mut last_error = None;
        for attempt in 0..attempts {
            let change = self.state_changer.change_state(connection, request());
            let bounded = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, change)
                        .await
                        .unwrap_or_else(|_| {
                            Err(Error::storage("timed out while initializing the job"))
                        }),
                    None => change.await,
                }
            };
            let outcome = tokio::select! {
                biased;
                _ = abort.token.cancelled() => Err(Error::Cancelled(abort.level)),
                outcome = bounded => outcome,
            };

            match outcome {
                Ok(applied) => return Ok(applied),
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        %job_id,
                        state = state.name(),
                        attempt = attempt + 1,
                        error = %error,
                        "state change failed"
                    );
                    telemetry::record_state_change_retry(state.name());
                    last_error = Some(error);
                }
            }

            let delay = Duration::from_secs(u64::from(attempt));
            if let Some(deadline) = deadline {
                if attempt + 1 < attempts && Instant::now() + delay >= deadline {
                    let error = last_error
                        .map_or_else(|| "no attempt completed".to_string(), |error| error.to_string());
                    tracing::warn!(
                        %job_id,
                        attempts = attempt + 1,
                        error = %error,
                        "job initialization timed out"
                    );
                    return Err(Error::storage(format!(
                        "job initialization timed out after {} attempt(s): {error}",
                        attempt + 1
                    )));
                }
            }

            if !sleep_or_cancel(abort.token, delay).await {
                return Err(Error::Cancelled(abort.level));
            }
        }

        let error = last_error.unwrap_or_else(|| Error::storage("state change was never attempted"));
        tracing::error!(
            %job_id,
            state = state.name(),
            attempts,
            error = %error,
            "state change retries exhausted, forcing Failed state"
        );
        let failed = JobState::failed(&error, Some(ctx.server_id.clone())).with_reason(format!(
            "Failed to change state to a '{}' one due to an exception after {attempts} retry attempt(s)",
            state.name()
        ));
        let mut forced = ChangeStateRequest::new(job_id.clone(), failed)
            .expecting(expected)
            .without_filters();
        forced.expected_owner = owner;
        self.state_changer.change_state(connection, forced).await
    }
}

#[async_trait]
impl BackgroundProcess for Worker {
    fn name(&self) -> &str {
        "Worker"
    }

    fn concurrency(&self) -> usize {
        self.count
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let connection = ctx.storage.connection().await?;
        let mut fetched = connection
            .fetch_next_job(&self.queues, ctx.tokens.stopping())
            .await
            .map_err(|error| {
                if error.is_cancellation() {
                    ctx.tokens.cancelled_error()
                } else {
                    error
                }
            })?;

        let span = telemetry::worker_span(fetched.job_id(), fetched.queue(), ctx.execution_id);
        let outcome = self
            .process(ctx, connection.as_ref(), fetched.as_mut())
            .instrument(span)
            .await;

        if let Err(error) = &outcome {
            tracing::warn!(
                job_id = %fetched.job_id(),
                error = %error,
                "job processing interrupted, returning it to the queue"
            );
            if let Err(requeue_error) = fetched.requeue().await {
                tracing::error!(
                    job_id = %fetched.job_id(),
                    error = %requeue_error,
                    "failed to requeue job"
                );
            }
        }
        outcome
    }
}
