//! Moves scheduled jobs whose time has come into their queues.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::Instrument;

use crate::cancellation::sleep_or_cancel;
use crate::config::DelayedSchedulerOptions;
use crate::error::{Error, Result};
use crate::job::JobId;
use crate::runtime::process::{BackgroundProcess, ProcessContext};
use crate::state::{JobState, SCHEDULED};
use crate::state_changer::{ChangeStateRequest, StateChanger};
use crate::storage::{score_of, StorageConnection, SCHEDULE_SET};
use crate::telemetry;

pub const SCHEDULE_POLLER_LOCK: &str = "locks:schedulepoller";
pub const ENQUEUE_REASON: &str = "Triggered by DelayedJobScheduler";

pub struct DelayedJobScheduler {
    options: DelayedSchedulerOptions,
    state_changer: StateChanger,
}

impl DelayedJobScheduler {
    pub fn new(options: DelayedSchedulerOptions, state_changer: StateChanger) -> Self {
        Self {
            options,
            state_changer,
        }
    }

    /// One pass over due entries. Returns how many were handled.
    ///
    /// A lock timeout means a peer holds the poller lock; the pass then
    /// handles nothing and is not an error.
    pub async fn enqueue_next_batch(&self, ctx: &ProcessContext) -> Result<usize> {
        let connection = ctx.storage.connection().await?;
        let _lock = match connection
            .acquire_lock(SCHEDULE_POLLER_LOCK, self.options.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(error) if error.is_lock_timeout() => {
                tracing::debug!("another server is enqueueing scheduled jobs, skipping this pass");
                return Ok(0);
            }
            Err(error) => return Err(error),
        };

        let now = score_of(Utc::now());
        let due: Vec<JobId> = connection
            .get_first_by_lowest_score(SCHEDULE_SET, 0.0, now, self.options.batch_size)
            .await?
            .into_iter()
            .map(JobId::from)
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        let parallel = self.options.max_degree_of_parallelism > 1
            && ctx.storage.capabilities().batched_reads;

        if parallel {
            let results: Vec<Result<bool>> = stream::iter(due)
                .map(|job_id| async move {
                    if ctx.is_stopping() {
                        return Ok::<_, Error>(false);
                    }
                    let connection = ctx.storage.connection().await?;
                    self.enqueue_job(ctx, connection.as_ref(), &job_id).await?;
                    Ok(true)
                })
                .buffer_unordered(self.options.max_degree_of_parallelism)
                .collect()
                .await;
            let mut processed = 0;
            for result in results {
                if result? {
                    processed += 1;
                }
            }
            Ok(processed)
        } else {
            let mut processed = 0;
            for job_id in &due {
                if ctx.is_stopping() {
                    break;
                }
                self.enqueue_job(ctx, connection.as_ref(), job_id).await?;
                processed += 1;
            }
            Ok(processed)
        }
    }

    async fn enqueue_job(
        &self,
        ctx: &ProcessContext,
        connection: &dyn StorageConnection,
        job_id: &JobId,
    ) -> Result<()> {
        let attempts = self.options.max_state_change_attempts;
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.try_enqueue(ctx, connection, job_id).await {
                Ok(()) => {
                    telemetry::record_scheduler_triggered("delayed", 1);
                    return Ok(());
                }
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) => {
                    tracing::debug!(
                        %job_id,
                        attempt = attempt + 1,
                        error = %error,
                        "failed to enqueue scheduled job"
                    );
                    last_error = Some(error);
                }
            }
            if !sleep_or_cancel(ctx.tokens.stopping(), Duration::from_secs(u64::from(attempt))).await {
                return Err(ctx.tokens.cancelled_error());
            }
        }

        let error = last_error.unwrap_or_else(|| Error::storage("enqueue was never attempted"));
        tracing::warn!(
            %job_id,
            attempts,
            error = %error,
            "giving up on scheduled job, moving it to Failed and out of the schedule"
        );
        let failed = JobState::failed(&error, Some(ctx.server_id.clone())).with_reason(format!(
            "Failed to change state to the 'Enqueued' one due to an exception after {attempts} retry attempt(s)"
        ));
        self.state_changer
            .change_state(
                connection,
                ChangeStateRequest::new(job_id.clone(), failed)
                    .expecting(&[SCHEDULED])
                    .without_filters(),
            )
            .await?;

        let mut transaction = connection.create_write_transaction();
        transaction.remove_from_set(SCHEDULE_SET, job_id.as_str());
        transaction.commit().await
    }

    async fn try_enqueue(
        &self,
        ctx: &ProcessContext,
        connection: &dyn StorageConnection,
        job_id: &JobId,
    ) -> Result<()> {
        let request = ChangeStateRequest::new(
            job_id.clone(),
            JobState::enqueued(crate::state::DEFAULT_QUEUE).with_reason(ENQUEUE_REASON),
        )
        .expecting(&[SCHEDULED]);
        let request = self.with_original_queue(connection, request).await?;

        if ctx.storage.capabilities().transactional_state_moves {
            let _lock = connection
                .acquire_lock(
                    &StateChanger::state_lock_resource(job_id),
                    self.options.lock_timeout(),
                )
                .await?;
            let mut transaction = connection.create_write_transaction();
            let applied = self
                .state_changer
                .stage(connection, transaction.as_mut(), request)
                .await?;
            if applied.is_none() {
                tracing::debug!(%job_id, "scheduled job is gone or no longer scheduled, dropping entry");
            }
            transaction.remove_from_set(SCHEDULE_SET, job_id.as_str());
            return transaction.commit().await;
        }

        if self.state_changer.change_state(connection, request).await?.is_none() {
            tracing::debug!(%job_id, "scheduled job is gone or no longer scheduled, dropping entry");
            let mut transaction = connection.create_write_transaction();
            transaction.remove_from_set(SCHEDULE_SET, job_id.as_str());
            transaction.commit().await?;
        }
        Ok(())
    }

    /// Jobs scheduled for a specific queue keep it when enqueued.
    async fn with_original_queue(
        &self,
        connection: &dyn StorageConnection,
        mut request: ChangeStateRequest,
    ) -> Result<ChangeStateRequest> {
        if let Some(queue) = connection
            .get_job_parameter(&request.job_id, QUEUE_PARAMETER)
            .await?
        {
            let reason = request.new_state.reason.take();
            request.new_state = JobState::enqueued(queue);
            request.new_state.reason = reason;
        }
        Ok(request)
    }
}

/// Job parameter naming the queue a scheduled job enqueues into.
pub const QUEUE_PARAMETER: &str = "Queue";

#[async_trait]
impl BackgroundProcess for DelayedJobScheduler {
    fn name(&self) -> &str {
        "DelayedJobScheduler"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let span = telemetry::schedule_span(&ctx.server_id);
        async {
            loop {
                let processed = self.enqueue_next_batch(ctx).await?;
                if processed == 0 || ctx.is_stopping() {
                    break;
                }
                tracing::debug!(processed, "scheduled jobs enqueued");
            }
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await?;

        sleep_or_cancel(ctx.tokens.stopping(), self.options.polling_delay()).await;
        Ok(())
    }
}
