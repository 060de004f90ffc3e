use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::{
    entity_lock_resource, shift, RecurringJobEntity, RecurringJobFactory, MAX_SUPPORTED_VERSION,
    RECURRING_SCHEDULER_LOCK,
};
use crate::cancellation::sleep_or_cancel;
use crate::config::RecurringSchedulerOptions;
use crate::cron::{CronOccurrences, OccurrenceCalculator};
use crate::error::{Error, Result};
use crate::runtime::execution::backoff_delay;
use crate::runtime::process::{BackgroundProcess, ProcessContext};
use crate::state_changer::StateChanger;
use crate::storage::{score_of, StorageConnection, RECURRING_JOBS_SET};
use crate::telemetry;

pub const TRIGGER_REASON: &str = "Triggered by recurring job scheduler";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Fires due recurring jobs.
///
/// Each entity is handled under its own lock: the jobs it fires, its new
/// last execution and its next score are committed in one transaction, so a
/// crash before the commit makes the next pass recompute the same window.
pub struct RecurringJobScheduler {
    options: RecurringSchedulerOptions,
    calculator: Arc<dyn OccurrenceCalculator>,
    factory: RecurringJobFactory,
}

impl RecurringJobScheduler {
    pub fn new(options: RecurringSchedulerOptions, state_changer: StateChanger) -> Self {
        Self::with_calculator(options, state_changer, Arc::new(CronOccurrences::default()))
    }

    pub fn with_calculator(
        options: RecurringSchedulerOptions,
        state_changer: StateChanger,
        calculator: Arc<dyn OccurrenceCalculator>,
    ) -> Self {
        Self {
            options,
            calculator,
            factory: RecurringJobFactory::new(state_changer),
        }
    }

    /// One pass over due entities. Returns how many were handled; entities
    /// locked by someone else are skipped and not counted.
    pub async fn schedule_next_batch(&self, ctx: &ProcessContext) -> Result<usize> {
        let connection = ctx.storage.connection().await?;
        let _lock = match connection
            .acquire_lock(RECURRING_SCHEDULER_LOCK, self.options.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(error) if error.is_lock_timeout() => {
                tracing::debug!("another server is scheduling recurring jobs, skipping this pass");
                return Ok(0);
            }
            Err(error) => return Err(error),
        };

        let now = Utc::now();
        let due = connection
            .get_first_by_lowest_score(
                RECURRING_JOBS_SET,
                0.0,
                score_of(now),
                self.options.batch_size,
            )
            .await?;

        let mut processed = 0;
        for id in &due {
            if ctx.is_stopping() {
                break;
            }
            if self.schedule_entity(connection.as_ref(), id, now).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    async fn schedule_entity(
        &self,
        connection: &dyn StorageConnection,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _lock = match connection
            .acquire_lock(&entity_lock_resource(id), self.options.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(error) if error.is_lock_timeout() => {
                tracing::debug!(recurring_job = %id, "recurring job is locked, skipping");
                return Ok(false);
            }
            Err(error) => return Err(error),
        };

        let Some(entity) = connection.get_recurring_job(id).await? else {
            tracing::warn!(recurring_job = %id, "schedule entry has no recurring job, removing it");
            let mut transaction = connection.create_write_transaction();
            transaction.remove_from_set(RECURRING_JOBS_SET, id);
            transaction.commit().await?;
            return Ok(true);
        };

        if entity.version > MAX_SUPPORTED_VERSION {
            tracing::debug!(
                recurring_job = %id,
                version = entity.version,
                supported = MAX_SUPPORTED_VERSION,
                "recurring job was written by a newer version, leaving it alone"
            );
            let mut transaction = connection.create_write_transaction();
            transaction.add_to_set(
                RECURRING_JOBS_SET,
                id,
                score_of(shift(now, self.options.polling_delay())),
            );
            transaction.commit().await?;
            return Ok(true);
        }

        if !entity.enabled {
            let mut transaction = connection.create_write_transaction();
            transaction.remove_from_set(RECURRING_JOBS_SET, id);
            transaction.commit().await?;
            return Ok(true);
        }

        match self.fire(connection, &entity, now).await {
            Ok(fired) => {
                if fired > 0 {
                    telemetry::record_scheduler_triggered("recurring", fired);
                }
            }
            Err(error) if error.is_cancellation() => return Err(error),
            Err(error) => self.handle_failure(connection, entity, error, now).await?,
        }
        Ok(true)
    }

    /// Fires the instants due for `entity` and commits its bookkeeping.
    async fn fire(
        &self,
        connection: &dyn StorageConnection,
        entity: &RecurringJobEntity,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let precision = self.options.precision();
        let due = self.calculator.occurrences(
            &entity.cron,
            &entity.time_zone,
            entity.window_start(),
            shift(now, precision / 2),
        )?;
        let fired = entity.misfire.select(&due, now, precision);

        let mut updated = entity.clone();
        let mut transaction = connection.create_write_transaction();
        for instant in &fired {
            let job_id = self
                .factory
                .trigger(connection, transaction.as_mut(), &updated, *instant, TRIGGER_REASON)
                .await?;
            updated.last_job_id = Some(job_id);
        }

        if let Some(latest) = due.last() {
            updated.last_execution = Some((*latest).max(now));
        }
        updated.retry_attempt = 0;
        updated.error = None;
        updated.next_execution = self.calculator.next_occurrence(
            &updated.cron,
            &updated.time_zone,
            updated.window_start().max(now),
        )?;

        match updated.next_execution {
            Some(next) => transaction.add_to_set(RECURRING_JOBS_SET, &updated.id, score_of(next)),
            None => {
                tracing::info!(recurring_job = %updated.id, "cron expression never fires again");
                transaction.remove_from_set(RECURRING_JOBS_SET, &updated.id);
            }
        }
        if due.len() > fired.len() {
            tracing::debug!(
                recurring_job = %updated.id,
                due = due.len(),
                fired = fired.len(),
                misfire = ?updated.misfire,
                "missed instants merged"
            );
        }
        transaction.set_recurring_job(updated);
        transaction.commit().await?;
        Ok(fired.len())
    }

    async fn handle_failure(
        &self,
        connection: &dyn StorageConnection,
        mut entity: RecurringJobEntity,
        error: Error,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut transaction = connection.create_write_transaction();
        if entity.retry_attempt < self.options.max_retry_attempts {
            entity.retry_attempt += 1;
            let delay = backoff_delay(entity.retry_attempt, MAX_RETRY_DELAY);
            tracing::warn!(
                recurring_job = %entity.id,
                attempt = entity.retry_attempt,
                max_attempts = self.options.max_retry_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "recurring job could not be scheduled, will retry"
            );
            entity.error = Some(error.to_string());
            transaction.add_to_set(RECURRING_JOBS_SET, &entity.id, score_of(shift(now, delay)));
        } else {
            tracing::error!(
                recurring_job = %entity.id,
                attempts = entity.retry_attempt,
                error = %error,
                "recurring job could not be scheduled, disabling it"
            );
            entity.enabled = false;
            entity.next_execution = None;
            entity.error = Some(format!(
                "Recurring job can't be scheduled due to an error and was disabled: {}",
                error.details()
            ));
            transaction.remove_from_set(RECURRING_JOBS_SET, &entity.id);
        }
        transaction.set_recurring_job(entity);
        transaction.commit().await
    }
}

#[async_trait]
impl BackgroundProcess for RecurringJobScheduler {
    fn name(&self) -> &str {
        "RecurringJobScheduler"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let span = telemetry::recurring_span(&ctx.server_id);
        async {
            loop {
                let processed = self.schedule_next_batch(ctx).await?;
                if processed == 0 || ctx.is_stopping() {
                    break;
                }
                tracing::debug!(processed, "recurring jobs scheduled");
            }
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await?;

        sleep_or_cancel(ctx.tokens.stopping(), self.options.polling_delay()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::ServerTokens;
    use crate::identity::ServerId;
    use crate::job::InvocationData;
    use crate::recurring::{MisfireHandling, CURRENT_VERSION};
    use crate::state::ENQUEUED;
    use crate::storage::memory::InMemoryStorage;

    fn context(storage: &InMemoryStorage) -> ProcessContext {
        ProcessContext::new(
            ServerId::from("test-server"),
            Arc::new(storage.clone()),
            ServerTokens::new(),
        )
    }

    fn entity(id: &str, cron: &str, last_execution: DateTime<Utc>) -> RecurringJobEntity {
        RecurringJobEntity {
            id: id.to_string(),
            cron: cron.to_string(),
            time_zone: "UTC".to_string(),
            queue: "default".to_string(),
            invocation: InvocationData::new("Reports", "build"),
            created_at: last_execution,
            last_execution: Some(last_execution),
            next_execution: None,
            last_job_id: None,
            retry_attempt: 0,
            enabled: true,
            error: None,
            version: CURRENT_VERSION,
            misfire: MisfireHandling::Relaxed,
        }
    }

    async fn store(storage: &InMemoryStorage, entity: RecurringJobEntity, score: DateTime<Utc>) {
        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.add_to_set(RECURRING_JOBS_SET, &entity.id, score_of(score));
        tx.set_recurring_job(entity);
        tx.commit().await.unwrap();
    }

    fn scheduler() -> RecurringJobScheduler {
        RecurringJobScheduler::new(RecurringSchedulerOptions::default(), StateChanger::new(Vec::new()))
    }

    #[tokio::test]
    async fn strict_misfire_fires_every_missed_minute() {
        let storage = InMemoryStorage::default();
        let now = Utc::now();
        let three_ago = now - chrono::Duration::seconds(3 * 60 + 20);
        let mut definition = entity("strict", "0 * * * * *", three_ago);
        definition.misfire = MisfireHandling::Strict;
        store(&storage, definition, three_ago).await;

        let processed = scheduler().schedule_next_batch(&context(&storage)).await.unwrap();

        assert_eq!(processed, 1);
        assert!(storage.queue_len("default") >= 3);
        let stored = storage.recurring_job("strict").unwrap();
        assert!(stored.last_execution.unwrap() >= now);
        assert!(stored.next_execution.unwrap() > now);
        assert_eq!(stored.retry_attempt, 0);
    }

    #[tokio::test]
    async fn missing_entity_is_removed_from_schedule() {
        let storage = InMemoryStorage::default();
        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.add_to_set(RECURRING_JOBS_SET, "ghost", 0.0);
        tx.commit().await.unwrap();

        scheduler().schedule_next_batch(&context(&storage)).await.unwrap();

        assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
    }

    #[tokio::test]
    async fn newer_versions_are_rescheduled_untouched() {
        let storage = InMemoryStorage::default();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let mut definition = entity("future", "0 * * * * *", past);
        definition.version = MAX_SUPPORTED_VERSION + 1;
        store(&storage, definition.clone(), past).await;

        scheduler().schedule_next_batch(&context(&storage)).await.unwrap();

        assert_eq!(storage.recurring_job("future").unwrap(), definition);
        assert_eq!(storage.queue_len("default"), 0);
        assert!(storage.set_score(RECURRING_JOBS_SET, "future").unwrap() > score_of(Utc::now()));
    }

    #[tokio::test]
    async fn failures_retry_then_disable() {
        let storage = InMemoryStorage::default();
        let past = Utc::now() - chrono::Duration::minutes(5);
        store(&storage, entity("broken", "not a cron", past), past).await;
        let scheduler = RecurringJobScheduler::new(
            RecurringSchedulerOptions::default().with_max_retry_attempts(1),
            StateChanger::new(Vec::new()),
        );
        let ctx = context(&storage);

        scheduler.schedule_next_batch(&ctx).await.unwrap();
        let stored = storage.recurring_job("broken").unwrap();
        assert_eq!(stored.retry_attempt, 1);
        assert!(stored.enabled);
        assert!(stored.error.is_some());

        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.add_to_set(RECURRING_JOBS_SET, "broken", score_of(past));
        tx.commit().await.unwrap();

        scheduler.schedule_next_batch(&ctx).await.unwrap();
        let stored = storage.recurring_job("broken").unwrap();
        assert!(!stored.enabled);
        assert!(stored.next_execution.is_none());
        assert!(stored.error.unwrap().contains("disabled"));
        assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
    }

    #[tokio::test]
    async fn fired_jobs_carry_recurring_parameters() {
        let storage = InMemoryStorage::default();
        let past = Utc::now() - chrono::Duration::seconds(90);
        store(&storage, entity("params", "0 * * * * *", past), past).await;

        scheduler().schedule_next_batch(&context(&storage)).await.unwrap();

        let stored = storage.recurring_job("params").unwrap();
        let job_id = stored.last_job_id.unwrap();
        assert_eq!(storage.job_state(&job_id).unwrap().name, ENQUEUED);
        let conn = storage.open();
        let recurring_id = conn
            .get_job_parameter(&job_id, super::super::RECURRING_JOB_ID_PARAMETER)
            .await
            .unwrap();
        assert_eq!(recurring_id.as_deref(), Some("params"));
    }
}
