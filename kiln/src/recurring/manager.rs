use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{
    entity_lock_resource, MisfireHandling, RecurringJobEntity, RecurringJobFactory, CURRENT_VERSION,
    MAX_SUPPORTED_VERSION,
};
use crate::config::validate_queue_name;
use crate::cron::{CronOccurrences, OccurrenceCalculator};
use crate::error::{Error, Result};
use crate::job::{InvocationData, JobId};
use crate::state::DEFAULT_QUEUE;
use crate::state_changer::StateChanger;
use crate::storage::{score_of, JobStorage, RECURRING_JOBS_SET};

const MANUAL_TRIGGER_REASON: &str = "Triggered using recurring job manager";

/// Per-definition settings for [`RecurringJobManager::add_or_update`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringJobOptions {
    pub time_zone: String,
    pub queue: String,
    pub misfire: MisfireHandling,
}

impl Default for RecurringJobOptions {
    fn default() -> Self {
        Self {
            time_zone: "UTC".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            misfire: MisfireHandling::default(),
        }
    }
}

impl RecurringJobOptions {
    pub fn with_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_misfire(mut self, misfire: MisfireHandling) -> Self {
        self.misfire = misfire;
        self
    }
}

/// Creates, updates, triggers and removes recurring job definitions.
pub struct RecurringJobManager {
    storage: Arc<dyn JobStorage>,
    calculator: Arc<dyn OccurrenceCalculator>,
    factory: RecurringJobFactory,
    lock_timeout: Duration,
}

impl RecurringJobManager {
    pub fn new(storage: Arc<dyn JobStorage>, state_changer: StateChanger) -> Self {
        Self {
            storage,
            calculator: Arc::new(CronOccurrences::default()),
            factory: RecurringJobFactory::new(state_changer),
            lock_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_calculator(mut self, calculator: Arc<dyn OccurrenceCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Stores the definition and schedules its next execution.
    ///
    /// An existing definition keeps its execution history; changing the
    /// cron expression or time zone recomputes the next execution, and a
    /// disabled definition is re-enabled.
    pub async fn add_or_update(
        &self,
        id: &str,
        invocation: InvocationData,
        cron: &str,
        options: RecurringJobOptions,
    ) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::Config("recurring job id must not be empty".to_string()));
        }
        self.calculator.validate(cron, &options.time_zone)?;
        validate_queue_name(&options.queue)?;

        let connection = self.storage.connection().await?;
        let _lock = connection
            .acquire_lock(&entity_lock_resource(id), self.lock_timeout)
            .await?;
        let now = Utc::now();

        let existing = connection.get_recurring_job(id).await?;
        if let Some(existing) = &existing {
            if existing.version > MAX_SUPPORTED_VERSION {
                return Err(Error::Config(format!(
                    "recurring job '{id}' was written by a newer version ({}) and can't be updated",
                    existing.version
                )));
            }
        }

        let mut entity = match existing {
            Some(mut entity) => {
                let reschedule = entity.cron != cron
                    || entity.time_zone != options.time_zone
                    || !entity.enabled
                    || entity.next_execution.is_none();
                entity.cron = cron.to_string();
                entity.time_zone = options.time_zone;
                entity.queue = options.queue;
                entity.misfire = options.misfire;
                entity.invocation = invocation;
                if reschedule {
                    entity.next_execution = None;
                }
                entity
            }
            None => RecurringJobEntity {
                id: id.to_string(),
                cron: cron.to_string(),
                time_zone: options.time_zone,
                queue: options.queue,
                invocation,
                created_at: now,
                last_execution: None,
                next_execution: None,
                last_job_id: None,
                retry_attempt: 0,
                enabled: true,
                error: None,
                version: CURRENT_VERSION,
                misfire: options.misfire,
            },
        };
        entity.version = CURRENT_VERSION;
        entity.enabled = true;
        entity.retry_attempt = 0;
        entity.error = None;
        if entity.next_execution.is_none() {
            // Instants before now are not owed to a freshly (re)scheduled definition.
            entity.last_execution = Some(entity.window_start().max(now));
            entity.next_execution = self.calculator.next_occurrence(cron, &entity.time_zone, now)?;
        }

        let mut transaction = connection.create_write_transaction();
        match entity.next_execution {
            Some(next) => transaction.add_to_set(RECURRING_JOBS_SET, id, score_of(next)),
            None => transaction.remove_from_set(RECURRING_JOBS_SET, id),
        }
        tracing::info!(
            recurring_job = %id,
            cron,
            next_execution = ?entity.next_execution,
            "recurring job saved"
        );
        transaction.set_recurring_job(entity);
        transaction.commit().await
    }

    /// Enqueues a job for the definition right away, outside its schedule.
    /// Returns `None` when no such definition exists.
    pub async fn trigger(&self, id: &str) -> Result<Option<JobId>> {
        let connection = self.storage.connection().await?;
        let _lock = connection
            .acquire_lock(&entity_lock_resource(id), self.lock_timeout)
            .await?;
        let Some(mut entity) = connection.get_recurring_job(id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let mut transaction = connection.create_write_transaction();
        let job_id = self
            .factory
            .trigger(connection.as_ref(), transaction.as_mut(), &entity, now, MANUAL_TRIGGER_REASON)
            .await?;
        entity.last_job_id = Some(job_id.clone());
        transaction.set_recurring_job(entity);
        transaction.commit().await?;
        tracing::info!(recurring_job = %id, %job_id, "recurring job triggered manually");
        Ok(Some(job_id))
    }

    pub async fn remove_if_exists(&self, id: &str) -> Result<()> {
        let connection = self.storage.connection().await?;
        let _lock = connection
            .acquire_lock(&entity_lock_resource(id), self.lock_timeout)
            .await?;
        let mut transaction = connection.create_write_transaction();
        transaction.remove_from_set(RECURRING_JOBS_SET, id);
        transaction.remove_recurring_job(id);
        transaction.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ENQUEUED;
    use crate::storage::memory::InMemoryStorage;
    use crate::storage::StorageConnection;

    fn manager(storage: &InMemoryStorage) -> RecurringJobManager {
        RecurringJobManager::new(Arc::new(storage.clone()), StateChanger::new(Vec::new()))
    }

    #[tokio::test]
    async fn add_or_update_schedules_next_execution() {
        let storage = InMemoryStorage::default();
        manager(&storage)
            .add_or_update(
                "nightly",
                InvocationData::new("Reports", "build"),
                "0 3 * * *",
                RecurringJobOptions::default().with_time_zone("Europe/Berlin"),
            )
            .await
            .unwrap();

        let entity = storage.recurring_job("nightly").unwrap();
        let next = entity.next_execution.unwrap();
        assert!(next > Utc::now());
        assert_eq!(entity.version, CURRENT_VERSION);
        assert_eq!(storage.set_score(RECURRING_JOBS_SET, "nightly"), Some(score_of(next)));
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let storage = InMemoryStorage::default();
        let manager = manager(&storage);
        let invocation = InvocationData::new("Reports", "build");

        let error = manager
            .add_or_update("bad", invocation.clone(), "every day", RecurringJobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidCron { .. }));

        let error = manager
            .add_or_update(
                "bad",
                invocation,
                "* * * * *",
                RecurringJobOptions::default().with_time_zone("Mars/Olympus"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UnknownTimeZone(_)));
        assert!(storage.recurring_job("bad").is_none());
    }

    #[tokio::test]
    async fn update_keeps_history_and_reenables() {
        let storage = InMemoryStorage::default();
        let manager = manager(&storage);
        let invocation = InvocationData::new("Reports", "build");
        manager
            .add_or_update("r", invocation.clone(), "* * * * *", RecurringJobOptions::default())
            .await
            .unwrap();
        let created_at = storage.recurring_job("r").unwrap().created_at;

        let conn = storage.open();
        let mut disabled = storage.recurring_job("r").unwrap();
        disabled.enabled = false;
        disabled.error = Some("boom".to_string());
        let mut tx = conn.create_write_transaction();
        tx.set_recurring_job(disabled);
        tx.remove_from_set(RECURRING_JOBS_SET, "r");
        tx.commit().await.unwrap();

        manager
            .add_or_update("r", invocation, "*/5 * * * *", RecurringJobOptions::default())
            .await
            .unwrap();
        let entity = storage.recurring_job("r").unwrap();
        assert!(entity.enabled);
        assert!(entity.error.is_none());
        assert_eq!(entity.created_at, created_at);
        assert_eq!(entity.cron, "*/5 * * * *");
        assert!(storage.set_score(RECURRING_JOBS_SET, "r").is_some());
    }

    #[tokio::test]
    async fn trigger_enqueues_immediately() {
        let storage = InMemoryStorage::default();
        let manager = manager(&storage);
        manager
            .add_or_update(
                "now",
                InvocationData::new("Reports", "build"),
                "0 0 1 1 *",
                RecurringJobOptions::default().with_queue("critical"),
            )
            .await
            .unwrap();

        let job_id = manager.trigger("now").await.unwrap().unwrap();

        assert_eq!(storage.job_state(&job_id).unwrap().name, ENQUEUED);
        assert_eq!(storage.queue_len("critical"), 1);
        assert_eq!(storage.recurring_job("now").unwrap().last_job_id, Some(job_id));
        assert!(manager.trigger("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_if_exists_is_idempotent() {
        let storage = InMemoryStorage::default();
        let manager = manager(&storage);
        manager
            .add_or_update("gone", InvocationData::new("T", "m"), "* * * * *", RecurringJobOptions::default())
            .await
            .unwrap();

        manager.remove_if_exists("gone").await.unwrap();
        manager.remove_if_exists("gone").await.unwrap();

        assert!(storage.recurring_job("gone").is_none());
        assert_eq!(storage.set_len(RECURRING_JOBS_SET), 0);
    }
}
