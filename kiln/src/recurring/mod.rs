//! Recurring jobs: cron-driven definitions that enqueue a fresh background
//! job every time their schedule fires.
//!
//! Definitions live in storage as [`RecurringJobEntity`] values, indexed by
//! the [`RECURRING_JOBS_SET`](crate::storage::RECURRING_JOBS_SET) sorted set
//! scored by their next execution. The [`RecurringJobManager`] writes them,
//! the [`RecurringJobScheduler`] fires them.

mod manager;
mod scheduler;

pub use manager::{RecurringJobManager, RecurringJobOptions};
pub use scheduler::RecurringJobScheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::delayed::QUEUE_PARAMETER;
use crate::error::Result;
use crate::job::{InvocationData, JobId};
use crate::state::JobState;
use crate::state_changer::{ChangeStateRequest, StateChanger};
use crate::storage::{StorageConnection, WriteTransaction};

/// Entity schema version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// Entities with a higher version are left alone by this build.
pub const MAX_SUPPORTED_VERSION: u32 = 2;

/// Job parameter naming the recurring job that triggered a background job.
pub const RECURRING_JOB_ID_PARAMETER: &str = "RecurringJobId";

/// Job parameter holding the cron instant a background job was fired for.
pub const TIME_PARAMETER: &str = "Time";

/// Lock serializing scheduler passes across servers.
pub const RECURRING_SCHEDULER_LOCK: &str = "recurring-jobs:lock";

/// Lock guarding a single entity against concurrent scheduling and edits.
pub fn entity_lock_resource(id: &str) -> String {
    format!("lock:recurring-job:{id}")
}

pub(crate) fn shift(instant: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| instant.checked_add_signed(by))
        .unwrap_or(instant)
}

/// How instants missed while no server was polling get fired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfireHandling {
    /// One job stands in for every missed instant.
    #[default]
    Relaxed,
    /// One job per missed instant.
    Strict,
    /// Only the instant closest to now fires, and only if it is within the
    /// precision window; older ones are dropped.
    Ignorable,
}

impl MisfireHandling {
    /// Picks the instants to fire out of the ascending `due` list.
    pub fn select(
        self,
        due: &[DateTime<Utc>],
        now: DateTime<Utc>,
        precision: Duration,
    ) -> Vec<DateTime<Utc>> {
        match self {
            MisfireHandling::Strict => due.to_vec(),
            MisfireHandling::Relaxed => due.last().copied().into_iter().collect(),
            MisfireHandling::Ignorable => {
                let precision = chrono::Duration::from_std(precision).unwrap_or(chrono::Duration::MAX);
                due.last()
                    .copied()
                    .filter(|instant| now.signed_duration_since(*instant) <= precision)
                    .into_iter()
                    .collect()
            }
        }
    }
}

/// Persisted definition of a recurring job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurringJobEntity {
    pub id: String,
    pub cron: String,
    pub time_zone: String,
    pub queue: String,
    pub invocation: InvocationData,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_id: Option<JobId>,
    #[serde(default)]
    pub retry_attempt: u32,
    pub enabled: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub version: u32,
    #[serde(default)]
    pub misfire: MisfireHandling,
}

impl RecurringJobEntity {
    /// Lower bound of the next catch-up window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.last_execution.unwrap_or(self.created_at)
    }
}

/// Creates the background jobs a recurring job fires.
///
/// The job record is written directly; its Enqueued state is staged into the
/// caller's transaction so it lands together with the entity update.
#[derive(Clone)]
pub(crate) struct RecurringJobFactory {
    state_changer: StateChanger,
}

impl RecurringJobFactory {
    /// Orphaned job records left by an uncommitted trigger expire after this.
    const ORPHAN_EXPIRATION: Duration = Duration::from_secs(60 * 60);

    pub(crate) fn new(state_changer: StateChanger) -> Self {
        Self { state_changer }
    }

    pub(crate) async fn trigger(
        &self,
        connection: &dyn StorageConnection,
        transaction: &mut dyn WriteTransaction,
        entity: &RecurringJobEntity,
        instant: DateTime<Utc>,
        reason: &str,
    ) -> Result<JobId> {
        let mut parameters = BTreeMap::new();
        parameters.insert(RECURRING_JOB_ID_PARAMETER.to_string(), entity.id.clone());
        parameters.insert(TIME_PARAMETER.to_string(), instant.timestamp().to_string());
        parameters.insert(QUEUE_PARAMETER.to_string(), entity.queue.clone());

        let job_id = connection
            .create_job(
                &entity.invocation,
                parameters,
                Utc::now(),
                Self::ORPHAN_EXPIRATION,
            )
            .await?;

        let state = JobState::enqueued(entity.queue.clone()).with_reason(reason);
        let applied = self
            .state_changer
            .stage(
                connection,
                transaction,
                ChangeStateRequest::new(job_id.clone(), state),
            )
            .await?;
        tracing::debug!(
            recurring_job = %entity.id,
            %job_id,
            state = applied.as_deref().unwrap_or("<none>"),
            "recurring job triggered"
        );
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn relaxed_fires_once_for_all_missed() {
        let due = vec![at(1), at(2), at(3)];
        let fired = MisfireHandling::Relaxed.select(&due, at(3), Duration::from_secs(30));
        assert_eq!(fired, vec![at(3)]);
    }

    #[test]
    fn strict_fires_every_missed_instant() {
        let due = vec![at(1), at(2), at(3)];
        let fired = MisfireHandling::Strict.select(&due, at(3), Duration::from_secs(30));
        assert_eq!(fired, due);
    }

    #[test]
    fn ignorable_drops_stale_instants() {
        let due = vec![at(1), at(2)];
        assert!(MisfireHandling::Ignorable
            .select(&due, at(5), Duration::from_secs(30))
            .is_empty());
        assert_eq!(
            MisfireHandling::Ignorable.select(&due, at(2), Duration::from_secs(30)),
            vec![at(2)]
        );
    }

    #[test]
    fn entity_round_trips_through_json_with_defaults() {
        let json = serde_json::json!({
            "id": "report",
            "cron": "* * * * *",
            "time_zone": "UTC",
            "queue": "default",
            "invocation": { "type_name": "Reports", "method": "build" },
            "created_at": "2026-01-01T12:00:00Z",
            "enabled": true,
            "version": 2
        });
        let entity: RecurringJobEntity = serde_json::from_value(json).unwrap();
        assert_eq!(entity.misfire, MisfireHandling::Relaxed);
        assert_eq!(entity.retry_attempt, 0);
        assert_eq!(entity.window_start(), at(0));
    }
}
