//! Compare-and-set job state transitions.

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::filters::{ElectStateContext, ElectStateFilter};
use crate::identity::{ExecutionId, ServerId};
use crate::job::JobId;
use crate::state::{JobState, StateData, StateKind, SCHEDULED};
use crate::storage::{score_of, StorageConnection, WriteTransaction, SCHEDULE_SET};
use crate::telemetry;

/// A requested transition and the preconditions it depends on.
#[derive(Clone, Debug)]
pub struct ChangeStateRequest {
    pub job_id: JobId,
    pub new_state: JobState,
    /// `None` accepts any current state.
    pub expected_states: Option<Vec<String>>,
    /// Current state must be Processing and owned by this pair.
    pub expected_owner: Option<(ServerId, ExecutionId)>,
    pub disable_filters: bool,
}

impl ChangeStateRequest {
    pub fn new(job_id: JobId, new_state: JobState) -> Self {
        Self {
            job_id,
            new_state,
            expected_states: None,
            expected_owner: None,
            disable_filters: false,
        }
    }

    pub fn expecting(mut self, states: &[&str]) -> Self {
        self.expected_states = Some(states.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn owned_by(mut self, server_id: ServerId, worker_id: ExecutionId) -> Self {
        self.expected_owner = Some((server_id, worker_id));
        self
    }

    pub fn without_filters(mut self) -> Self {
        self.disable_filters = true;
        self
    }
}

/// Applies [`ChangeStateRequest`]s under the per-job state lock.
#[derive(Clone)]
pub struct StateChanger {
    filters: Vec<Arc<dyn ElectStateFilter>>,
    lock_timeout: Duration,
    job_expiration: Duration,
}

impl Default for StateChanger {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StateChanger {
    pub fn new(filters: Vec<Arc<dyn ElectStateFilter>>) -> Self {
        Self {
            filters,
            lock_timeout: Duration::from_secs(15),
            job_expiration: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_job_expiration(mut self, expiration: Duration) -> Self {
        self.job_expiration = expiration;
        self
    }

    pub fn state_lock_resource(job_id: &JobId) -> String {
        format!("job:{job_id}:state-lock")
    }

    /// Returns the name of the applied state, or `None` when the job is
    /// missing or not in an expected state.
    pub async fn change_state(
        &self,
        connection: &dyn StorageConnection,
        request: ChangeStateRequest,
    ) -> Result<Option<String>> {
        let span = telemetry::state_change_span(&request.job_id, request.new_state.name());
        async {
            let _lock = connection
                .acquire_lock(&Self::state_lock_resource(&request.job_id), self.lock_timeout)
                .await?;
            let mut transaction = connection.create_write_transaction();
            let applied = self.stage(connection, transaction.as_mut(), request).await?;
            if applied.is_some() {
                transaction.commit().await?;
            }
            Ok::<_, Error>(applied)
        }
        .instrument(span)
        .await
    }

    /// Validates the request and writes the transition into `transaction`
    /// without committing it. The caller holds the job's state lock.
    pub async fn stage(
        &self,
        connection: &dyn StorageConnection,
        transaction: &mut dyn WriteTransaction,
        request: ChangeStateRequest,
    ) -> Result<Option<String>> {
        let ChangeStateRequest {
            job_id,
            new_state,
            expected_states,
            expected_owner,
            disable_filters,
        } = request;

        let Some(job) = connection.get_job_data(&job_id).await? else {
            tracing::debug!(%job_id, "state change skipped, job does not exist");
            return Ok(None);
        };
        let current = connection.get_state_data(&job_id).await?;

        if let Some(expected) = &expected_states {
            let matches = current
                .as_ref()
                .is_some_and(|state| expected.iter().any(|name| state.is(name)));
            if !matches {
                tracing::debug!(
                    %job_id,
                    current = current.as_ref().map(|s| s.name.as_str()).unwrap_or("<none>"),
                    "state change rejected, job is not in an expected state"
                );
                return Ok(None);
            }
        }

        if let Some((server_id, worker_id)) = &expected_owner {
            let owned = current
                .as_ref()
                .is_some_and(|state| state.is_owned_by(server_id, worker_id));
            if !owned {
                tracing::debug!(%job_id, "state change rejected, processing claim was superseded");
                return Ok(None);
            }
        }

        let candidate = if disable_filters {
            new_state
        } else {
            self.elect(&job_id, &job, current.as_ref(), new_state, connection)
                .await?
        };

        if let Some(previous) = &current {
            unapply(&job_id, previous, transaction);
        }
        apply(&job_id, &candidate, transaction);
        transaction.set_job_state(&job_id, candidate.to_record());
        if candidate.is_final() {
            transaction.expire_job(&job_id, self.job_expiration);
        } else {
            transaction.persist_job(&job_id);
        }

        tracing::debug!(%job_id, state = candidate.name(), "state change staged");
        Ok(Some(candidate.name().to_string()))
    }

    async fn elect(
        &self,
        job_id: &JobId,
        job: &crate::job::JobData,
        current: Option<&StateData>,
        candidate: JobState,
        connection: &dyn StorageConnection,
    ) -> Result<JobState> {
        let mut ctx = ElectStateContext {
            job_id,
            job,
            current_state: current,
            candidate,
            connection,
        };
        for filter in &self.filters {
            match filter.on_state_election(&mut ctx).await {
                Ok(()) => {}
                Err(error) if error.is_cancellation() => return Err(error),
                Err(error) => {
                    let error = Error::Filter {
                        filter: filter.name().to_string(),
                        source: anyhow::Error::new(error),
                    };
                    tracing::warn!(%job_id, error = %error, "state election failed, moving job to Failed");
                    return Ok(JobState::failed(&error, None)
                        .with_reason("An exception occurred during the transition of job's state"));
                }
            }
        }
        Ok(ctx.candidate)
    }
}

fn apply(job_id: &JobId, state: &JobState, transaction: &mut dyn WriteTransaction) {
    match &state.kind {
        StateKind::Enqueued { queue } => transaction.add_to_queue(queue, job_id),
        StateKind::Scheduled { enqueue_at } => {
            transaction.add_to_set(SCHEDULE_SET, job_id.as_str(), score_of(*enqueue_at))
        }
        _ => {}
    }
}

fn unapply(job_id: &JobId, previous: &StateData, transaction: &mut dyn WriteTransaction) {
    if previous.is(SCHEDULED) {
        transaction.remove_from_set(SCHEDULE_SET, job_id.as_str());
    }
}
