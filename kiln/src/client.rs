//! Creating and changing background jobs from the host.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::validate_queue_name;
use crate::delayed::QUEUE_PARAMETER;
use crate::error::Result;
use crate::job::{InvocationData, JobId};
use crate::state::{JobState, StateKind, DEFAULT_QUEUE};
use crate::state_changer::{ChangeStateRequest, StateChanger};
use crate::storage::JobStorage;

/// Writes jobs into storage and moves them between states.
///
/// Every change goes through the [`StateChanger`], so the elect-state
/// filters run and a Processing job changed here is noticed by the
/// cancellation watcher of the server performing it.
#[derive(Clone)]
pub struct BackgroundJobClient {
    storage: Arc<dyn JobStorage>,
    state_changer: StateChanger,
    creation_expiration: Duration,
}

impl BackgroundJobClient {
    pub fn new(storage: Arc<dyn JobStorage>, state_changer: StateChanger) -> Self {
        Self {
            storage,
            state_changer,
            creation_expiration: Duration::from_secs(60 * 60),
        }
    }

    /// How long a job record survives if moving it into its first state fails.
    pub fn with_creation_expiration(mut self, expiration: Duration) -> Self {
        self.creation_expiration = expiration;
        self
    }

    /// Stores a new job and moves it into `state`.
    ///
    /// Jobs created Enqueued or Scheduled remember their queue, so a retry or
    /// a delayed enqueue lands in the same one.
    pub async fn create(&self, invocation: InvocationData, state: JobState) -> Result<JobId> {
        self.create_in(invocation, state, None).await
    }

    pub async fn enqueue(&self, invocation: InvocationData, queue: &str) -> Result<JobId> {
        self.create(invocation, JobState::enqueued(queue)).await
    }

    pub async fn schedule(
        &self,
        invocation: InvocationData,
        queue: &str,
        delay: Duration,
    ) -> Result<JobId> {
        self.create_in(invocation, JobState::scheduled_in(delay), Some(queue))
            .await
    }

    pub async fn schedule_at(
        &self,
        invocation: InvocationData,
        queue: &str,
        enqueue_at: DateTime<Utc>,
    ) -> Result<JobId> {
        self.create_in(invocation, JobState::scheduled(enqueue_at), Some(queue))
            .await
    }

    /// Moves the job back into its queue, whatever state it is in now.
    /// Returns `false` when the job does not exist.
    pub async fn requeue(&self, job_id: &JobId) -> Result<bool> {
        let connection = self.storage.connection().await?;
        let queue = connection
            .get_job_parameter(job_id, QUEUE_PARAMETER)
            .await?
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let applied = self
            .state_changer
            .change_state(
                connection.as_ref(),
                ChangeStateRequest::new(job_id.clone(), JobState::enqueued(queue).with_reason("Requeued")),
            )
            .await?;
        Ok(applied.is_some())
    }

    /// Moves the job to Deleted. Returns `false` when the job does not exist.
    pub async fn delete(&self, job_id: &JobId) -> Result<bool> {
        let connection = self.storage.connection().await?;
        let applied = self
            .state_changer
            .change_state(
                connection.as_ref(),
                ChangeStateRequest::new(job_id.clone(), JobState::deleted()),
            )
            .await?;
        Ok(applied.is_some())
    }

    async fn create_in(
        &self,
        invocation: InvocationData,
        state: JobState,
        queue: Option<&str>,
    ) -> Result<JobId> {
        let queue = match (&state.kind, queue) {
            (StateKind::Enqueued { queue }, _) => Some(queue.as_str()),
            (_, queue) => queue,
        };
        let mut parameters = BTreeMap::new();
        if let Some(queue) = queue {
            validate_queue_name(queue)?;
            parameters.insert(QUEUE_PARAMETER.to_string(), queue.to_string());
        }

        let connection = self.storage.connection().await?;
        let job_id = connection
            .create_job(&invocation, parameters, Utc::now(), self.creation_expiration)
            .await?;
        let applied = self
            .state_changer
            .change_state(
                connection.as_ref(),
                ChangeStateRequest::new(job_id.clone(), state),
            )
            .await?;
        tracing::debug!(
            %job_id,
            job = %invocation,
            state = applied.as_deref().unwrap_or("<none>"),
            "job created"
        );
        Ok(job_id)
    }
}
