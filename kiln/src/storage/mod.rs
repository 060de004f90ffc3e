//! Storage collaborator seams.
//!
//! kiln never talks to a database directly. A backend implements
//! [`JobStorage`] and hands out [`StorageConnection`]s; everything the engine
//! needs (queues, locks, state records, sorted sets, server records) goes
//! through them. [`memory::InMemoryStorage`] is the bundled reference backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::identity::ServerId;
use crate::job::{InvocationData, JobData, JobId};
use crate::recurring::RecurringJobEntity;
use crate::runtime::process::BackgroundProcess;
use crate::state::StateData;

pub mod memory;

/// Sorted set of scheduled job ids, scored by due time.
pub const SCHEDULE_SET: &str = "schedule";
/// Sorted set of recurring job ids, scored by next execution.
pub const RECURRING_JOBS_SET: &str = "recurring-jobs";

/// Optional features a backend may support.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageCapabilities {
    /// Parallel readers on separate connections are cheap.
    pub batched_reads: bool,
    /// State moves and set membership can be committed as one transaction.
    pub transactional_state_moves: bool,
}

#[async_trait]
pub trait JobStorage: Send + Sync {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>>;

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    /// Background processes the backend needs running next to the server.
    fn processes(&self) -> Vec<Arc<dyn BackgroundProcess>> {
        Vec::new()
    }
}

/// What a server declares about itself when announcing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerContext {
    pub queues: Vec<String>,
    pub worker_count: usize,
}

#[derive(Clone, Debug)]
pub struct ServerRecord {
    pub id: ServerId,
    pub context: ServerContext,
    pub started_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// Exclusive lock, reentrant within this connection.
    ///
    /// Fails with [`Error::LockTimeout`](crate::Error::LockTimeout) when the
    /// lock could not be taken in time.
    async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<DistributedLock>;

    /// Blocks until a job is available on one of `queues` or `cancel` fires.
    async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>>;

    /// Stores a job with no state that expires after `expire_in` unless a
    /// state change persists it.
    async fn create_job(
        &self,
        invocation: &InvocationData,
        parameters: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId>;

    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>>;

    async fn get_state_data(&self, job_id: &JobId) -> Result<Option<StateData>>;

    async fn get_job_parameter(&self, job_id: &JobId, name: &str) -> Result<Option<String>>;

    async fn set_job_parameter(&self, job_id: &JobId, name: &str, value: &str) -> Result<()>;

    fn create_write_transaction(&self) -> Box<dyn WriteTransaction>;

    /// Members of sorted set `key` with `from <= score <= to`, lowest first.
    async fn get_first_by_lowest_score(
        &self,
        key: &str,
        from: f64,
        to: f64,
        count: usize,
    ) -> Result<Vec<String>>;

    async fn get_recurring_job(&self, id: &str) -> Result<Option<RecurringJobEntity>>;

    async fn announce_server(&self, server_id: &ServerId, context: &ServerContext) -> Result<()>;

    /// Fails with [`Error::ServerGone`](crate::Error::ServerGone) when the
    /// server record no longer exists.
    async fn heartbeat(&self, server_id: &ServerId) -> Result<()>;

    async fn remove_server(&self, server_id: &ServerId) -> Result<()>;

    /// Deletes servers whose last heartbeat is older than `timeout`.
    async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize>;
}

/// Exclusive ownership of one queue entry.
///
/// Exactly one of [`acknowledge`](Self::acknowledge) or
/// [`requeue`](Self::requeue) should be called. Backends requeue on drop if
/// neither was.
#[async_trait]
pub trait FetchedJob: Send + Sync {
    fn job_id(&self) -> &JobId;

    fn queue(&self) -> &str;

    /// Removes the entry from its queue.
    async fn acknowledge(&mut self) -> Result<()>;

    /// Makes the entry visible to other fetchers again.
    async fn requeue(&mut self) -> Result<()>;
}

/// Buffered writes applied atomically on [`commit`](Self::commit).
#[async_trait]
pub trait WriteTransaction: Send {
    /// Replaces the current state and appends it to the job's history.
    fn set_job_state(&mut self, job_id: &JobId, state: StateData);

    /// Appends to history without changing the current state.
    fn add_job_state(&mut self, job_id: &JobId, state: StateData);

    fn add_to_queue(&mut self, queue: &str, job_id: &JobId);

    fn add_to_set(&mut self, key: &str, value: &str, score: f64);

    fn remove_from_set(&mut self, key: &str, value: &str);

    fn set_job_parameter(&mut self, job_id: &JobId, name: &str, value: &str);

    fn expire_job(&mut self, job_id: &JobId, expire_in: Duration);

    fn persist_job(&mut self, job_id: &JobId);

    fn set_recurring_job(&mut self, entity: RecurringJobEntity);

    fn remove_recurring_job(&mut self, id: &str);

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Held distributed lock. Released on drop.
pub struct DistributedLock {
    resource: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl DistributedLock {
    pub fn new(resource: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            resource: resource.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Sorted-set score for a point in time.
pub fn score_of(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}
