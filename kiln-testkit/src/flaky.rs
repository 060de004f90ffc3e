use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln::storage::memory::MemoryConnection;
use kiln::storage::ServerContext;
use kiln::{
    BackgroundProcess, DistributedLock, Error, FetchedJob, InMemoryStorage, InvocationData,
    JobData, JobId, JobStorage, RecurringJobEntity, Result, ServerId, StateData,
    StorageCapabilities, StorageConnection, WriteTransaction,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Faults {
    state_locks: AtomicUsize,
    heartbeats: AtomicUsize,
    heartbeats_always: AtomicBool,
    fetches: AtomicUsize,
    injected: AtomicUsize,
}

impl Faults {
    fn take(&self, counter: &AtomicUsize) -> bool {
        let taken = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        taken
    }

    fn fail(&self, what: &str) -> Error {
        tracing::debug!(what, "injecting storage failure");
        Error::storage(format!("injected {what} failure"))
    }
}

/// [`InMemoryStorage`] that fails a configured number of calls.
#[derive(Clone)]
pub struct FlakyStorage {
    inner: InMemoryStorage,
    faults: Arc<Faults>,
    capabilities: Option<StorageCapabilities>,
}

impl FlakyStorage {
    pub fn new(inner: InMemoryStorage) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
            capabilities: None,
        }
    }

    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }

    /// Reports different capabilities than the wrapped storage.
    pub fn with_capabilities(mut self, capabilities: StorageCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// The next `count` job state locks fail.
    pub fn fail_state_locks(&self, count: usize) {
        self.faults.state_locks.store(count, Ordering::SeqCst);
    }

    pub fn fail_heartbeats(&self, count: usize) {
        self.faults.heartbeats.store(count, Ordering::SeqCst);
    }

    /// Every heartbeat fails until switched off again.
    pub fn fail_heartbeats_always(&self, enabled: bool) {
        self.faults.heartbeats_always.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, count: usize) {
        self.faults.fetches.store(count, Ordering::SeqCst);
    }

    /// Failures injected so far.
    pub fn injected(&self) -> usize {
        self.faults.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStorage for FlakyStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>> {
        Ok(Box::new(FlakyConnection {
            inner: self.inner.open(),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn capabilities(&self) -> StorageCapabilities {
        self.capabilities
            .unwrap_or_else(|| self.inner.capabilities())
    }

    fn processes(&self) -> Vec<Arc<dyn BackgroundProcess>> {
        self.inner.processes()
    }
}

pub struct FlakyConnection {
    inner: MemoryConnection,
    faults: Arc<Faults>,
}

#[async_trait]
impl StorageConnection for FlakyConnection {
    async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<DistributedLock> {
        if resource.ends_with(":state-lock") && self.faults.take(&self.faults.state_locks) {
            return Err(self.faults.fail("state lock"));
        }
        self.inner.acquire_lock(resource, timeout).await
    }

    async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>> {
        if self.faults.take(&self.faults.fetches) {
            return Err(self.faults.fail("fetch"));
        }
        self.inner.fetch_next_job(queues, cancel).await
    }

    async fn create_job(
        &self,
        invocation: &InvocationData,
        parameters: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId> {
        self.inner
            .create_job(invocation, parameters, created_at, expire_in)
            .await
    }

    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>> {
        self.inner.get_job_data(job_id).await
    }

    async fn get_state_data(&self, job_id: &JobId) -> Result<Option<StateData>> {
        self.inner.get_state_data(job_id).await
    }

    async fn get_job_parameter(&self, job_id: &JobId, name: &str) -> Result<Option<String>> {
        self.inner.get_job_parameter(job_id, name).await
    }

    async fn set_job_parameter(&self, job_id: &JobId, name: &str, value: &str) -> Result<()> {
        self.inner.set_job_parameter(job_id, name, value).await
    }

    fn create_write_transaction(&self) -> Box<dyn WriteTransaction> {
        self.inner.create_write_transaction()
    }

    async fn get_first_by_lowest_score(
        &self,
        key: &str,
        from: f64,
        to: f64,
        count: usize,
    ) -> Result<Vec<String>> {
        self.inner.get_first_by_lowest_score(key, from, to, count).await
    }

    async fn get_recurring_job(&self, id: &str) -> Result<Option<RecurringJobEntity>> {
        self.inner.get_recurring_job(id).await
    }

    async fn announce_server(&self, server_id: &ServerId, context: &ServerContext) -> Result<()> {
        self.inner.announce_server(server_id, context).await
    }

    async fn heartbeat(&self, server_id: &ServerId) -> Result<()> {
        if self.faults.heartbeats_always.load(Ordering::SeqCst) {
            self.faults.injected.fetch_add(1, Ordering::SeqCst);
            return Err(self.faults.fail("heartbeat"));
        }
        if self.faults.take(&self.faults.heartbeats) {
            return Err(self.faults.fail("heartbeat"));
        }
        self.inner.heartbeat(server_id).await
    }

    async fn remove_server(&self, server_id: &ServerId) -> Result<()> {
        self.inner.remove_server(server_id).await
    }

    async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize> {
        self.inner.remove_timed_out_servers(timeout).await
    }
}
