//! In-process storage backend.
//!
//! Holds everything behind a single `parking_lot` mutex. Queue waiters are
//! woken through a [`Notify`] when something is enqueued or requeued, and
//! fall back to polling so entries whose invisibility timeout elapsed are
//! picked up as well.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    DistributedLock, FetchedJob, JobStorage, ServerContext, ServerRecord, StorageCapabilities,
    StorageConnection, WriteTransaction, RECURRING_JOBS_SET,
};
use crate::cancellation::{sleep_or_cancel, CancelLevel};
use crate::error::{Error, Result};
use crate::identity::ServerId;
use crate::job::{InvocationData, JobData, JobId};
use crate::recurring::RecurringJobEntity;
use crate::runtime::process::{BackgroundProcess, ProcessContext};
use crate::state::StateData;

#[derive(Clone, Debug)]
pub struct InMemoryOptions {
    /// How long a fetched, unacknowledged entry stays invisible.
    pub invisibility_timeout: Duration,
    pub queue_poll_interval: Duration,
    pub expiration_check_interval: Duration,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            invisibility_timeout: Duration::from_secs(30 * 60),
            queue_poll_interval: Duration::from_secs(1),
            expiration_check_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl InMemoryOptions {
    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_expiration_check_interval(mut self, interval: Duration) -> Self {
        self.expiration_check_interval = interval;
        self
    }
}

#[derive(Clone, Debug)]
struct JobRecord {
    invocation: InvocationData,
    created_at: DateTime<Utc>,
    state: Option<StateData>,
    history: Vec<StateData>,
    parameters: BTreeMap<String, String>,
    expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct QueueEntry {
    id: u64,
    job_id: JobId,
    fetched_at: Option<Instant>,
}

#[derive(Default)]
struct Data {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, VecDeque<QueueEntry>>,
    sets: HashMap<String, HashMap<String, f64>>,
    recurring: HashMap<String, RecurringJobEntity>,
    servers: HashMap<ServerId, ServerRecord>,
    next_entry: u64,
}

impl Data {
    fn push_to_queue(&mut self, queue: &str, job_id: &JobId) {
        self.next_entry += 1;
        let entry = QueueEntry {
            id: self.next_entry,
            job_id: job_id.clone(),
            fetched_at: None,
        };
        self.queues.entry(queue.to_string()).or_default().push_back(entry);
    }
}

struct LockHolder {
    owner: u64,
    depth: usize,
}

struct Inner {
    data: Mutex<Data>,
    locks: Mutex<HashMap<String, LockHolder>>,
    queue_signal: Notify,
    lock_signal: Notify,
    next_connection: AtomicU64,
    options: InMemoryOptions,
}

impl Inner {
    fn try_fetch(self: &Arc<Self>, queues: &[String]) -> Option<MemoryFetchedJob> {
        let invisibility = self.options.invisibility_timeout;
        let mut data = self.data.lock();
        for queue in queues {
            let Some(entries) = data.queues.get_mut(queue) else {
                continue;
            };
            let now = Instant::now();
            let available = entries.iter_mut().find(|entry| match entry.fetched_at {
                None => true,
                Some(at) => now.duration_since(at) >= invisibility,
            });
            if let Some(entry) = available {
                entry.fetched_at = Some(now);
                return Some(MemoryFetchedJob {
                    inner: Arc::clone(self),
                    entry_id: entry.id,
                    job_id: entry.job_id.clone(),
                    queue: queue.clone(),
                    settled: false,
                });
            }
        }
        None
    }

    fn remove_entry(&self, queue: &str, entry_id: u64) {
        let mut data = self.data.lock();
        if let Some(entries) = data.queues.get_mut(queue) {
            entries.retain(|entry| entry.id != entry_id);
        }
    }

    fn release_entry(&self, queue: &str, entry_id: u64) {
        {
            let mut data = self.data.lock();
            if let Some(entry) = data
                .queues
                .get_mut(queue)
                .and_then(|entries| entries.iter_mut().find(|entry| entry.id == entry_id))
            {
                entry.fetched_at = None;
            }
        }
        self.queue_signal.notify_waiters();
    }

    fn try_lock(&self, resource: &str, owner: u64) -> bool {
        let mut locks = self.locks.lock();
        match locks.get_mut(resource) {
            Some(holder) if holder.owner == owner => {
                holder.depth += 1;
                true
            }
            Some(_) => false,
            None => {
                locks.insert(resource.to_string(), LockHolder { owner, depth: 1 });
                true
            }
        }
    }

    fn release_lock(&self, resource: &str, owner: u64) {
        {
            let mut locks = self.locks.lock();
            let release = match locks.get_mut(resource) {
                Some(holder) if holder.owner == owner => {
                    holder.depth -= 1;
                    holder.depth == 0
                }
                _ => false,
            };
            if release {
                locks.remove(resource);
            }
        }
        self.lock_signal.notify_waiters();
    }

    /// Drops expired jobs together with their queue entries and the job
    /// sets they are members of.
    fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let mut data = self.data.lock();
        let expired: HashSet<JobId> = data
            .jobs
            .iter()
            .filter(|(_, job)| job.expire_at.is_some_and(|expire_at| expire_at <= now))
            .map(|(job_id, _)| job_id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        data.jobs.retain(|job_id, _| !expired.contains(job_id));
        for entries in data.queues.values_mut() {
            entries.retain(|entry| !expired.contains(&entry.job_id));
        }
        let expired_members: HashSet<&str> = expired.iter().map(JobId::as_str).collect();
        for (key, members) in data.sets.iter_mut() {
            if key != RECURRING_JOBS_SET {
                members.retain(|member, _| !expired_members.contains(member.as_str()));
            }
        }
        expired.len()
    }
}

/// Reference [`JobStorage`] kept entirely in process memory.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(InMemoryOptions::default())
    }
}

impl InMemoryStorage {
    pub fn new(options: InMemoryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data::default()),
                locks: Mutex::new(HashMap::new()),
                queue_signal: Notify::new(),
                lock_signal: Notify::new(),
                next_connection: AtomicU64::new(1),
                options,
            }),
        }
    }

    /// A concrete connection, for callers that want to skip the trait object.
    pub fn open(&self) -> MemoryConnection {
        MemoryConnection {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Entries in `queue`, fetched or not.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .data
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn job_state(&self, job_id: &JobId) -> Option<StateData> {
        self.inner
            .data
            .lock()
            .jobs
            .get(job_id)
            .and_then(|job| job.state.clone())
    }

    pub fn state_history(&self, job_id: &JobId) -> Vec<StateData> {
        self.inner
            .data
            .lock()
            .jobs
            .get(job_id)
            .map(|job| job.history.clone())
            .unwrap_or_default()
    }

    pub fn job_exists(&self, job_id: &JobId) -> bool {
        self.inner.data.lock().jobs.contains_key(job_id)
    }

    pub fn job_count(&self) -> usize {
        self.inner.data.lock().jobs.len()
    }

    pub fn set_score(&self, key: &str, value: &str) -> Option<f64> {
        self.inner
            .data
            .lock()
            .sets
            .get(key)
            .and_then(|set| set.get(value).copied())
    }

    pub fn set_len(&self, key: &str) -> usize {
        self.inner.data.lock().sets.get(key).map_or(0, HashMap::len)
    }

    pub fn recurring_job(&self, id: &str) -> Option<RecurringJobEntity> {
        self.inner.data.lock().recurring.get(id).cloned()
    }

    pub fn servers(&self) -> Vec<ServerRecord> {
        self.inner.data.lock().servers.values().cloned().collect()
    }

    pub fn has_server(&self, server_id: &ServerId) -> bool {
        self.inner.data.lock().servers.contains_key(server_id)
    }

    /// Pretends a server last heartbeated at `at`.
    pub fn set_server_heartbeat(&self, server_id: &ServerId, at: DateTime<Utc>) {
        if let Some(server) = self.inner.data.lock().servers.get_mut(server_id) {
            server.heartbeat = at;
        }
    }

    /// Deletes a server record behind its owner's back.
    pub fn evict_server(&self, server_id: &ServerId) {
        self.inner.data.lock().servers.remove(server_id);
    }

    /// Deletes a job record behind its owner's back.
    pub fn purge_job(&self, job_id: &JobId) {
        self.inner.data.lock().jobs.remove(job_id);
    }

    /// Removes jobs whose expiration passed. Returns how many were removed.
    pub fn remove_expired_jobs(&self) -> usize {
        self.inner.remove_expired(Utc::now())
    }
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>> {
        Ok(Box::new(self.open()))
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities {
            batched_reads: true,
            transactional_state_moves: true,
        }
    }

    fn processes(&self) -> Vec<Arc<dyn BackgroundProcess>> {
        vec![Arc::new(ExpirationManager {
            storage: self.clone(),
            interval: self.inner.options.expiration_check_interval,
        })]
    }
}

pub struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<DistributedLock> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.lock_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.try_lock(resource, self.id) {
                let inner = Arc::clone(&self.inner);
                let owned = resource.to_string();
                let owner = self.id;
                return Ok(DistributedLock::new(resource, move || {
                    inner.release_lock(&owned, owner)
                }));
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    resource: resource.to_string(),
                });
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn fetch_next_job(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Result<Box<dyn FetchedJob>> {
        loop {
            let notified = self.inner.queue_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(fetched) = self.inner.try_fetch(queues) {
                tracing::trace!(job_id = %fetched.job_id, queue = %fetched.queue, "fetched job");
                return Ok(Box::new(fetched));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled(CancelLevel::Stopping)),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.inner.options.queue_poll_interval) => {}
            }
        }
    }

    async fn create_job(
        &self,
        invocation: &InvocationData,
        parameters: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<JobId> {
        let job_id = JobId::generate();
        let expire_in = chrono::Duration::from_std(expire_in).unwrap_or(chrono::Duration::MAX);
        let record = JobRecord {
            invocation: invocation.clone(),
            created_at,
            state: None,
            history: Vec::new(),
            parameters,
            expire_at: created_at.checked_add_signed(expire_in),
        };
        self.inner.data.lock().jobs.insert(job_id.clone(), record);
        Ok(job_id)
    }

    async fn get_job_data(&self, job_id: &JobId) -> Result<Option<JobData>> {
        Ok(self.inner.data.lock().jobs.get(job_id).map(|job| JobData {
            invocation: job.invocation.clone(),
            state_name: job.state.as_ref().map(|s| s.name.clone()),
            created_at: job.created_at,
            parameters: job.parameters.clone(),
        }))
    }

    async fn get_state_data(&self, job_id: &JobId) -> Result<Option<StateData>> {
        Ok(self
            .inner
            .data
            .lock()
            .jobs
            .get(job_id)
            .and_then(|job| job.state.clone()))
    }

    async fn get_job_parameter(&self, job_id: &JobId, name: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .data
            .lock()
            .jobs
            .get(job_id)
            .and_then(|job| job.parameters.get(name).cloned()))
    }

    async fn set_job_parameter(&self, job_id: &JobId, name: &str, value: &str) -> Result<()> {
        if let Some(job) = self.inner.data.lock().jobs.get_mut(job_id) {
            job.parameters.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    fn create_write_transaction(&self) -> Box<dyn WriteTransaction> {
        Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            commands: Vec::new(),
        })
    }

    async fn get_first_by_lowest_score(
        &self,
        key: &str,
        from: f64,
        to: f64,
        count: usize,
    ) -> Result<Vec<String>> {
        let data = self.inner.data.lock();
        let Some(set) = data.sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = set
            .iter()
            .filter(|(_, score)| **score >= from && **score <= to)
            .map(|(value, score)| (value, *score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members
            .into_iter()
            .take(count)
            .map(|(value, _)| value.clone())
            .collect())
    }

    async fn get_recurring_job(&self, id: &str) -> Result<Option<RecurringJobEntity>> {
        Ok(self.inner.data.lock().recurring.get(id).cloned())
    }

    async fn announce_server(&self, server_id: &ServerId, context: &ServerContext) -> Result<()> {
        let now = Utc::now();
        let record = ServerRecord {
            id: server_id.clone(),
            context: context.clone(),
            started_at: now,
            heartbeat: now,
        };
        self.inner
            .data
            .lock()
            .servers
            .insert(server_id.clone(), record);
        Ok(())
    }

    async fn heartbeat(&self, server_id: &ServerId) -> Result<()> {
        match self.inner.data.lock().servers.get_mut(server_id) {
            Some(server) => {
                server.heartbeat = Utc::now();
                Ok(())
            }
            None => Err(Error::ServerGone(server_id.clone())),
        }
    }

    async fn remove_server(&self, server_id: &ServerId) -> Result<()> {
        self.inner.data.lock().servers.remove(server_id);
        Ok(())
    }

    async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<usize> {
        let timeout = chrono::Duration::from_std(timeout).map_err(|e| Error::Config(e.to_string()))?;
        let cutoff = Utc::now() - timeout;
        let mut data = self.inner.data.lock();
        let before = data.servers.len();
        data.servers.retain(|_, server| server.heartbeat >= cutoff);
        Ok(before - data.servers.len())
    }
}

pub struct MemoryFetchedJob {
    inner: Arc<Inner>,
    entry_id: u64,
    job_id: JobId,
    queue: String,
    settled: bool,
}

#[async_trait]
impl FetchedJob for MemoryFetchedJob {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn acknowledge(&mut self) -> Result<()> {
        self.inner.remove_entry(&self.queue, self.entry_id);
        self.settled = true;
        Ok(())
    }

    async fn requeue(&mut self) -> Result<()> {
        self.inner.release_entry(&self.queue, self.entry_id);
        self.settled = true;
        Ok(())
    }
}

impl Drop for MemoryFetchedJob {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.release_entry(&self.queue, self.entry_id);
        }
    }
}

enum Command {
    SetState(JobId, StateData),
    AddState(JobId, StateData),
    AddToQueue(String, JobId),
    AddToSet(String, String, f64),
    RemoveFromSet(String, String),
    SetParameter(JobId, String, String),
    Expire(JobId, Duration),
    Persist(JobId),
    SetRecurring(RecurringJobEntity),
    RemoveRecurring(String),
}

pub struct MemoryTransaction {
    inner: Arc<Inner>,
    commands: Vec<Command>,
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    fn set_job_state(&mut self, job_id: &JobId, state: StateData) {
        self.commands.push(Command::SetState(job_id.clone(), state));
    }

    fn add_job_state(&mut self, job_id: &JobId, state: StateData) {
        self.commands.push(Command::AddState(job_id.clone(), state));
    }

    fn add_to_queue(&mut self, queue: &str, job_id: &JobId) {
        self.commands
            .push(Command::AddToQueue(queue.to_string(), job_id.clone()));
    }

    fn add_to_set(&mut self, key: &str, value: &str, score: f64) {
        self.commands
            .push(Command::AddToSet(key.to_string(), value.to_string(), score));
    }

    fn remove_from_set(&mut self, key: &str, value: &str) {
        self.commands
            .push(Command::RemoveFromSet(key.to_string(), value.to_string()));
    }

    fn set_job_parameter(&mut self, job_id: &JobId, name: &str, value: &str) {
        self.commands.push(Command::SetParameter(
            job_id.clone(),
            name.to_string(),
            value.to_string(),
        ));
    }

    fn expire_job(&mut self, job_id: &JobId, expire_in: Duration) {
        self.commands.push(Command::Expire(job_id.clone(), expire_in));
    }

    fn persist_job(&mut self, job_id: &JobId) {
        self.commands.push(Command::Persist(job_id.clone()));
    }

    fn set_recurring_job(&mut self, entity: RecurringJobEntity) {
        self.commands.push(Command::SetRecurring(entity));
    }

    fn remove_recurring_job(&mut self, id: &str) {
        self.commands.push(Command::RemoveRecurring(id.to_string()));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { inner, commands } = *self;
        let mut enqueued = false;
        {
            let mut data = inner.data.lock();
            for command in commands {
                match command {
                    Command::SetState(job_id, state) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.history.push(state.clone());
                            job.state = Some(state);
                        }
                    }
                    Command::AddState(job_id, state) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.history.push(state);
                        }
                    }
                    Command::AddToQueue(queue, job_id) => {
                        data.push_to_queue(&queue, &job_id);
                        enqueued = true;
                    }
                    Command::AddToSet(key, value, score) => {
                        data.sets.entry(key).or_default().insert(value, score);
                    }
                    Command::RemoveFromSet(key, value) => {
                        if let Some(set) = data.sets.get_mut(&key) {
                            set.remove(&value);
                        }
                    }
                    Command::SetParameter(job_id, name, value) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.parameters.insert(name, value);
                        }
                    }
                    Command::Expire(job_id, expire_in) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            let expire_in = chrono::Duration::from_std(expire_in)
                                .unwrap_or(chrono::Duration::MAX);
                            job.expire_at = Utc::now().checked_add_signed(expire_in);
                        }
                    }
                    Command::Persist(job_id) => {
                        if let Some(job) = data.jobs.get_mut(&job_id) {
                            job.expire_at = None;
                        }
                    }
                    Command::SetRecurring(entity) => {
                        data.recurring.insert(entity.id.clone(), entity);
                    }
                    Command::RemoveRecurring(id) => {
                        data.recurring.remove(&id);
                    }
                }
            }
        }
        if enqueued {
            inner.queue_signal.notify_waiters();
        }
        Ok(())
    }
}

/// Deletes expired job records on an interval.
struct ExpirationManager {
    storage: InMemoryStorage,
    interval: Duration,
}

#[async_trait]
impl BackgroundProcess for ExpirationManager {
    fn name(&self) -> &str {
        "InMemoryExpirationManager"
    }

    async fn execute(&self, ctx: &ProcessContext) -> Result<()> {
        let removed = self.storage.remove_expired_jobs();
        if removed > 0 {
            tracing::debug!(removed, "removed expired jobs");
        }
        sleep_or_cancel(ctx.tokens.stopping(), self.interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobState;

    async fn enqueue(storage: &InMemoryStorage, queue: &str) -> JobId {
        let conn = storage.open();
        let job_id = conn
            .create_job(&InvocationData::new("T", "m"), BTreeMap::new(), Utc::now(), Duration::from_secs(3600))
            .await
            .unwrap();
        let mut tx = conn.create_write_transaction();
        tx.set_job_state(&job_id, JobState::enqueued(queue).to_record());
        tx.add_to_queue(queue, &job_id);
        tx.commit().await.unwrap();
        job_id
    }

    #[tokio::test]
    async fn fetch_is_fifo_and_respects_queue_order() {
        let storage = InMemoryStorage::default();
        let low = enqueue(&storage, "low").await;
        let first = enqueue(&storage, "critical").await;
        let second = enqueue(&storage, "critical").await;
        let conn = storage.open();
        let queues = vec!["critical".to_string(), "low".to_string()];
        let cancel = CancellationToken::new();

        let mut a = conn.fetch_next_job(&queues, &cancel).await.unwrap();
        let mut b = conn.fetch_next_job(&queues, &cancel).await.unwrap();
        let mut c = conn.fetch_next_job(&queues, &cancel).await.unwrap();
        assert_eq!(a.job_id(), &first);
        assert_eq!(b.job_id(), &second);
        assert_eq!(c.job_id(), &low);

        a.acknowledge().await.unwrap();
        b.acknowledge().await.unwrap();
        c.acknowledge().await.unwrap();
        assert_eq!(storage.queue_len("critical"), 0);
    }

    #[tokio::test]
    async fn dropped_fetch_is_requeued() {
        let storage = InMemoryStorage::default();
        let job_id = enqueue(&storage, "default").await;
        let conn = storage.open();
        let queues = vec!["default".to_string()];
        let cancel = CancellationToken::new();

        drop(conn.fetch_next_job(&queues, &cancel).await.unwrap());

        let mut again = tokio::time::timeout(
            Duration::from_secs(1),
            conn.fetch_next_job(&queues, &cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(again.job_id(), &job_id);
        again.acknowledge().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invisible_entry_returns_after_timeout() {
        let storage = InMemoryStorage::new(
            InMemoryOptions::default().with_invisibility_timeout(Duration::from_secs(60)),
        );
        let job_id = enqueue(&storage, "default").await;
        let conn = storage.open();
        let queues = vec!["default".to_string()];
        let cancel = CancellationToken::new();

        let fetched = conn.fetch_next_job(&queues, &cancel).await.unwrap();
        std::mem::forget(fetched);

        let again = conn.fetch_next_job(&queues, &cancel).await.unwrap();
        assert_eq!(again.job_id(), &job_id);
    }

    #[tokio::test]
    async fn fetch_returns_when_cancelled() {
        let storage = InMemoryStorage::default();
        let conn = storage.open();
        let cancel = CancellationToken::new();
        let queues = vec!["default".to_string()];
        let waiter = conn.fetch_next_job(&queues, &cancel);
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn locks_are_reentrant_per_connection_only() {
        let storage = InMemoryStorage::default();
        let a = storage.open();
        let b = storage.open();

        let outer = a.acquire_lock("res", Duration::from_millis(10)).await.unwrap();
        let inner = a.acquire_lock("res", Duration::from_millis(10)).await.unwrap();
        let err = b
            .acquire_lock("res", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        drop(inner);
        assert!(b.acquire_lock("res", Duration::from_millis(20)).await.is_err());
        drop(outer);
        assert!(b.acquire_lock("res", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn lowest_score_range_is_sorted_and_bounded() {
        let storage = InMemoryStorage::default();
        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.add_to_set("s", "late", 30.0);
        tx.add_to_set("s", "early", 10.0);
        tx.add_to_set("s", "middle", 20.0);
        tx.commit().await.unwrap();

        let due = conn.get_first_by_lowest_score("s", 0.0, 25.0, 10).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "middle".to_string()]);
        let one = conn.get_first_by_lowest_score("s", 0.0, 100.0, 1).await.unwrap();
        assert_eq!(one, vec!["early".to_string()]);
    }

    #[tokio::test]
    async fn heartbeat_for_missing_server_reports_gone() {
        let storage = InMemoryStorage::default();
        let conn = storage.open();
        let id = ServerId::generate("node");
        let context = ServerContext {
            queues: vec!["default".into()],
            worker_count: 1,
        };
        conn.announce_server(&id, &context).await.unwrap();
        conn.heartbeat(&id).await.unwrap();
        storage.evict_server(&id);
        assert!(matches!(conn.heartbeat(&id).await, Err(Error::ServerGone(_))));
    }

    #[tokio::test]
    async fn timed_out_servers_are_removed() {
        let storage = InMemoryStorage::default();
        let conn = storage.open();
        let context = ServerContext {
            queues: vec!["default".into()],
            worker_count: 1,
        };
        let stale = ServerId::generate("stale");
        let fresh = ServerId::generate("fresh");
        conn.announce_server(&stale, &context).await.unwrap();
        conn.announce_server(&fresh, &context).await.unwrap();
        storage.set_server_heartbeat(&stale, Utc::now() - chrono::Duration::minutes(10));

        let removed = conn
            .remove_timed_out_servers(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!storage.has_server(&stale));
        assert!(storage.has_server(&fresh));
    }

    #[tokio::test]
    async fn expired_jobs_are_removed() {
        let storage = InMemoryStorage::default();
        let job_id = enqueue(&storage, "default").await;
        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.expire_job(&job_id, Duration::ZERO);
        tx.commit().await.unwrap();

        assert_eq!(storage.remove_expired_jobs(), 1);
        assert!(!storage.job_exists(&job_id));
    }

    #[tokio::test]
    async fn expiry_sweep_drops_queue_and_set_entries() {
        let storage = InMemoryStorage::default();
        let job_id = enqueue(&storage, "default").await;
        let kept = enqueue(&storage, "default").await;
        let conn = storage.open();
        let mut tx = conn.create_write_transaction();
        tx.add_to_set(crate::storage::SCHEDULE_SET, job_id.as_str(), 0.0);
        tx.add_to_set(RECURRING_JOBS_SET, "report", 0.0);
        tx.expire_job(&job_id, Duration::ZERO);
        tx.commit().await.unwrap();

        assert_eq!(storage.remove_expired_jobs(), 1);
        assert_eq!(storage.queue_len("default"), 1);
        assert!(storage
            .set_score(crate::storage::SCHEDULE_SET, job_id.as_str())
            .is_none());
        assert!(storage.set_score(RECURRING_JOBS_SET, "report").is_some());
        assert!(storage.job_exists(&kept));
        assert_eq!(storage.remove_expired_jobs(), 0);
    }
}
