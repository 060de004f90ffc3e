//! Lease-cancellation tokens for jobs being performed.
//!
//! Every job a worker performs gets a [`JobCancellationToken`] tied to the
//! (job, server, execution id) triple of its Processing claim. Tokens are
//! registered per server in a [`LeaseTokenRegistry`] so the cancellation
//! watcher can check all of them against storage in one pass. A token found
//! stale is aborted, which the job observes at its next cooperative check.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cancellation::CancelLevel;
use crate::error::{Error, Result};
use crate::identity::{ExecutionId, ServerId};
use crate::job::JobId;
use crate::storage::StorageConnection;

#[derive(Default)]
struct EntryState {
    aborted: bool,
    disposed: bool,
}

struct LeaseEntry {
    id: u64,
    job_id: JobId,
    server_id: ServerId,
    worker_id: ExecutionId,
    /// Child of the server token; also cancelled on abort.
    token: CancellationToken,
    level: CancelLevel,
    state: Mutex<EntryState>,
}

impl LeaseEntry {
    fn abort(&self) -> bool {
        let mut state = self.state.lock();
        if state.disposed || state.aborted {
            return false;
        }
        state.aborted = true;
        self.token.cancel();
        true
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    fn is_live(&self) -> bool {
        !self.state.lock().disposed
    }

    /// Consults storage and aborts the entry when its claim is gone.
    async fn check(&self, connection: &dyn StorageConnection) -> Result<bool> {
        if !self.is_live() {
            return Ok(false);
        }
        let state = connection.get_state_data(&self.job_id).await?;
        let owned = state
            .as_ref()
            .is_some_and(|s| s.is_owned_by(&self.server_id, &self.worker_id));
        if owned {
            return Ok(false);
        }
        if self.abort() {
            tracing::info!(
                job_id = %self.job_id,
                state = state.as_ref().map(|s| s.name.as_str()).unwrap_or("<none>"),
                "job state changed externally, aborting"
            );
        }
        Ok(true)
    }
}

/// Per-server registry of live lease tokens.
///
/// The server registers itself when a generation starts and unregisters on
/// teardown; tokens of an unregistered server are still honoured but no
/// longer checked.
#[derive(Clone, Default)]
pub struct LeaseTokenRegistry {
    servers: Arc<DashMap<ServerId, HashMap<u64, Arc<LeaseEntry>>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for LeaseTokenRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseTokenRegistry")
            .field("servers", &self.servers.len())
            .finish()
    }
}

impl LeaseTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_server(&self, server_id: &ServerId) {
        self.servers.entry(server_id.clone()).or_default();
    }

    pub fn unregister_server(&self, server_id: &ServerId) {
        self.servers.remove(server_id);
    }

    /// Live tokens registered for `server_id`.
    pub fn count(&self, server_id: &ServerId) -> usize {
        self.servers.get(server_id).map_or(0, |tokens| tokens.len())
    }

    fn insert(&self, entry: Arc<LeaseEntry>) {
        self.servers
            .entry(entry.server_id.clone())
            .or_default()
            .insert(entry.id, entry);
    }

    fn remove(&self, server_id: &ServerId, id: u64) {
        if let Some(mut tokens) = self.servers.get_mut(server_id) {
            tokens.remove(&id);
        }
    }

    fn snapshot(&self, server_id: &ServerId) -> Vec<Arc<LeaseEntry>> {
        self.servers
            .get(server_id)
            .map(|tokens| tokens.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Checks every live token of `server_id` against storage.
    ///
    /// Returns how many tokens were aborted in this pass.
    pub async fn check_all(
        &self,
        server_id: &ServerId,
        connection: &dyn StorageConnection,
    ) -> Result<usize> {
        let mut aborted = 0;
        for entry in self.snapshot(server_id) {
            if entry.check(connection).await? {
                aborted += 1;
            }
        }
        Ok(aborted)
    }
}

/// Cancellation handed to a job while it is performed.
///
/// Fires when the server's token at `level` fires or when the claim is
/// found stale. Dropping the token removes it from the registry.
pub struct JobCancellationToken {
    entry: Arc<LeaseEntry>,
    registry: LeaseTokenRegistry,
}

impl std::fmt::Debug for JobCancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCancellationToken")
            .field("job_id", &self.entry.job_id)
            .field("server_id", &self.entry.server_id)
            .field("worker_id", &self.entry.worker_id)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl JobCancellationToken {
    pub fn new(
        job_id: JobId,
        server_id: ServerId,
        worker_id: ExecutionId,
        server_token: &CancellationToken,
        level: CancelLevel,
        registry: &LeaseTokenRegistry,
    ) -> Self {
        let entry = Arc::new(LeaseEntry {
            id: registry.next_id.fetch_add(1, Ordering::Relaxed),
            job_id,
            server_id,
            worker_id,
            token: server_token.child_token(),
            level,
            state: Mutex::new(EntryState::default()),
        });
        registry.insert(Arc::clone(&entry));
        Self {
            entry,
            registry: registry.clone(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.entry.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.entry.token
    }

    pub fn is_aborted(&self) -> bool {
        self.entry.is_aborted()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.entry.token.is_cancelled()
    }

    /// `Err(JobAborted)` after an abort, `Err(Cancelled)` after the server
    /// token fired.
    pub fn throw_if_cancellation_requested(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::JobAborted(self.entry.job_id.clone()));
        }
        if self.entry.token.is_cancelled() {
            return Err(Error::Cancelled(self.entry.level));
        }
        Ok(())
    }

    /// Resolves once cancellation is requested for any reason.
    pub async fn cancelled(&self) {
        self.entry.token.cancelled().await
    }

    pub fn abort(&self) -> bool {
        self.entry.abort()
    }

    /// Re-checks the claim against storage right now.
    pub async fn check(&self, connection: &dyn StorageConnection) -> Result<bool> {
        self.entry.check(connection).await
    }
}

impl Drop for JobCancellationToken {
    fn drop(&mut self) {
        self.entry.state.lock().disposed = true;
        self.registry.remove(&self.entry.server_id, self.entry.id);
    }
}
