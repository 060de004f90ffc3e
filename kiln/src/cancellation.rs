//! The three-level cancellation hierarchy.
//!
//! `Stopping` asks components to stop taking new work, `Stopped` asks in-flight
//! work to abandon as soon as possible, and `Shutdown` drops everything. A
//! level being cancelled always implies every milder level is cancelled too.
//!
//! A server generation runs on a [`ServerTokens::derive`]d set. Cancelling a
//! derived set never touches its parent, which is how a restart tears down one
//! generation while the host's tokens stay live.

use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum CancelLevel {
    Stopping,
    Stopped,
    Shutdown,
}

impl Display for CancelLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// One cancellation hierarchy.
///
/// Within a set the tokens form a chain (`Shutdown` → `Stopped` →
/// `Stopping`), so cancelling any level, even through the raw token, also
/// cancels every milder one. Derived sets are reached through
/// [`ServerTokens::cancel`], which walks them level by level.
#[derive(Clone, Debug)]
pub struct ServerTokens {
    set: Arc<TokenSet>,
}

#[derive(Debug)]
struct TokenSet {
    stopping: CancellationToken,
    stopped: CancellationToken,
    shutdown: CancellationToken,
    children: Mutex<Vec<Weak<TokenSet>>>,
}

impl TokenSet {
    fn chained(shutdown: CancellationToken) -> Self {
        let stopped = shutdown.child_token();
        let stopping = stopped.child_token();
        Self {
            stopping,
            stopped,
            shutdown,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self, level: CancelLevel) {
        match level {
            CancelLevel::Stopping => self.stopping.cancel(),
            CancelLevel::Stopped => self.stopped.cancel(),
            CancelLevel::Shutdown => self.shutdown.cancel(),
        }
        let children: Vec<Arc<TokenSet>> = self
            .children
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for child in children {
            child.cancel(level);
        }
    }
}

impl Default for ServerTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTokens {
    /// Fresh root hierarchy.
    pub fn new() -> Self {
        Self {
            set: Arc::new(TokenSet::chained(CancellationToken::new())),
        }
    }

    /// Child set: each level fires when the parent's matching level is
    /// cancelled, and can also be cancelled on its own.
    pub fn derive(&self) -> Self {
        let child = Arc::new(TokenSet::chained(self.set.shutdown.child_token()));
        {
            let mut children = self.set.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Catch up with levels the parent reached before registration.
        if let Some(level) = self.level() {
            child.cancel(level);
        }
        Self { set: child }
    }

    /// Set that only follows the parent's `Shutdown`.
    ///
    /// Used for the heartbeat, which must outlive a generation's restart.
    pub fn derive_shutdown_only(&self) -> Self {
        Self {
            set: Arc::new(TokenSet::chained(self.set.shutdown.child_token())),
        }
    }

    pub fn stopping(&self) -> &CancellationToken {
        &self.set.stopping
    }

    pub fn stopped(&self) -> &CancellationToken {
        &self.set.stopped
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.set.shutdown
    }

    pub fn token(&self, level: CancelLevel) -> &CancellationToken {
        match level {
            CancelLevel::Stopping => self.stopping(),
            CancelLevel::Stopped => self.stopped(),
            CancelLevel::Shutdown => self.shutdown(),
        }
    }

    /// Cancel `level` and every milder level, here and in derived sets.
    pub fn cancel(&self, level: CancelLevel) {
        self.set.cancel(level);
    }

    pub fn is_cancelled(&self, level: CancelLevel) -> bool {
        self.token(level).is_cancelled()
    }

    /// The most severe level that has fired.
    pub fn level(&self) -> Option<CancelLevel> {
        if self.shutdown().is_cancelled() {
            Some(CancelLevel::Shutdown)
        } else if self.stopped().is_cancelled() {
            Some(CancelLevel::Stopped)
        } else if self.stopping().is_cancelled() {
            Some(CancelLevel::Stopping)
        } else {
            None
        }
    }

    /// `Err(Cancelled)` once `Stopping` has fired.
    pub fn check(&self) -> Result<()> {
        match self.level() {
            Some(level) => Err(Error::Cancelled(level)),
            None => Ok(()),
        }
    }

    /// Error to report when the `Stopping` token ended an operation.
    pub fn cancelled_error(&self) -> Error {
        Error::Cancelled(self.level().unwrap_or(CancelLevel::Stopping))
    }
}

/// Lets a component ask its server to tear down the current generation and
/// start a new one.
///
/// The server keeps one signal for its whole life and re-arms it for each
/// generation, so a component that outlives generations (the heartbeat)
/// always reaches the current one.
#[derive(Clone, Debug)]
pub struct RestartSignal {
    state: Arc<Mutex<RestartState>>,
}

#[derive(Debug)]
struct RestartState {
    generation: ServerTokens,
    reason: Option<String>,
}

impl RestartSignal {
    pub fn new(generation: ServerTokens) -> Self {
        Self {
            state: Arc::new(Mutex::new(RestartState {
                generation,
                reason: None,
            })),
        }
    }

    /// Returns `false` if a restart was already requested.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        let generation = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.into());
            state.generation.clone()
        };
        generation.cancel(CancelLevel::Stopping);
        true
    }

    /// Points the signal at a new generation and clears any pending request.
    pub fn rearm(&self, generation: ServerTokens) {
        let mut state = self.state.lock();
        state.generation = generation;
        state.reason = None;
    }

    pub fn is_requested(&self) -> bool {
        self.state.lock().reason.is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.state.lock().reason.clone()
    }
}

/// Sleeps unless `token` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Races `fut` against the `Stopping` level of `tokens`.
pub async fn until_stopping<T, F>(tokens: &ServerTokens, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = tokens.stopping().cancelled() => Err(tokens.cancelled_error()),
        res = fut => res,
    }
}
