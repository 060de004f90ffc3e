//! Kiln - background job processing server.
//!
//! A server embedded in a host process that takes jobs from a shared storage
//! backend, performs them with at-least-once guarantees, moves them through
//! an explicit state machine and stops cooperatively without losing
//! in-flight work. Several servers can run against the same storage; they
//! coordinate through distributed locks and heartbeats.
//!
//! # Core Concepts
//!
//! - **Storage**: [`JobStorage`] and [`StorageConnection`] abstract the
//!   backend. [`InMemoryStorage`] is the reference implementation.
//!
//! - **States**: jobs move between [`JobState`]s through the
//!   [`StateChanger`], a compare-and-set transition that runs the
//!   [`ElectStateFilter`]s such as [`AutomaticRetry`].
//!
//! - **Processes**: long-lived components implement [`BackgroundProcess`]
//!   and run under the execution harness with retry and backoff. The
//!   [`Worker`], the [`DelayedJobScheduler`], the [`RecurringJobScheduler`],
//!   the heartbeat, the watchdog and the [`CancellationWatcher`] are all
//!   processes.
//!
//! - **Cancellation**: [`ServerTokens`] carries the Stopping, Stopped and
//!   Shutdown levels. Each job being performed gets a
//!   [`JobCancellationToken`] that is also aborted when its Processing claim
//!   is changed behind the server's back.
//!
//! - **Server**: [`BackgroundJobServer`] announces itself, dispatches every
//!   process and restarts them in place when its record disappears.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use kiln::*;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(InMemoryStorage::default());
//! let server = BackgroundJobServerBuilder::new(ServerOptions::default())
//!     .with_storage(storage.clone())
//!     .with_performer(Arc::new(MyPerformer))
//!     .build()?;
//! server.start();
//!
//! server.client().enqueue(InvocationData::new("Mailer", "send"), "default").await?;
//! server.stop().await;
//! ```

/// Cancellation hierarchy and restart signalling.
pub mod cancellation;

/// Creating, requeueing and deleting jobs from the host.
pub mod client;

/// Serde-backed server and process options.
pub mod config;

/// Cron occurrence calculation.
pub mod cron;

/// The delayed job scheduler.
pub mod delayed;

/// Crate-wide error type.
pub mod error;

/// In-process server lifecycle events.
pub mod events;

/// Elect-state and server filters.
pub mod filters;

/// Server heartbeat and the watchdog reaping dead servers.
pub mod heartbeat;

/// Server and execution identities.
pub mod identity;

/// Job identifiers, invocation descriptors and stored job data.
pub mod job;

/// Lease-cancellation tokens and their per-server registry.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// The job performer seam and its filter-wrapped runner.
pub mod performer;

/// Recurring job definitions, their scheduler and manager.
pub mod recurring;

/// Execution harness, dispatchers and the server orchestrator.
pub mod runtime;

/// Job lifecycle states.
pub mod state;

/// Compare-and-set state transitions.
pub mod state_changer;

/// Storage abstraction and the in-memory backend.
pub mod storage;

/// Tracing spans and metric hooks.
pub mod telemetry;

/// Lease-cancellation watcher.
pub mod watcher;

/// The worker process.
pub mod worker;

pub use cancellation::{CancelLevel, RestartSignal, ServerTokens};
pub use client::BackgroundJobClient;
pub use config::*;
pub use cron::{CronOccurrences, OccurrenceCalculator};
pub use delayed::DelayedJobScheduler;
pub use error::{Error, Result};
pub use events::{ServerEvent, ServerEventBus, ServerEventPayload};
pub use filters::*;
pub use heartbeat::{ServerHeartbeat, ServerWatchdog};
pub use identity::{ExecutionId, ServerId};
pub use job::*;
pub use lease::{JobCancellationToken, LeaseTokenRegistry};
pub use performer::{BackgroundJobPerformer, JobPerformer, PerformContext};
pub use recurring::{
    MisfireHandling, RecurringJobEntity, RecurringJobManager, RecurringJobOptions,
    RecurringJobScheduler,
};
pub use runtime::*;
pub use state::{JobState, StateData, StateKind};
pub use state_changer::{ChangeStateRequest, StateChanger};
pub use storage::memory::{InMemoryOptions, InMemoryStorage};
pub use storage::{
    DistributedLock, FetchedJob, JobStorage, StorageCapabilities, StorageConnection,
    WriteTransaction,
};
pub use watcher::CancellationWatcher;
pub use worker::Worker;
