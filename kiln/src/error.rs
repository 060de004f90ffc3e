use thiserror::Error;

use crate::cancellation::CancelLevel;
use crate::identity::ServerId;
use crate::job::JobId;

/// Result alias used across kiln's collaborator seams.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure kiln distinguishes at a catch site.
///
/// Cancellation and lease-abort are control flow, not faults: callers check
/// [`Error::is_cancellation`] and [`Error::is_job_aborted`] before treating an
/// error as something to retry or record. Panics are never converted into an
/// `Error`; they are the unrecoverable class and end the component task.
#[derive(Debug, Error)]
pub enum Error {
    /// One of the server's cancellation levels fired.
    #[error("operation was cancelled ({0} requested)")]
    Cancelled(CancelLevel),

    /// A distributed lock could not be taken before its timeout elapsed.
    ///
    /// Schedulers read this as "a peer is already doing this work".
    #[error("timeout expired while acquiring distributed lock on '{resource}'")]
    LockTimeout { resource: String },

    /// Ownership of the job was revoked while it was being performed.
    #[error("background job '{0}' was aborted")]
    JobAborted(JobId),

    /// The server's record disappeared from storage.
    #[error("server '{0}' was considered dead by other servers")]
    ServerGone(ServerId),

    /// User code failed while performing a job.
    #[error("{message}")]
    Performance {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// A server or state filter failed.
    #[error("filter '{filter}' failed: {source}")]
    Filter {
        filter: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cron expression '{expression}' is invalid: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("time zone '{0}' is not recognized")]
    UnknownTimeZone(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transient storage failure (connection loss, contention, timeouts).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Wraps a failure raised by job code.
    pub fn performance(source: impl Into<anyhow::Error>) -> Self {
        let source = source.into();
        Self::Performance {
            message: source.to_string(),
            source,
        }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        Self::Storage(anyhow::anyhow!("{message}"))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_job_aborted(&self) -> bool {
        matches!(self, Self::JobAborted(_))
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Errors that a retry loop may swallow and try again.
    pub fn is_catchable(&self) -> bool {
        !self.is_cancellation()
    }

    /// Short type-like name recorded in the Failed state.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "Cancelled",
            Self::LockTimeout { .. } => "LockTimeout",
            Self::JobAborted(_) => "JobAborted",
            Self::ServerGone(_) => "ServerGone",
            Self::Performance { .. } => "JobPerformance",
            Self::Filter { .. } => "Filter",
            Self::InvalidCron { .. } => "InvalidCron",
            Self::UnknownTimeZone(_) => "UnknownTimeZone",
            Self::Config(_) => "Config",
            Self::Storage(_) => "Storage",
        }
    }

    /// Full text with the source chain, stored as exception details.
    pub fn details(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
