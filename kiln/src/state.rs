//! Job lifecycle states.
//!
//! A [`JobState`] is what a component asks storage to move a job into. Once
//! persisted it becomes a [`StateData`] record: a name, a reason, and a flat
//! string map. Only the current record is authoritative for concurrency
//! decisions; earlier ones form an append-only history kept by storage.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Error;
use crate::identity::{ExecutionId, ServerId};
use crate::job::JobId;

pub const ENQUEUED: &str = "Enqueued";
pub const PROCESSING: &str = "Processing";
pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const SCHEDULED: &str = "Scheduled";
pub const DELETED: &str = "Deleted";
pub const AWAITING: &str = "Awaiting";

pub const DEFAULT_QUEUE: &str = "default";

#[derive(Clone, Debug, PartialEq)]
pub enum StateKind {
    Enqueued {
        queue: String,
    },
    Processing {
        server_id: ServerId,
        worker_id: ExecutionId,
    },
    Succeeded {
        result: Option<serde_json::Value>,
        latency: Duration,
        duration: Duration,
    },
    Failed {
        error_kind: String,
        message: String,
        details: String,
        server_id: Option<ServerId>,
    },
    Scheduled {
        enqueue_at: DateTime<Utc>,
    },
    Deleted,
    Awaiting {
        parent_id: JobId,
    },
    Custom {
        name: String,
        data: BTreeMap<String, String>,
    },
}

/// A candidate state for a transition.
#[derive(Clone, Debug, PartialEq)]
pub struct JobState {
    pub kind: StateKind,
    pub reason: Option<String>,
}

impl JobState {
    fn of(kind: StateKind) -> Self {
        Self { kind, reason: None }
    }

    pub fn enqueued(queue: impl Into<String>) -> Self {
        Self::of(StateKind::Enqueued {
            queue: queue.into(),
        })
    }

    pub fn processing(server_id: ServerId, worker_id: ExecutionId) -> Self {
        Self::of(StateKind::Processing {
            server_id,
            worker_id,
        })
    }

    pub fn succeeded(
        result: Option<serde_json::Value>,
        latency: Duration,
        duration: Duration,
    ) -> Self {
        Self::of(StateKind::Succeeded {
            result,
            latency,
            duration,
        })
    }

    /// Failed state capturing an error and its full cause chain.
    pub fn failed(error: &Error, server_id: Option<ServerId>) -> Self {
        Self::of(StateKind::Failed {
            error_kind: error.kind().to_string(),
            message: error.to_string(),
            details: error.details(),
            server_id,
        })
    }

    pub fn scheduled(enqueue_at: DateTime<Utc>) -> Self {
        Self::of(StateKind::Scheduled { enqueue_at })
    }

    pub fn scheduled_in(delay: Duration) -> Self {
        let enqueue_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::scheduled(enqueue_at)
    }

    pub fn deleted() -> Self {
        Self::of(StateKind::Deleted)
    }

    pub fn awaiting(parent_id: JobId) -> Self {
        Self::of(StateKind::Awaiting { parent_id })
    }

    pub fn custom(name: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self::of(StateKind::Custom {
            name: name.into(),
            data,
        })
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn name(&self) -> &str {
        match &self.kind {
            StateKind::Enqueued { .. } => ENQUEUED,
            StateKind::Processing { .. } => PROCESSING,
            StateKind::Succeeded { .. } => SUCCEEDED,
            StateKind::Failed { .. } => FAILED,
            StateKind::Scheduled { .. } => SCHEDULED,
            StateKind::Deleted => DELETED,
            StateKind::Awaiting { .. } => AWAITING,
            StateKind::Custom { name, .. } => name,
        }
    }

    /// Final states end the job's life; storage may expire them.
    pub fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Succeeded { .. } | StateKind::Deleted)
    }

    pub fn serialize_data(&self) -> BTreeMap<String, String> {
        let now = Utc::now().to_rfc3339();
        let mut data = BTreeMap::new();
        match &self.kind {
            StateKind::Enqueued { queue } => {
                data.insert("EnqueuedAt".into(), now);
                data.insert("Queue".into(), queue.clone());
            }
            StateKind::Processing {
                server_id,
                worker_id,
            } => {
                data.insert("StartedAt".into(), now);
                data.insert("ServerId".into(), server_id.to_string());
                data.insert("WorkerId".into(), worker_id.to_string());
            }
            StateKind::Succeeded {
                result,
                latency,
                duration,
            } => {
                data.insert("SucceededAt".into(), now);
                data.insert("Latency".into(), latency.as_millis().to_string());
                data.insert("PerformanceDuration".into(), duration.as_millis().to_string());
                if let Some(result) = result {
                    data.insert("Result".into(), result.to_string());
                }
            }
            StateKind::Failed {
                error_kind,
                message,
                details,
                server_id,
            } => {
                data.insert("FailedAt".into(), now);
                data.insert("ExceptionType".into(), error_kind.clone());
                data.insert("ExceptionMessage".into(), message.clone());
                data.insert("ExceptionDetails".into(), details.clone());
                if let Some(server_id) = server_id {
                    data.insert("ServerId".into(), server_id.to_string());
                }
            }
            StateKind::Scheduled { enqueue_at } => {
                data.insert("EnqueueAt".into(), enqueue_at.to_rfc3339());
                data.insert("ScheduledAt".into(), now);
            }
            StateKind::Deleted => {
                data.insert("DeletedAt".into(), now);
            }
            StateKind::Awaiting { parent_id } => {
                data.insert("ParentId".into(), parent_id.to_string());
            }
            StateKind::Custom { data: custom, .. } => {
                data.extend(custom.clone());
            }
        }
        data
    }

    pub fn to_record(&self) -> StateData {
        StateData {
            name: self.name().to_string(),
            reason: self.reason.clone(),
            data: self.serialize_data(),
            created_at: Utc::now(),
        }
    }
}

/// A persisted state record.
#[derive(Clone, Debug, PartialEq)]
pub struct StateData {
    pub name: String,
    pub reason: Option<String>,
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl StateData {
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// The `(ServerId, WorkerId)` pair of a Processing record.
    pub fn processing_owner(&self) -> Option<(&str, &str)> {
        if !self.is(PROCESSING) {
            return None;
        }
        let server = self.data.get("ServerId")?;
        let worker = self.data.get("WorkerId")?;
        Some((server.as_str(), worker.as_str()))
    }

    /// True when this is a Processing record owned by exactly this lease.
    pub fn is_owned_by(&self, server_id: &ServerId, worker_id: &ExecutionId) -> bool {
        self.processing_owner()
            .is_some_and(|(s, w)| s == server_id.as_str() && w == worker_id.to_string())
    }

    pub fn queue(&self) -> Option<&str> {
        self.data.get("Queue").map(String::as_str)
    }

    pub fn enqueue_at(&self) -> Option<DateTime<Utc>> {
        self.data
            .get("EnqueueAt")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
    }
}
