//! Tracing spans and telemetry hooks for kiln.
//!
//! Span constructors are used by the worker, the state changer and the
//! periodic processes so every log line carries the job or server it belongs
//! to. The `record_*` helpers log and, with the `metrics` feature, update the
//! Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use kiln::telemetry::perform_span;
//! use tracing::Instrument;
//!
//! let result = performer.perform(&ctx).instrument(perform_span(&ctx.job)).await;
//! ```

use std::time::Duration;
use tracing::{info_span, Span};

use crate::identity::{ExecutionId, ServerId};
use crate::job::{BackgroundJob, JobId};

/// Span around one worker iteration, from claim to settlement.
#[must_use]
pub fn worker_span(job_id: &JobId, queue: &str, execution_id: ExecutionId) -> Span {
    info_span!(
        "kiln.worker",
        job_id = %job_id,
        queue = %queue,
        execution_id = %execution_id,
    )
}

/// Span around the filter pipeline and the user payload.
#[must_use]
pub fn perform_span(job: &BackgroundJob) -> Span {
    info_span!(
        "kiln.perform",
        job_id = %job.id,
        job = %job.invocation,
    )
}

#[must_use]
pub fn state_change_span(job_id: &JobId, state: &str) -> Span {
    info_span!(
        "kiln.state_change",
        job_id = %job_id,
        state = %state,
    )
}

/// Span around one delayed-scheduler pass loop.
#[must_use]
pub fn schedule_span(server_id: &ServerId) -> Span {
    info_span!("kiln.schedule", server_id = %server_id)
}

/// Span around one recurring-scheduler pass loop.
#[must_use]
pub fn recurring_span(server_id: &ServerId) -> Span {
    info_span!("kiln.recurring", server_id = %server_id)
}

#[must_use]
pub fn heartbeat_span(server_id: &ServerId) -> Span {
    info_span!("kiln.heartbeat", server_id = %server_id)
}

/// Span covering a server's whole life, across generations.
#[must_use]
pub fn server_span(server_id: &ServerId) -> Span {
    info_span!("kiln.server", server_id = %server_id)
}

/// Records how a performed job ended.
///
/// `latency` runs from job creation to the start of the perform, `duration`
/// covers the perform itself.
pub fn record_job_performed(outcome: &str, latency: Duration, duration: Duration) {
    tracing::debug!(
        outcome,
        latency_ms = latency.as_millis() as u64,
        duration_ms = duration.as_millis() as u64,
        "job performed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_performed(outcome, latency.as_secs_f64(), duration.as_secs_f64());
}

pub fn record_state_change_retry(state: &str) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_state_change_retry(state);
    #[cfg(not(feature = "metrics"))]
    let _ = state;
}

/// Records jobs moved into queues by a scheduler (`delayed` or `recurring`).
pub fn record_scheduler_triggered(scheduler: &str, count: usize) {
    tracing::trace!(scheduler, count, "scheduler triggered jobs");

    #[cfg(feature = "metrics")]
    crate::metrics::record_scheduler_triggered(scheduler, count as u64);
}

pub fn record_server_restart(reason: &str) {
    tracing::info!(reason, "server restart recorded");

    #[cfg(feature = "metrics")]
    crate::metrics::record_server_restart(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::InvocationData;
    use chrono::Utc;

    #[test]
    fn spans_use_kiln_names() {
        let job = BackgroundJob {
            id: JobId::new("1"),
            invocation: InvocationData::new("Mailer", "send"),
            created_at: Utc::now(),
        };
        let server = ServerId::from("server-1");
        let cases = [
            (worker_span(&job.id, "default", ExecutionId::new()), "kiln.worker"),
            (perform_span(&job), "kiln.perform"),
            (state_change_span(&job.id, "Enqueued"), "kiln.state_change"),
            (schedule_span(&server), "kiln.schedule"),
            (recurring_span(&server), "kiln.recurring"),
            (heartbeat_span(&server), "kiln.heartbeat"),
            (server_span(&server), "kiln.server"),
        ];
        for (span, name) in cases {
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), name);
            }
        }
    }

    #[test]
    fn recorders_accept_any_outcome() {
        record_job_performed("succeeded", Duration::from_millis(5), Duration::from_millis(1));
        record_state_change_retry("Processing");
        record_scheduler_triggered("delayed", 3);
        record_server_restart("server_gone");
    }
}
