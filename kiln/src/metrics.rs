//! Prometheus metrics for kiln.
//!
//! Compiled only with the `metrics` feature. Collectors live in a crate-wide
//! [`REGISTRY`]; call [`init_metrics`] once and expose [`gather_metrics`]
//! from the host's scrape endpoint.
//!
//! # Metrics
//!
//! ## Counters
//! - `kiln_jobs_performed_total` - Jobs performed, by outcome
//! - `kiln_state_change_retries_total` - Retried state transitions, by target state
//! - `kiln_scheduler_triggered_total` - Jobs moved into queues, by scheduler
//! - `kiln_server_restarts_total` - Generation restarts, by reason
//!
//! ## Histograms
//! - `kiln_job_duration_seconds` - Time spent performing a job
//! - `kiln_job_latency_seconds` - Time from job creation to perform start
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `outcome`: succeeded, failed or aborted
pub static JOBS_PERFORMED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("kiln_jobs_performed_total", "Total number of jobs performed");
    CounterVec::new(opts, &["outcome"]).expect("kiln_jobs_performed_total metric creation failed")
});

/// Labels:
/// - `state`: the state the transition was heading to
pub static STATE_CHANGE_RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "kiln_state_change_retries_total",
        "Total number of retried state transitions",
    );
    CounterVec::new(opts, &["state"])
        .expect("kiln_state_change_retries_total metric creation failed")
});

/// Labels:
/// - `scheduler`: delayed or recurring
pub static SCHEDULER_TRIGGERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "kiln_scheduler_triggered_total",
        "Total number of jobs moved into queues by schedulers",
    );
    CounterVec::new(opts, &["scheduler"])
        .expect("kiln_scheduler_triggered_total metric creation failed")
});

/// Labels:
/// - `reason`: what asked for the restart
pub static SERVER_RESTARTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("kiln_server_restarts_total", "Total number of server restarts");
    CounterVec::new(opts, &["reason"]).expect("kiln_server_restarts_total metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new("kiln_job_duration_seconds", "Job perform duration in seconds")
        .buckets(buckets);
    HistogramVec::new(opts, &["outcome"]).expect("kiln_job_duration_seconds metric creation failed")
});

pub static JOB_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 18).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "kiln_job_latency_seconds",
        "Time from job creation to perform start in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"]).expect("kiln_job_latency_seconds metric creation failed")
});

/// Registers all collectors. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_PERFORMED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(STATE_CHANGE_RETRIES_TOTAL.clone()),
        Box::new(SCHEDULER_TRIGGERED_TOTAL.clone()),
        Box::new(SERVER_RESTARTS_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
        Box::new(JOB_LATENCY_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_performed(outcome: &str, latency_secs: f64, duration_secs: f64) {
    JOBS_PERFORMED_TOTAL.with_label_values(&[outcome]).inc();
    JOB_LATENCY_SECONDS
        .with_label_values(&[outcome])
        .observe(latency_secs);
    JOB_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_state_change_retry(state: &str) {
    STATE_CHANGE_RETRIES_TOTAL.with_label_values(&[state]).inc();
}

pub fn record_scheduler_triggered(scheduler: &str, count: u64) {
    SCHEDULER_TRIGGERED_TOTAL
        .with_label_values(&[scheduler])
        .inc_by(count as f64);
}

pub fn record_server_restart(reason: &str) {
    SERVER_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

/// All registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
