//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the commander and the
//! agent and provides functions for initializing and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs published to the tasks stream.
pub static JOBS_ENQUEUED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Results applied to server state, labeled by status.
pub static RESULTS_APPLIED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Publish failures, labeled by stream.
pub static QUEUE_PUBLISH_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of running workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Worker count the elastic sizer last aimed for.
pub static WORKER_TARGET: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently being analyzed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Job duration in seconds, from dequeue to published result.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_enqueued_total = Counter::new(
        "mrva_jobs_enqueued_total",
        "Total jobs published to the tasks stream",
    )?;

    let results_applied_total = CounterVec::new(
        Opts::new(
            "mrva_results_applied_total",
            "Results applied to server state",
        ),
        &["status"],
    )?;

    let queue_publish_failures_total = CounterVec::new(
        Opts::new(
            "mrva_queue_publish_failures_total",
            "Messages the broker did not confirm",
        ),
        &["stream"],
    )?;

    let active_workers = Gauge::new("mrva_active_workers", "Number of running workers")?;
    let worker_target = Gauge::new("mrva_worker_target", "Target number of workers")?;
    let jobs_in_progress = Gauge::new(
        "mrva_jobs_in_progress",
        "Number of jobs currently being analyzed",
    )?;

    let job_duration = Histogram::with_opts(
        HistogramOpts::new("mrva_job_duration_seconds", "Job duration in seconds")
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
    )?;

    registry.register(Box::new(jobs_enqueued_total.clone()))?;
    registry.register(Box::new(results_applied_total.clone()))?;
    registry.register(Box::new(queue_publish_failures_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(worker_target.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;

    // Losing a race with a concurrent initializer is harmless.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_ENQUEUED_TOTAL.set(jobs_enqueued_total);
    let _ = RESULTS_APPLIED_TOTAL.set(results_applied_total);
    let _ = QUEUE_PUBLISH_FAILURES_TOTAL.set(queue_publish_failures_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = WORKER_TARGET.set(worker_target);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = JOB_DURATION.set(job_duration);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry was never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
