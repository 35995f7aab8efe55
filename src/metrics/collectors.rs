//! Recording helpers for the commander and agent metrics.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_ENQUEUED_TOTAL, JOBS_IN_PROGRESS, JOB_DURATION,
    QUEUE_PUBLISH_FAILURES_TOTAL, RESULTS_APPLIED_TOTAL, WORKER_TARGET,
};

/// Records a job handed to the queue.
pub fn record_job_enqueued() {
    if let Some(counter) = JOBS_ENQUEUED_TOTAL.get() {
        counter.inc();
    }
}

/// Records a result written to server state.
pub fn record_result_applied(status: &str) {
    if let Some(counter) = RESULTS_APPLIED_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
    tracing::trace!(status = status, "Recorded applied result");
}

/// Records a publish the broker did not confirm.
pub fn record_publish_failure(stream: &str) {
    if let Some(counter) = QUEUE_PUBLISH_FAILURES_TOTAL.get() {
        counter.with_label_values(&[stream]).inc();
    }
}

pub fn set_active_workers(count: usize) {
    if let Some(gauge) = ACTIVE_WORKERS.get() {
        gauge.set(count as f64);
    }
}

pub fn set_worker_target(count: usize) {
    if let Some(gauge) = WORKER_TARGET.get() {
        gauge.set(count as f64);
    }
}

/// Records a worker picking up a job.
pub fn record_job_started() {
    if let Some(gauge) = JOBS_IN_PROGRESS.get() {
        gauge.inc();
    }
}

/// Records a worker finishing a job, successfully or not.
pub fn record_job_finished(duration: Duration) {
    if let Some(gauge) = JOBS_IN_PROGRESS.get() {
        gauge.dec();
    }
    if let Some(histogram) = JOB_DURATION.get() {
        histogram.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recorders_show_up_in_export() {
        let _ = init_metrics();

        record_job_enqueued();
        record_result_applied("succeeded");
        record_publish_failure("tasks");
        set_active_workers(3);
        set_worker_target(4);
        record_job_started();
        record_job_finished(Duration::from_secs(2));

        let text = export_metrics();
        assert!(text.contains("mrva_results_applied_total{status=\"succeeded\"}"));
        assert!(text.contains("mrva_queue_publish_failures_total{stream=\"tasks\"}"));
        assert!(text.contains("mrva_worker_target"));
        assert!(text.contains("mrva_job_duration_seconds_count"));
    }
}
