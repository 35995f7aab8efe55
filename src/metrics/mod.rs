//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks the job lifecycle across both sides of the queue: jobs enqueued by
//! the commander, results applied to state, publish failures, and the size
//! and load of the agent's worker pool.
//!
//! # Example
//!
//! ```ignore
//! use mrva_commander::metrics::{export_metrics, init_metrics, record_job_enqueued};
//!
//! init_metrics()?;
//! record_job_enqueued();
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{
    record_job_enqueued, record_job_finished, record_job_started, record_publish_failure,
    record_result_applied, set_active_workers, set_worker_target,
};
pub use prometheus::{export_metrics, init_metrics, metrics_handler, REGISTRY};
