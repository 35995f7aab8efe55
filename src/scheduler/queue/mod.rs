//! Job and result queues between the commander and the workers.
//!
//! Two logical streams connect the two sides: `tasks` carries
//! [`AnalyzeJob`]s from the commander to the workers and `results` carries
//! [`AnalyzeResult`]s back. Each side consumes exactly one of them.
//!
//! # Backends
//!
//! - **MemoryQueue**: bounded in-process channels for standalone mode
//! - **RedisStreamQueue**: Redis Streams with a consumer group, manual
//!   acknowledgement and lazy reconnection
//!
//! # Delivery
//!
//! Broker-backed delivery is at-least-once: a message is acknowledged only
//! after it has been handed to the local consumer, so a crash between the two
//! redelivers it. Consumers must treat duplicates as harmless.

pub mod memory;
pub mod redis_stream;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::job::{AnalyzeJob, AnalyzeResult};

pub use memory::MemoryQueue;
pub use redis_stream::{default_consumer_name, QueueRole, RedisQueueConfig, RedisStreamQueue};

/// Name of the stream carrying jobs to workers.
pub const TASKS_STREAM: &str = "tasks";

/// Name of the stream carrying results back to the commander.
pub const RESULTS_STREAM: &str = "results";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The broker did not confirm a publish in time.
    #[error("Publish to '{stream}' not confirmed within {timeout:?}")]
    ConfirmTimeout { stream: String, timeout: Duration },

    /// The queue has been closed.
    #[error("Queue is closed")]
    Closed,
}

/// Bidirectional queue used by both the commander and the agent.
///
/// `next_job` and `next_result` wait until a message is available and
/// return `None` once the queue is closed or the stream is not consumed by
/// this side.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publishes a job for the workers.
    async fn publish_job(&self, job: &AnalyzeJob) -> Result<(), QueueError>;

    /// Waits for the next job.
    async fn next_job(&self) -> Option<AnalyzeJob>;

    /// Publishes a result for the commander.
    async fn publish_result(&self, result: &AnalyzeResult) -> Result<(), QueueError>;

    /// Waits for the next result.
    async fn next_result(&self) -> Option<AnalyzeResult>;

    /// Stops consumption and releases broker resources.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConfirmTimeout {
            stream: TASKS_STREAM.to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("tasks"));
        assert!(err.to_string().contains("2s"));

        assert!(QueueError::Closed.to_string().contains("closed"));
    }
}
