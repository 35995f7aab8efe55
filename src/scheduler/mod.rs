//! Job distribution between the commander and analysis workers.
//!
//! - **job**: identities and payloads exchanged over the queue
//! - **queue**: job and result streams, in-process or over Redis Streams
//! - **worker_pool**: workers that turn jobs into results
//! - **sizing**: how many workers the host can sustain
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Commander   │
//!                      └──┬────────▲──┘
//!                   tasks │        │ results
//!                      ┌──▼────────┴──┐
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Acknowledged delivery**: broker messages are acked only once handed over
//! - **Crash recovery**: a restarted consumer re-reads its unacknowledged entries
//! - **One result per job**: runner failures become failed results
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod job;
pub mod queue;
pub mod sizing;
pub mod worker_pool;

pub use job::{
    AnalyzeJob, AnalyzeResult, JobInfo, JobSpec, JobStatus, NameWithOwner, SessionId,
    SkippedRepositories,
};
pub use queue::{JobQueue, MemoryQueue, QueueError, RedisStreamQueue};
pub use sizing::{ResourceProbe, SystemProbe};
pub use worker_pool::{PoolError, PoolStats, WorkerContext, WorkerPool, WorkerPoolConfig};
