//! mrva-commander: multi-repository variant analysis.
//!
//! A commander accepts a query pack and a list of repositories, fans one job
//! per repository with a pre-built analysis database out over a queue, and
//! collects the per-repository results that a pool of workers publishes back.
//!
//! Every infrastructure seam is a trait with an in-process implementation and
//! a networked one, so the same code runs as a single process or split into
//! a server and any number of agents.

// Core modules
pub mod cli;
pub mod commander;
pub mod config;
pub mod deploy;
pub mod error;
pub mod locator;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use commander::Commander;
pub use config::Config;
pub use error::{
    ArtifactError, CommanderError, ConfigError, LocatorError, PoolError, QueueError,
    RunnerError, StateError,
};
pub use scheduler::{
    AnalyzeJob, AnalyzeResult, JobQueue, JobSpec, JobStatus, NameWithOwner, SessionId,
    WorkerPool, WorkerPoolConfig,
};
