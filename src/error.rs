//! Error types for the commander.
//!
//! Each subsystem owns its error enum next to its code; this module defines
//! [`CommanderError`], the taxonomy client-facing operations report, and
//! re-exports the subsystem errors for convenience.

use thiserror::Error;

use crate::scheduler::job::{JobSpecError, SessionId};

pub use crate::config::ConfigError;
pub use crate::locator::LocatorError;
pub use crate::runner::RunnerError;
pub use crate::scheduler::queue::QueueError;
pub use crate::scheduler::worker_pool::PoolError;
pub use crate::state::StateError;
pub use crate::storage::ArtifactError;

/// Errors reported by commander operations.
#[derive(Debug, Error)]
pub enum CommanderError {
    /// Malformed submission, query pack or download token.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The job, result or artifact does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session id was never allocated.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    /// The session exists but none of its repositories had a database.
    #[error("No jobs found for session {0}")]
    SessionEmpty(SessionId),

    #[error("State error: {0}")]
    State(StateError),

    #[error("Artifact store error: {0}")]
    Artifact(ArtifactError),

    #[error("Database locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommanderError {
    /// Returns true if the error is the caller's fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CommanderError::Validation(_)
                | CommanderError::NotFound(_)
                | CommanderError::UnknownSession(_)
                | CommanderError::SessionEmpty(_)
        )
    }
}

impl From<StateError> for CommanderError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::UnknownSession(id) => CommanderError::UnknownSession(id),
            e if e.is_not_found() => CommanderError::NotFound(e.to_string()),
            e => CommanderError::State(e),
        }
    }
}

impl From<ArtifactError> for CommanderError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(location) => {
                CommanderError::NotFound(format!("artifact {}", location))
            }
            e => CommanderError::Artifact(e),
        }
    }
}

impl From<JobSpecError> for CommanderError {
    fn from(err: JobSpecError) -> Self {
        CommanderError::Validation(err.to_string())
    }
}
