//! Server state: sessions, job lists, statuses, results and job metadata.
//!
//! The commander is the only writer. Two implementations share one contract:
//!
//! - **MemoryState**: guarded maps for standalone mode and tests
//! - **PostgresState**: relational store via sqlx, with an idempotent
//!   migration runner
//!
//! # Status transitions
//!
//! A job's status starts out `Queued` and moves to exactly one terminal value
//! (`Succeeded` or `Failed`). Re-recording the same terminal value is
//! accepted so a redelivered result is harmless; recording a different one
//! is rejected with [`StateError::TerminalStatus`].

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::job::{AnalyzeJob, AnalyzeResult, JobInfo, JobSpec, JobStatus, SessionId};

pub use memory::MemoryState;
pub use migrations::{MigrationError, MigrationRunner};
pub use postgres::PostgresState;

/// Errors that can occur during state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The session id was never allocated.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// No status recorded for the job.
    #[error("No status recorded for job {0}")]
    StatusNotFound(JobSpec),

    /// No result recorded for the job.
    #[error("No result recorded for job {0}")]
    ResultNotFound(JobSpec),

    /// No metadata recorded for the job.
    #[error("No job info recorded for job {0}")]
    JobInfoNotFound(JobSpec),

    /// No job with this repository index in the session.
    #[error("No repository {repo_id} in session {session_id}")]
    RepoIdNotFound { session_id: SessionId, repo_id: i64 },

    /// The job was already added to its session.
    #[error("Job {0} already exists")]
    DuplicateJob(JobSpec),

    /// Attempted to overwrite a terminal status with a different value.
    #[error("Job {spec} is already {current}, refusing to set {requested}")]
    TerminalStatus {
        spec: JobSpec,
        current: JobStatus,
        requested: JobStatus,
    },

    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored value is not valid for its column.
    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

impl StateError {
    /// Returns true for the "unknown key" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StateError::UnknownSession(_)
                | StateError::StatusNotFound(_)
                | StateError::ResultNotFound(_)
                | StateError::JobInfoNotFound(_)
                | StateError::RepoIdNotFound { .. }
        )
    }
}

/// Checks a status write against the monotonic transition rule.
///
/// Returns `Ok(true)` if the write should be applied, `Ok(false)` if it is a
/// repeat of the already-recorded terminal value.
pub(crate) fn check_transition(
    spec: &JobSpec,
    current: Option<JobStatus>,
    requested: JobStatus,
) -> Result<bool, StateError> {
    match current {
        Some(current) if current.is_terminal() => {
            if current == requested {
                Ok(false)
            } else {
                Err(StateError::TerminalStatus {
                    spec: spec.clone(),
                    current,
                    requested,
                })
            }
        }
        _ => Ok(true),
    }
}

/// Outcome of [`ServerState::complete_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Result and status were written.
    Applied,
    /// The job had already finished with this status; nothing was written.
    AlreadyFinished(JobStatus),
}

/// Persistent view of sessions and their jobs.
#[async_trait]
pub trait ServerState: Send + Sync {
    /// Allocates a fresh session id, strictly greater than any before it,
    /// and registers the session with an empty job list.
    async fn next_id(&self) -> Result<SessionId, StateError>;

    /// Appends a job to its session's job list and returns its repository
    /// index (0-based position within the session).
    async fn add_job(&self, job: &AnalyzeJob) -> Result<i64, StateError>;

    /// Returns the session's jobs in insertion order.
    async fn get_job_list(&self, session_id: SessionId) -> Result<Vec<AnalyzeJob>, StateError>;

    /// Records a job's status, enforcing monotonic terminal transitions.
    async fn set_status(&self, spec: &JobSpec, status: JobStatus) -> Result<(), StateError>;

    async fn get_status(&self, spec: &JobSpec) -> Result<JobStatus, StateError>;

    /// Records a job's result. Overwrites any earlier result for the job.
    async fn set_result(&self, spec: &JobSpec, result: &AnalyzeResult) -> Result<(), StateError>;

    async fn get_result(&self, spec: &JobSpec) -> Result<AnalyzeResult, StateError>;

    /// Records a job's result and its terminal status as one write.
    ///
    /// Readers see either neither or both. A job that already has a
    /// terminal status is left untouched.
    async fn complete_job(&self, result: &AnalyzeResult) -> Result<Completion, StateError>;

    async fn set_job_info(&self, spec: &JobSpec, info: &JobInfo) -> Result<(), StateError>;

    async fn get_job_info(&self, spec: &JobSpec) -> Result<JobInfo, StateError>;

    /// Resolves a repository index back to its job spec.
    async fn get_job_spec_by_repo_id(
        &self,
        session_id: SessionId,
        repo_id: i64,
    ) -> Result<JobSpec, StateError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NameWithOwner;

    fn spec() -> JobSpec {
        JobSpec::new(1, NameWithOwner::new("a", "b"))
    }

    #[test]
    fn test_transition_from_queued() {
        assert!(check_transition(&spec(), None, JobStatus::Queued).unwrap());
        assert!(check_transition(&spec(), Some(JobStatus::Queued), JobStatus::Succeeded).unwrap());
        assert!(check_transition(&spec(), Some(JobStatus::Queued), JobStatus::Failed).unwrap());
    }

    #[test]
    fn test_transition_terminal_is_sticky() {
        assert!(!check_transition(&spec(), Some(JobStatus::Succeeded), JobStatus::Succeeded).unwrap());
        assert!(matches!(
            check_transition(&spec(), Some(JobStatus::Succeeded), JobStatus::Failed),
            Err(StateError::TerminalStatus { .. })
        ));
        assert!(matches!(
            check_transition(&spec(), Some(JobStatus::Failed), JobStatus::Queued),
            Err(StateError::TerminalStatus { .. })
        ));
    }

    #[test]
    fn test_state_error_not_found_family() {
        assert!(StateError::UnknownSession(3).is_not_found());
        assert!(StateError::StatusNotFound(spec()).is_not_found());
        assert!(!StateError::DuplicateJob(spec()).is_not_found());

        let err = StateError::TerminalStatus {
            spec: spec(),
            current: JobStatus::Succeeded,
            requested: JobStatus::Failed,
        };
        assert!(err.to_string().contains("succeeded"));
        assert!(err.to_string().contains("1:a/b"));
    }
}
