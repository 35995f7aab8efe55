//! Job definitions for the scheduler.
//!
//! This module defines the core types that flow between the commander,
//! the queue and the workers:
//!
//! - `NameWithOwner`: an `owner/repo` repository identifier
//! - `JobSpec`: the unique key of one repository's analysis in a session
//! - `AnalyzeJob`: the unit of work dispatched to a worker
//! - `AnalyzeResult`: the outcome a worker publishes back
//! - `JobStatus`: lifecycle status of a job
//! - `JobInfo`: session metadata stored alongside every job

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::ArtifactLocation;

/// Monotonically increasing identifier of a submitted session.
pub type SessionId = i64;

/// Errors produced while parsing job identifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobSpecError {
    /// A repository string was not of the form `owner/repo`.
    #[error("invalid repository name '{0}', expected owner/repo")]
    InvalidRepository(String),

    /// A download token could not be decoded.
    #[error("invalid job token: {0}")]
    InvalidToken(String),
}

/// Repository identifier, rendered as `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameWithOwner {
    pub owner: String,
    pub repo: String,
}

impl NameWithOwner {
    /// Creates a repository identifier from its two components.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// True if both components can be used as single path segments.
    pub fn is_valid(&self) -> bool {
        is_name_segment(&self.owner) && is_name_segment(&self.repo)
    }
}

/// Rejects empty names, `.`, `..` and anything holding a separator.
fn is_name_segment(s: &str) -> bool {
    !s.trim().is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

impl fmt::Display for NameWithOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl FromStr for NameWithOwner {
    type Err = JobSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(repo), None) if is_name_segment(owner) && is_name_segment(repo) => {
                Ok(Self::new(owner, repo))
            }
            _ => Err(JobSpecError::InvalidRepository(s.to_string())),
        }
    }
}

/// Key of a single repository analysis inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSpec {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub nwo: NameWithOwner,
}

impl JobSpec {
    pub fn new(session_id: SessionId, nwo: NameWithOwner) -> Self {
        Self { session_id, nwo }
    }

    /// Encodes this spec as an opaque, URL-safe download token.
    pub fn to_token(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE.encode(json))
    }

    /// Decodes a token produced by [`JobSpec::to_token`].
    ///
    /// # Errors
    ///
    /// Returns `JobSpecError::InvalidToken` if the token is not valid
    /// base64 or does not contain a job spec.
    pub fn from_token(token: &str) -> Result<Self, JobSpecError> {
        let bytes = URL_SAFE
            .decode(token)
            .map_err(|e| JobSpecError::InvalidToken(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| JobSpecError::InvalidToken(e.to_string()))
    }
}

impl fmt::Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.nwo)
    }
}

/// Status of a job.
///
/// `Queued` and `InProgress` are transient; `Succeeded` and `Failed` are
/// terminal and never change once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Queued,
    Succeeded,
    #[serde(alias = "error")]
    Failed,
}

impl JobStatus {
    /// Returns true if the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// The external string form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in_progress",
            JobStatus::Queued => "queued",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(JobStatus::InProgress),
            "queued" => Ok(JobStatus::Queued),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" | "error" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A unit of work dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeJob {
    pub spec: JobSpec,
    /// Where the session's query pack archive is stored.
    pub query_pack: ArtifactLocation,
    pub query_language: String,
}

impl AnalyzeJob {
    pub fn new(spec: JobSpec, query_pack: ArtifactLocation, query_language: impl Into<String>) -> Self {
        Self {
            spec,
            query_pack,
            query_language: query_language.into(),
        }
    }
}

/// Outcome of one `AnalyzeJob`.
///
/// Created once by a worker; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub result_count: u64,
    /// Location of the result archive; present only on success.
    #[serde(default)]
    pub result_location: Option<ArtifactLocation>,
    #[serde(default)]
    pub source_location_prefix: String,
    #[serde(default)]
    pub database_sha: String,
    /// Failure message, present only on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalyzeResult {
    /// Creates a successful result.
    pub fn success(
        spec: JobSpec,
        result_count: u64,
        result_location: ArtifactLocation,
        source_location_prefix: impl Into<String>,
        database_sha: impl Into<String>,
    ) -> Self {
        Self {
            spec,
            status: JobStatus::Succeeded,
            result_count,
            result_location: Some(result_location),
            source_location_prefix: source_location_prefix.into(),
            database_sha: database_sha.into(),
            error: None,
        }
    }

    /// Creates a failed result carrying the reason.
    pub fn failure(spec: JobSpec, error: impl Into<String>) -> Self {
        Self {
            spec,
            status: JobStatus::Failed,
            result_count: 0,
            result_location: None,
            source_location_prefix: String::new(),
            database_sha: String::new(),
            error: Some(error.into()),
        }
    }

    /// Returns true if the job succeeded.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Repository count plus names, as reported for skipped repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryList {
    pub repository_count: usize,
    pub repository_full_names: Vec<String>,
}

impl RepositoryList {
    pub fn from_names(names: Vec<String>) -> Self {
        Self {
            repository_count: names.len(),
            repository_full_names: names,
        }
    }
}

/// Repositories that were requested but not analyzed, grouped by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRepositories {
    pub access_mismatch_repos: RepositoryList,
    pub not_found_repos: RepositoryList,
    pub no_codeql_db_repos: RepositoryList,
    pub over_limit_repos: RepositoryList,
}

impl SkippedRepositories {
    /// Builds the skipped list for repositories that had no database.
    pub fn not_found(repos: &[NameWithOwner]) -> Self {
        Self {
            not_found_repos: RepositoryList::from_names(
                repos.iter().map(ToString::to_string).collect(),
            ),
            ..Default::default()
        }
    }
}

/// Session metadata recorded for every job of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub query_language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub skipped_repositories: SkippedRepositories,
}
