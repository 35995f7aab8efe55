//! Request and response bodies of the variant-analysis protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::job::{NameWithOwner, SessionId, SkippedRepositories};

/// Body of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    /// Base64 of the gzip-compressed query pack tarball.
    #[serde(alias = "queryPack")]
    pub query_pack: String,
    pub language: String,
    /// `owner/repo` entries.
    pub repositories: Vec<String>,
}

/// Acknowledgement of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: SessionId,
    pub query_language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub skipped_repositories: SkippedRepositories,
}

/// Repository as shown in status and download responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Index of the repository within its session.
    pub id: i64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub stargazers_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(id: i64, nwo: &NameWithOwner, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: nwo.repo.clone(),
            full_name: nwo.to_string(),
            private: false,
            stargazers_count: 0,
            updated_at,
        }
    }
}

/// Per-repository line of a status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedRepo {
    pub repository: Repository,
    pub analysis_status: String,
    pub result_count: u64,
    #[serde(rename = "artifact_size_in_bytes")]
    pub artifact_size_bytes: u64,
}

/// Progress of a whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: SessionId,
    pub query_language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub scanned_repositories: Vec<ScannedRepo>,
    pub skipped_repositories: SkippedRepositories,
}

/// Repository as shown in a download response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRepo {
    pub name: String,
    pub full_name: String,
}

/// Where and what to download for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub repository: DownloadRepo,
    pub analysis_status: String,
    pub result_count: u64,
    #[serde(rename = "artifact_size_in_bytes")]
    pub artifact_size_bytes: u64,
    pub database_commit_sha: String,
    pub source_location_prefix: String,
    /// Empty until the job succeeded.
    pub artifact_url: String,
}
