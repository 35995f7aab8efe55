//! Artifact storage for query packs and result archives.
//!
//! The commander stores each session's query pack once and workers store one
//! result archive per job. Storage is addressed by an opaque
//! [`ArtifactLocation`] (bucket + key) whose value is fully determined by the
//! session id or job spec, so re-saving the same logical artifact always
//! lands in the same place.
//!
//! # Backends
//!
//! - **MemoryArtifactStore**: in-process map, for standalone mode and tests
//! - **FilesystemArtifactStore**: `{root}/{bucket}/{key}` with atomic renames
//! - **S3ArtifactStore**: S3-compatible object storage (MinIO), SigV4-signed

pub mod filesystem;
pub mod memory;
pub mod s3;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::{JobSpec, SessionId};

pub use filesystem::FilesystemArtifactStore;
pub use memory::MemoryArtifactStore;
pub use s3::{S3ArtifactStore, S3Client, S3Config};

/// Bucket holding uploaded query packs.
pub const PACKS_BUCKET: &str = "packs";

/// Bucket holding per-job result archives.
pub const RESULTS_BUCKET: &str = "results";

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// No artifact is stored at the location.
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactLocation),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport to the object store failed.
    #[error("Object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The object store answered with an unexpected status.
    #[error("Object store returned {status} for {operation}: {message}")]
    Remote {
        operation: String,
        status: u16,
        message: String,
    },

    /// The key does not name a file inside its bucket.
    #[error("Invalid artifact key: {0}")]
    InvalidKey(ArtifactLocation),

    /// Request signing or endpoint configuration failed.
    #[error("Object store configuration error: {0}")]
    Configuration(String),
}

/// Opaque pointer to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactLocation {
    bucket: String,
    key: String,
}

impl ArtifactLocation {
    pub(crate) fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Location of the query pack for a session.
    pub fn query_pack(session_id: SessionId) -> Self {
        Self::new(PACKS_BUCKET, format!("qp-{}.tgz", session_id))
    }

    /// Location of the result archive for a job.
    ///
    /// Session, owner and repository are separate path segments; none of
    /// them can contain `/`, so distinct jobs never share a key.
    pub fn result(spec: &JobSpec) -> Self {
        Self::new(
            RESULTS_BUCKET,
            format!(
                "{}/{}/{}.tgz",
                spec.session_id, spec.nwo.owner, spec.nwo.repo
            ),
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Blob store for query packs and result archives.
///
/// Implementations must be safe to share between the commander and all
/// workers of a process.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores the query pack of a session and returns its location.
    async fn save_query_pack(
        &self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError>;

    /// Reads a stored query pack.
    async fn get_query_pack(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError>;

    /// Stores the result archive of a job and returns its location.
    async fn save_result(&self, spec: &JobSpec, data: &[u8])
        -> Result<ArtifactLocation, ArtifactError>;

    /// Reads a stored result archive.
    async fn get_result(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError>;

    /// Returns the size in bytes of a stored result archive.
    async fn get_result_size(&self, location: &ArtifactLocation) -> Result<u64, ArtifactError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NameWithOwner;

    #[test]
    fn test_locations_are_deterministic() {
        let spec = JobSpec::new(12, NameWithOwner::new("octo", "cat"));

        assert_eq!(ArtifactLocation::query_pack(12).bucket(), PACKS_BUCKET);
        assert_eq!(ArtifactLocation::query_pack(12).key(), "qp-12.tgz");
        assert_eq!(ArtifactLocation::result(&spec).bucket(), RESULTS_BUCKET);
        assert_eq!(ArtifactLocation::result(&spec).key(), "12/octo/cat.tgz");
        assert_eq!(ArtifactLocation::result(&spec), ArtifactLocation::result(&spec));
    }

    #[test]
    fn test_result_keys_keep_owner_and_repo_apart() {
        let dashed_owner = JobSpec::new(1, NameWithOwner::new("octo-org", "cat"));
        let dashed_repo = JobSpec::new(1, NameWithOwner::new("octo", "org-cat"));

        assert_ne!(
            ArtifactLocation::result(&dashed_owner),
            ArtifactLocation::result(&dashed_repo)
        );
    }

    #[test]
    fn test_location_display() {
        assert_eq!(ArtifactLocation::query_pack(3).to_string(), "packs/qp-3.tgz");
    }

    #[test]
    fn test_artifact_error_display() {
        let err = ArtifactError::NotFound(ArtifactLocation::query_pack(1));
        assert!(err.to_string().contains("packs/qp-1.tgz"));

        let err = ArtifactError::Remote {
            operation: "PUT".to_string(),
            status: 503,
            message: "slow down".to_string(),
        };
        assert!(err.to_string().contains("503"));
    }
}
