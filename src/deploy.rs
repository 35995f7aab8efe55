//! Backend selection.
//!
//! Turns a [`Config`] into the trait objects the commander and the worker
//! pool are built from. This is the only place that looks at which backend
//! is configured.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ArtifactBackend, Config, DatabaseBackend, QueueBackend, StateBackend};
use crate::locator::{BucketLocator, DatabaseLocator, FilesystemLocator};
use crate::runner::{AnalysisRunner, CodeqlRunner};
use crate::scheduler::queue::{
    JobQueue, MemoryQueue, QueueError, QueueRole, RedisQueueConfig, RedisStreamQueue,
};
use crate::state::{MemoryState, PostgresState, ServerState, StateError};
use crate::storage::{
    ArtifactError, ArtifactStore, FilesystemArtifactStore, MemoryArtifactStore, S3ArtifactStore,
    S3Client, S3Config,
};

/// Errors that can occur while connecting backends.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("State setup failed: {0}")]
    State(#[from] StateError),

    #[error("Artifact store setup failed: {0}")]
    Artifact(#[from] ArtifactError),

    /// The configuration lacks a value the selected backend needs.
    #[error("Missing configuration: {0}")]
    Missing(&'static str),
}

/// Connects the configured queue for `role`.
///
/// The in-process queue only connects components living in the same process.
pub async fn queue(config: &Config, role: QueueRole) -> Result<Arc<dyn JobQueue>, DeployError> {
    match config.queue_backend {
        QueueBackend::Memory => {
            info!("Using in-process queue");
            Ok(Arc::new(MemoryQueue::default()))
        }
        QueueBackend::Redis => {
            let queue_config = RedisQueueConfig::new(&config.redis_url)
                .with_consumer(&config.queue_consumer);
            let queue = RedisStreamQueue::connect(queue_config, role).await?;
            info!(role = ?role, "Connected to Redis streams");
            Ok(Arc::new(queue))
        }
    }
}

/// Opens the configured server state.
pub async fn state(config: &Config) -> Result<Arc<dyn ServerState>, DeployError> {
    match config.state_backend {
        StateBackend::Memory => Ok(Arc::new(MemoryState::new(config.starting_id))),
        StateBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(DeployError::Missing("DATABASE_URL"))?;
            Ok(Arc::new(PostgresState::connect(url, config.starting_id).await?))
        }
    }
}

/// Builds a client for the object storage service.
pub fn s3_client(config: &Config) -> Result<Arc<S3Client>, DeployError> {
    let endpoint = config
        .s3_endpoint
        .as_deref()
        .ok_or(DeployError::Missing("MRVA_S3_ENDPOINT"))?;
    let access_key = config
        .s3_access_key
        .as_deref()
        .ok_or(DeployError::Missing("MRVA_S3_ACCESS_KEY"))?;
    let secret_key = config
        .s3_secret_key
        .as_deref()
        .ok_or(DeployError::Missing("MRVA_S3_SECRET_KEY"))?;

    let s3 = S3Config::new(endpoint, access_key, secret_key).with_region(&config.s3_region);
    Ok(Arc::new(S3Client::new(s3)?))
}

/// Opens the configured artifact store.
pub async fn artifacts(config: &Config) -> Result<Arc<dyn ArtifactStore>, DeployError> {
    match config.artifact_backend {
        ArtifactBackend::Memory => Ok(Arc::new(MemoryArtifactStore::new())),
        ArtifactBackend::Filesystem => {
            info!(root = %config.artifact_root.display(), "Using filesystem artifact store");
            Ok(Arc::new(FilesystemArtifactStore::new(&config.artifact_root)))
        }
        ArtifactBackend::S3 => Ok(Arc::new(S3ArtifactStore::connect(s3_client(config)?).await?)),
    }
}

/// Builds the configured database locator.
pub fn databases(config: &Config) -> Result<Arc<dyn DatabaseLocator>, DeployError> {
    match config.db_backend {
        DatabaseBackend::Filesystem => {
            if !config.db_root.is_dir() {
                warn!(root = %config.db_root.display(), "Database root does not exist");
            }
            Ok(Arc::new(FilesystemLocator::new(&config.db_root)))
        }
        DatabaseBackend::S3 => Ok(Arc::new(BucketLocator::new(
            s3_client(config)?,
            &config.db_bucket,
        ))),
    }
}

/// Builds the analysis runner.
pub fn runner(config: &Config) -> Arc<dyn AnalysisRunner> {
    let mut runner = CodeqlRunner::new(&config.codeql_cli_path);
    if config.worker_memory_mb > 0 {
        runner = runner.with_ram_mb(config.worker_memory_mb);
    }
    Arc::new(runner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobSpec, NameWithOwner};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_backends_are_in_memory() {
        let config = Config::default();
        let state = state(&config).await.unwrap();
        assert_eq!(state.next_id().await.unwrap(), 1);

        let artifacts = artifacts(&config).await.unwrap();
        let location = artifacts.save_query_pack(1, b"qp").await.unwrap();
        assert_eq!(artifacts.get_query_pack(&location).await.unwrap(), b"qp");

        queue(&config, QueueRole::Server).await.unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_backends() {
        let dir = TempDir::new().unwrap();
        let config = Config::new()
            .with_artifact_backend(ArtifactBackend::Filesystem)
            .with_artifact_root(dir.path().join("artifacts"))
            .with_db_root(dir.path().join("dbs"));

        let artifacts = artifacts(&config).await.unwrap();
        let spec = JobSpec::new(4, NameWithOwner::new("octo", "cat"));
        let location = artifacts.save_result(&spec, b"tgz").await.unwrap();
        assert_eq!(artifacts.get_result_size(&location).await.unwrap(), 3);

        let locator = databases(&config).unwrap();
        assert!(locator
            .locate(&NameWithOwner::new("octo", "cat"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_s3_requires_endpoint() {
        let config = Config::new().with_db_backend(DatabaseBackend::S3);
        assert!(matches!(
            databases(&config),
            Err(DeployError::Missing("MRVA_S3_ENDPOINT"))
        ));
    }

    #[tokio::test]
    async fn test_postgres_requires_url() {
        let config = Config::new().with_state_backend(StateBackend::Postgres);
        assert!(matches!(
            state(&config).await,
            Err(DeployError::Missing("DATABASE_URL"))
        ));
    }
}
