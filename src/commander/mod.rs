//! Orchestration of variant-analysis sessions.
//!
//! The [`Commander`] accepts submissions, fans each one out into one job per
//! repository that has a database, serves session status and download
//! information, and applies the results workers send back.
//!
//! # Submission order
//!
//! ```text
//! validate pack + repos ─> next_id ─> save query pack ─> find databases
//!        │                                                   │
//!        └─ 400 before any write          for each found repo:
//!                                         add_job ─> Queued ─> job info ─> publish
//! ```
//!
//! Fan-out is not transactional: a crash or an unconfirmed publish in the
//! middle leaves the remaining jobs `Queued` with no retry.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CommanderError;
use crate::locator::DatabaseLocator;
use crate::metrics;
use crate::runner::archive::is_gzip;
use crate::scheduler::job::{
    AnalyzeJob, AnalyzeResult, JobInfo, JobSpec, JobStatus, NameWithOwner, SessionId,
    SkippedRepositories,
};
use crate::scheduler::queue::JobQueue;
use crate::state::{Completion, ServerState};
use crate::storage::ArtifactStore;

pub use api::{
    DownloadRepo, DownloadResponse, Repository, ScannedRepo, StatusResponse, SubmitRequest,
    SubmitResponse,
};

/// Default base URL put in front of download links.
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";

/// Applying one result for longer than this is logged as slow.
pub const SLOW_APPLY_AFTER: Duration = Duration::from_secs(30);

/// The archive bytes of one finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub spec: JobSpec,
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// File name offered to clients.
    pub fn file_name(&self) -> String {
        format!("{}-{}.tgz", self.spec.nwo.owner, self.spec.nwo.repo)
    }
}

/// Ties queue, state, artifact store and database locator together.
pub struct Commander {
    queue: Arc<dyn JobQueue>,
    state: Arc<dyn ServerState>,
    artifacts: Arc<dyn ArtifactStore>,
    databases: Arc<dyn DatabaseLocator>,
    public_url: String,
    slow_apply_after: Duration,
}

impl Commander {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        state: Arc<dyn ServerState>,
        artifacts: Arc<dyn ArtifactStore>,
        databases: Arc<dyn DatabaseLocator>,
    ) -> Self {
        Self {
            queue,
            state,
            artifacts,
            databases,
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            slow_apply_after: SLOW_APPLY_AFTER,
        }
    }

    /// Sets the base URL of download links.
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_slow_apply_after(mut self, after: Duration) -> Self {
        self.slow_apply_after = after;
        self
    }

    /// Accepts a submission and fans it out into jobs.
    ///
    /// # Errors
    ///
    /// Returns `CommanderError::Validation` before anything is written if the
    /// query pack is not base64-encoded gzip or a repository entry is not
    /// `owner/repo`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, CommanderError> {
        let pack = decode_query_pack(&request.query_pack)?;
        let repositories = request
            .repositories
            .iter()
            .map(|entry| entry.parse::<NameWithOwner>())
            .collect::<Result<Vec<_>, _>>()?;
        if request.language.trim().is_empty() {
            return Err(CommanderError::Validation(
                "language cannot be empty".to_string(),
            ));
        }

        let session_id = self.state.next_id().await?;
        info!(
            session_id = session_id,
            language = %request.language,
            repositories = repositories.len(),
            "New session"
        );

        let pack_location = self.artifacts.save_query_pack(session_id, &pack).await?;
        let availability = self.databases.find_available(&repositories).await?;

        let now = Utc::now();
        let info = JobInfo {
            query_language: request.language.clone(),
            created_at: now,
            updated_at: now,
            skipped_repositories: SkippedRepositories::not_found(&availability.not_found),
        };

        let mut seen = Vec::with_capacity(availability.found.len());
        for nwo in repositories
            .iter()
            .filter(|nwo| availability.found.contains_key(*nwo))
        {
            if seen.contains(nwo) {
                continue;
            }
            seen.push(nwo.clone());

            let spec = JobSpec::new(session_id, nwo.clone());
            let job = AnalyzeJob::new(spec.clone(), pack_location.clone(), &request.language);

            self.state.add_job(&job).await?;
            self.state.set_status(&spec, JobStatus::Queued).await?;
            self.state.set_job_info(&spec, &info).await?;

            match self.queue.publish_job(&job).await {
                Ok(()) => metrics::record_job_enqueued(),
                Err(e) => error!(job = %spec, error = %e, "Failed to enqueue job"),
            }
        }

        info!(
            session_id = session_id,
            enqueued = seen.len(),
            not_found = availability.not_found.len(),
            "Session fanned out"
        );

        Ok(SubmitResponse {
            id: session_id,
            query_language: request.language,
            created_at: now,
            updated_at: now,
            status: JobStatus::InProgress.to_string(),
            skipped_repositories: info.skipped_repositories,
        })
    }

    /// Reports the progress of every job in a session.
    ///
    /// # Errors
    ///
    /// `UnknownSession` for ids never allocated, `SessionEmpty` for sessions
    /// without jobs.
    pub async fn status(&self, session_id: SessionId) -> Result<StatusResponse, CommanderError> {
        let jobs = self.state.get_job_list(session_id).await?;
        let first = jobs
            .first()
            .ok_or(CommanderError::SessionEmpty(session_id))?;
        let info = self.state.get_job_info(&first.spec).await?;

        let mut statuses = Vec::with_capacity(jobs.len());
        let mut scanned = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            let status = self.state.get_status(&job.spec).await?;
            let (result_count, artifact_size_bytes) = match status {
                JobStatus::Succeeded => self.result_summary(&job.spec).await?,
                _ => (0, 0),
            };
            statuses.push(status);
            scanned.push(ScannedRepo {
                repository: Repository::new(index as i64, &job.spec.nwo, info.updated_at),
                analysis_status: status.to_string(),
                result_count,
                artifact_size_bytes,
            });
        }

        Ok(StatusResponse {
            id: session_id,
            query_language: info.query_language,
            created_at: info.created_at,
            updated_at: info.updated_at,
            status: session_status(&statuses).to_string(),
            scanned_repositories: scanned,
            skipped_repositories: info.skipped_repositories,
        })
    }

    async fn result_summary(&self, spec: &JobSpec) -> Result<(u64, u64), CommanderError> {
        let result = self.state.get_result(spec).await?;
        let size = match &result.result_location {
            Some(location) => self.artifacts.get_result_size(location).await?,
            None => 0,
        };
        Ok((result.result_count, size))
    }

    /// Describes the download of one job's result.
    pub async fn download(&self, spec: &JobSpec) -> Result<DownloadResponse, CommanderError> {
        let status = self.state.get_status(spec).await?;
        let repository = DownloadRepo {
            name: spec.nwo.repo.clone(),
            full_name: spec.nwo.to_string(),
        };

        if status != JobStatus::Succeeded {
            return Ok(DownloadResponse {
                repository,
                analysis_status: status.to_string(),
                result_count: 0,
                artifact_size_bytes: 0,
                database_commit_sha: String::new(),
                source_location_prefix: String::new(),
                artifact_url: String::new(),
            });
        }

        let result = self.state.get_result(spec).await?;
        let location = result
            .result_location
            .as_ref()
            .ok_or_else(|| CommanderError::NotFound(format!("result archive of {}", spec)))?;
        let size = self.artifacts.get_result_size(location).await?;

        Ok(DownloadResponse {
            repository,
            analysis_status: status.to_string(),
            result_count: result.result_count,
            artifact_size_bytes: size,
            database_commit_sha: result.database_sha,
            source_location_prefix: result.source_location_prefix,
            artifact_url: format!("{}/download-server/{}", self.public_url, spec.to_token()?),
        })
    }

    /// Same as [`Commander::download`], addressing the job by its index in
    /// the session.
    pub async fn download_by_repo_id(
        &self,
        session_id: SessionId,
        repo_id: i64,
    ) -> Result<DownloadResponse, CommanderError> {
        let spec = self
            .state
            .get_job_spec_by_repo_id(session_id, repo_id)
            .await?;
        self.download(&spec).await
    }

    /// Reads the archive a download token points at.
    pub async fn artifact(&self, token: &str) -> Result<Artifact, CommanderError> {
        let spec = JobSpec::from_token(token)?;
        let result = self.state.get_result(&spec).await?;
        let location = result
            .result_location
            .ok_or_else(|| CommanderError::NotFound(format!("result archive of {}", spec)))?;
        let bytes = self.artifacts.get_result(&location).await?;
        debug!(job = %spec, bytes = bytes.len(), "Serving result archive");
        Ok(Artifact { spec, bytes })
    }

    /// Records a worker's result.
    ///
    /// Result and status land in one state write. Returns `false` if the
    /// job already had a terminal status, in which case nothing is written.
    pub async fn apply_result(&self, result: &AnalyzeResult) -> Result<bool, CommanderError> {
        if !result.status.is_terminal() {
            return Err(CommanderError::Validation(format!(
                "result for {} carries non-terminal status {}",
                result.spec, result.status
            )));
        }

        if let Completion::AlreadyFinished(current) = self.state.complete_job(result).await? {
            if current == result.status {
                debug!(job = %result.spec, "Ignoring redelivered result");
            } else {
                warn!(
                    job = %result.spec,
                    current = %current,
                    received = %result.status,
                    "Ignoring conflicting result for finished job"
                );
            }
            return Ok(false);
        }
        metrics::record_result_applied(result.status.as_str());

        info!(
            job = %result.spec,
            status = %result.status,
            result_count = result.result_count,
            "Result applied"
        );
        Ok(true)
    }

    /// Spawns the loop draining the result stream until `shutdown` fires or
    /// the stream ends.
    pub fn spawn_result_consumer(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Result consumer started");
            loop {
                let result = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = self.queue.next_result() => result,
                };
                let Some(result) = result else {
                    info!("Result stream closed");
                    break;
                };

                // A slow write is reported, never abandoned halfway.
                let apply = self.apply_result(&result);
                tokio::pin!(apply);
                let applied = match tokio::time::timeout(self.slow_apply_after, &mut apply).await {
                    Ok(applied) => applied,
                    Err(_) => {
                        warn!(
                            job = %result.spec,
                            waited_ms = self.slow_apply_after.as_millis() as u64,
                            "Applying result is slow, still waiting"
                        );
                        apply.await
                    }
                };
                if let Err(e) = applied {
                    error!(job = %result.spec, error = %e, "Failed to apply result");
                }
            }
            info!("Result consumer stopped");
        })
    }
}

/// Decodes a submitted query pack and checks it is gzip data.
fn decode_query_pack(encoded: &str) -> Result<Vec<u8>, CommanderError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CommanderError::Validation(format!("query pack is not base64: {}", e)))?;
    if !is_gzip(&bytes) {
        return Err(CommanderError::Validation(
            "query pack is not a gzip archive".to_string(),
        ));
    }
    Ok(bytes)
}

/// Aggregate status shown for a whole session.
pub fn session_status(statuses: &[JobStatus]) -> JobStatus {
    if statuses.iter().any(|s| !s.is_terminal()) {
        JobStatus::InProgress
    } else if statuses.contains(&JobStatus::Succeeded) {
        JobStatus::Succeeded
    } else {
        JobStatus::Failed
    }
}
