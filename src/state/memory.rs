//! In-memory server state.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{check_transition, Completion, ServerState, StateError};
use crate::scheduler::job::{AnalyzeJob, AnalyzeResult, JobInfo, JobSpec, JobStatus, SessionId};

#[derive(Debug, Default)]
struct Inner {
    last_id: SessionId,
    /// Job lists per session, in insertion order.
    jobs: HashMap<SessionId, Vec<AnalyzeJob>>,
    status: HashMap<JobSpec, JobStatus>,
    results: HashMap<JobSpec, AnalyzeResult>,
    info: HashMap<JobSpec, JobInfo>,
}

/// Server state held in process memory.
///
/// All maps sit behind one lock so the job list and the repository index
/// derived from it can never disagree.
#[derive(Debug)]
pub struct MemoryState {
    inner: Mutex<Inner>,
}

impl MemoryState {
    /// Creates an empty state whose first session id is `starting_id`.
    pub fn new(starting_id: SessionId) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_id: starting_id - 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ServerState for MemoryState {
    async fn next_id(&self) -> Result<SessionId, StateError> {
        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        let id = inner.last_id;
        inner.jobs.entry(id).or_default();
        Ok(id)
    }

    async fn add_job(&self, job: &AnalyzeJob) -> Result<i64, StateError> {
        let mut inner = self.inner.lock().await;
        let list = inner.jobs.entry(job.spec.session_id).or_default();
        if list.iter().any(|j| j.spec == job.spec) {
            return Err(StateError::DuplicateJob(job.spec.clone()));
        }
        list.push(job.clone());
        Ok((list.len() - 1) as i64)
    }

    async fn get_job_list(&self, session_id: SessionId) -> Result<Vec<AnalyzeJob>, StateError> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&session_id)
            .cloned()
            .ok_or(StateError::UnknownSession(session_id))
    }

    async fn set_status(&self, spec: &JobSpec, status: JobStatus) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let current = inner.status.get(spec).copied();
        if check_transition(spec, current, status)? {
            inner.status.insert(spec.clone(), status);
        }
        Ok(())
    }

    async fn get_status(&self, spec: &JobSpec) -> Result<JobStatus, StateError> {
        self.inner
            .lock()
            .await
            .status
            .get(spec)
            .copied()
            .ok_or_else(|| StateError::StatusNotFound(spec.clone()))
    }

    async fn set_result(&self, spec: &JobSpec, result: &AnalyzeResult) -> Result<(), StateError> {
        self.inner
            .lock()
            .await
            .results
            .insert(spec.clone(), result.clone());
        Ok(())
    }

    async fn get_result(&self, spec: &JobSpec) -> Result<AnalyzeResult, StateError> {
        self.inner
            .lock()
            .await
            .results
            .get(spec)
            .cloned()
            .ok_or_else(|| StateError::ResultNotFound(spec.clone()))
    }

    async fn complete_job(&self, result: &AnalyzeResult) -> Result<Completion, StateError> {
        let spec = &result.spec;
        let mut inner = self.inner.lock().await;
        let current = inner
            .status
            .get(spec)
            .copied()
            .ok_or_else(|| StateError::StatusNotFound(spec.clone()))?;
        if current.is_terminal() {
            return Ok(Completion::AlreadyFinished(current));
        }
        inner.results.insert(spec.clone(), result.clone());
        inner.status.insert(spec.clone(), result.status);
        Ok(Completion::Applied)
    }

    async fn set_job_info(&self, spec: &JobSpec, info: &JobInfo) -> Result<(), StateError> {
        self.inner
            .lock()
            .await
            .info
            .insert(spec.clone(), info.clone());
        Ok(())
    }

    async fn get_job_info(&self, spec: &JobSpec) -> Result<JobInfo, StateError> {
        self.inner
            .lock()
            .await
            .info
            .get(spec)
            .cloned()
            .ok_or_else(|| StateError::JobInfoNotFound(spec.clone()))
    }

    async fn get_job_spec_by_repo_id(
        &self,
        session_id: SessionId,
        repo_id: i64,
    ) -> Result<JobSpec, StateError> {
        let inner = self.inner.lock().await;
        let list = inner
            .jobs
            .get(&session_id)
            .ok_or(StateError::UnknownSession(session_id))?;
        usize::try_from(repo_id)
            .ok()
            .and_then(|idx| list.get(idx))
            .map(|job| job.spec.clone())
            .ok_or(StateError::RepoIdNotFound {
                session_id,
                repo_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{NameWithOwner, SkippedRepositories};
    use crate::storage::ArtifactLocation;
    use chrono::Utc;
    use std::sync::Arc;

    fn job(session_id: SessionId, owner: &str, repo: &str) -> AnalyzeJob {
        AnalyzeJob::new(
            JobSpec::new(session_id, NameWithOwner::new(owner, repo)),
            ArtifactLocation::query_pack(session_id),
            "cpp",
        )
    }

    #[tokio::test]
    async fn test_next_id_is_strictly_increasing() {
        let state = MemoryState::new(100);
        let a = state.next_id().await.unwrap();
        let b = state.next_id().await.unwrap();

        assert_eq!(a, 100);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_next_id_concurrent_callers_get_distinct_ids() {
        let state = Arc::new(MemoryState::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move { state.next_id().await.unwrap() }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_unknown_session_vs_empty_session() {
        let state = MemoryState::default();
        let id = state.next_id().await.unwrap();

        assert!(state.get_job_list(id).await.unwrap().is_empty());
        assert!(matches!(
            state.get_job_list(id + 1).await,
            Err(StateError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_add_job_assigns_repo_index() {
        let state = MemoryState::default();
        let id = state.next_id().await.unwrap();

        assert_eq!(state.add_job(&job(id, "a", "one")).await.unwrap(), 0);
        assert_eq!(state.add_job(&job(id, "a", "two")).await.unwrap(), 1);

        let list = state.get_job_list(id).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].spec.nwo.repo, "two");

        let spec = state.get_job_spec_by_repo_id(id, 1).await.unwrap();
        assert_eq!(spec, list[1].spec);
        assert!(matches!(
            state.get_job_spec_by_repo_id(id, 2).await,
            Err(StateError::RepoIdNotFound { .. })
        ));
        assert!(state.get_job_spec_by_repo_id(id, -1).await.is_err());
    }

    #[tokio::test]
    async fn test_add_job_rejects_duplicates() {
        let state = MemoryState::default();
        let id = state.next_id().await.unwrap();
        state.add_job(&job(id, "a", "b")).await.unwrap();

        assert!(matches!(
            state.add_job(&job(id, "a", "b")).await,
            Err(StateError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn test_status_is_monotonic() {
        let state = MemoryState::default();
        let spec = job(1, "a", "b").spec;

        assert!(matches!(
            state.get_status(&spec).await,
            Err(StateError::StatusNotFound(_))
        ));

        state.set_status(&spec, JobStatus::Queued).await.unwrap();
        state.set_status(&spec, JobStatus::Succeeded).await.unwrap();
        state.set_status(&spec, JobStatus::Succeeded).await.unwrap();

        assert!(state.set_status(&spec, JobStatus::Failed).await.is_err());
        assert_eq!(state.get_status(&spec).await.unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_result_and_info_roundtrip() {
        let state = MemoryState::default();
        let spec = job(1, "a", "b").spec;

        assert!(state.get_result(&spec).await.unwrap_err().is_not_found());
        assert!(state.get_job_info(&spec).await.unwrap_err().is_not_found());

        let result = AnalyzeResult::failure(spec.clone(), "boom");
        state.set_result(&spec, &result).await.unwrap();
        assert_eq!(state.get_result(&spec).await.unwrap(), result);

        let now = Utc::now();
        let info = JobInfo {
            query_language: "java".to_string(),
            created_at: now,
            updated_at: now,
            skipped_repositories: SkippedRepositories::default(),
        };
        state.set_job_info(&spec, &info).await.unwrap();
        assert_eq!(state.get_job_info(&spec).await.unwrap(), info);
    }

    #[tokio::test]
    async fn test_complete_job_writes_result_and_status_together() {
        let state = MemoryState::default();
        let spec = job(1, "a", "b").spec;

        let early = AnalyzeResult::failure(spec.clone(), "no status yet");
        assert!(matches!(
            state.complete_job(&early).await,
            Err(StateError::StatusNotFound(_))
        ));
        assert!(state.get_result(&spec).await.unwrap_err().is_not_found());

        state.set_status(&spec, JobStatus::InProgress).await.unwrap();
        let failed = AnalyzeResult::failure(spec.clone(), "boom");
        assert_eq!(state.complete_job(&failed).await.unwrap(), Completion::Applied);
        assert_eq!(state.get_status(&spec).await.unwrap(), JobStatus::Failed);
        assert_eq!(state.get_result(&spec).await.unwrap(), failed);

        let late = AnalyzeResult::failure(spec.clone(), "second delivery");
        assert_eq!(
            state.complete_job(&late).await.unwrap(),
            Completion::AlreadyFinished(JobStatus::Failed)
        );
        assert_eq!(state.get_result(&spec).await.unwrap(), failed);
    }
}
