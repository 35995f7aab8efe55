//! PostgreSQL server state.
//!
//! Job lists, statuses, results and job metadata are stored as one row per
//! job spec. Structured values (jobs, results, job info) are stored as JSONB.
//! Status is a plain text column so the monotonic transition rule can be
//! enforced inside the upsert itself.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use super::migrations::MigrationRunner;
use super::{check_transition, Completion, ServerState, StateError};
use crate::scheduler::job::{AnalyzeJob, AnalyzeResult, JobInfo, JobSpec, JobStatus, SessionId};

/// Server state backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresState {
    pool: PgPool,
}

impl PostgresState {
    /// Connects, applies migrations and seeds the session id sequence.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `starting_id` - lowest session id to hand out on a fresh database
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the database is unreachable or the schema
    /// cannot be applied.
    pub async fn connect(database_url: &str, starting_id: SessionId) -> Result<Self, StateError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        let state = Self::from_pool(pool);
        state.run_migrations(starting_id).await?;
        info!(starting_id = starting_id, "Connected to PostgreSQL state");
        Ok(state)
    }

    /// Wraps an existing pool without touching the schema.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema and seeds the session id sequence.
    pub async fn run_migrations(&self, starting_id: SessionId) -> Result<(), StateError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        runner.seed_session_ids(starting_id).await?;
        Ok(())
    }

    async fn session_exists(&self, session_id: SessionId) -> Result<bool, StateError> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM sessions WHERE id = $1)")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn upsert_json(
        &self,
        table: &str,
        column: &str,
        spec: &JobSpec,
        value: serde_json::Value,
    ) -> Result<(), StateError> {
        let sql = format!(
            "INSERT INTO {table} (session_id, owner, repo, {column}) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (session_id, owner, repo) DO UPDATE SET {column} = EXCLUDED.{column}"
        );
        sqlx::query(&sql)
            .bind(spec.session_id)
            .bind(&spec.nwo.owner)
            .bind(&spec.nwo.repo)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        spec: &JobSpec,
    ) -> Result<Option<T>, StateError> {
        let sql = format!(
            "SELECT {column} FROM {table} WHERE session_id = $1 AND owner = $2 AND repo = $3"
        );
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&sql)
            .bind(spec.session_id)
            .bind(&spec.nwo.owner)
            .bind(&spec.nwo.repo)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(value,)| serde_json::from_value(value))
            .transpose()
            .map_err(StateError::from)
    }
}

#[async_trait]
impl ServerState for PostgresState {
    async fn next_id(&self) -> Result<SessionId, StateError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO sessions (id) VALUES (nextval('session_id_seq')) RETURNING id",
        )
        .fetch_one(&self.pool)
        .await?;
        debug!(session_id = id, "Allocated session id");
        Ok(id)
    }

    async fn add_job(&self, job: &AnalyzeJob) -> Result<i64, StateError> {
        let spec = &job.spec;
        let payload = serde_json::to_value(job)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO sessions (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(spec.session_id)
            .execute(&mut *tx)
            .await?;

        // Serializes concurrent appends to the same session.
        sqlx::query("SELECT id FROM sessions WHERE id = $1 FOR UPDATE")
            .bind(spec.session_id)
            .execute(&mut *tx)
            .await?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM session_jobs WHERE session_id = $1")
                .bind(spec.session_id)
                .fetch_one(&mut *tx)
                .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO session_jobs (session_id, owner, repo, repo_index, job)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, owner, repo) DO NOTHING
            "#,
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .bind(count)
        .bind(payload)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Err(StateError::DuplicateJob(spec.clone()));
        }

        tx.commit().await?;
        Ok(count)
    }

    async fn get_job_list(&self, session_id: SessionId) -> Result<Vec<AnalyzeJob>, StateError> {
        if !self.session_exists(session_id).await? {
            return Err(StateError::UnknownSession(session_id));
        }

        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT job FROM session_jobs WHERE session_id = $1 ORDER BY repo_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(value,)| serde_json::from_value(value).map_err(StateError::from))
            .collect()
    }

    async fn set_status(&self, spec: &JobSpec, status: JobStatus) -> Result<(), StateError> {
        let applied = sqlx::query(
            r#"
            INSERT INTO job_status (session_id, owner, repo, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id, owner, repo) DO UPDATE
                SET status = EXCLUDED.status, updated_at = NOW()
                WHERE job_status.status NOT IN ('succeeded', 'failed', 'error')
            "#,
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if applied == 0 {
            let current = self.get_status(spec).await?;
            check_transition(spec, Some(current), status)?;
        }
        Ok(())
    }

    async fn get_status(&self, spec: &JobSpec) -> Result<JobStatus, StateError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM job_status WHERE session_id = $1 AND owner = $2 AND repo = $3",
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status,)) => status.parse().map_err(StateError::Corrupt),
            None => Err(StateError::StatusNotFound(spec.clone())),
        }
    }

    async fn set_result(&self, spec: &JobSpec, result: &AnalyzeResult) -> Result<(), StateError> {
        self.upsert_json("job_results", "result", spec, serde_json::to_value(result)?)
            .await
    }

    async fn get_result(&self, spec: &JobSpec) -> Result<AnalyzeResult, StateError> {
        self.fetch_json("job_results", "result", spec)
            .await?
            .ok_or_else(|| StateError::ResultNotFound(spec.clone()))
    }

    async fn complete_job(&self, result: &AnalyzeResult) -> Result<Completion, StateError> {
        let spec = &result.spec;
        let payload = serde_json::to_value(result)?;
        let mut tx = self.pool.begin().await?;

        // Row lock orders concurrent completions of the same job.
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM job_status \
             WHERE session_id = $1 AND owner = $2 AND repo = $3 FOR UPDATE",
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .fetch_optional(&mut *tx)
        .await?;

        let current: JobStatus = match row {
            Some((status,)) => status.parse().map_err(StateError::Corrupt)?,
            None => {
                tx.rollback().await?;
                return Err(StateError::StatusNotFound(spec.clone()));
            }
        };
        if current.is_terminal() {
            tx.rollback().await?;
            return Ok(Completion::AlreadyFinished(current));
        }

        sqlx::query(
            r#"
            INSERT INTO job_results (session_id, owner, repo, result)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id, owner, repo) DO UPDATE SET result = EXCLUDED.result
            "#,
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE job_status SET status = $4, updated_at = NOW() \
             WHERE session_id = $1 AND owner = $2 AND repo = $3",
        )
        .bind(spec.session_id)
        .bind(&spec.nwo.owner)
        .bind(&spec.nwo.repo)
        .bind(result.status.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job = %spec, status = %result.status, "Completed job");
        Ok(Completion::Applied)
    }

    async fn set_job_info(&self, spec: &JobSpec, info: &JobInfo) -> Result<(), StateError> {
        self.upsert_json("job_info", "info", spec, serde_json::to_value(info)?)
            .await
    }

    async fn get_job_info(&self, spec: &JobSpec) -> Result<JobInfo, StateError> {
        self.fetch_json("job_info", "info", spec)
            .await?
            .ok_or_else(|| StateError::JobInfoNotFound(spec.clone()))
    }

    async fn get_job_spec_by_repo_id(
        &self,
        session_id: SessionId,
        repo_id: i64,
    ) -> Result<JobSpec, StateError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT job FROM session_jobs WHERE session_id = $1 AND repo_index = $2",
        )
        .bind(session_id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((value,)) => {
                let job: AnalyzeJob = serde_json::from_value(value)?;
                Ok(job.spec)
            }
            None if !self.session_exists(session_id).await? => {
                Err(StateError::UnknownSession(session_id))
            }
            None => Err(StateError::RepoIdNotFound {
                session_id,
                repo_id,
            }),
        }
    }
}
