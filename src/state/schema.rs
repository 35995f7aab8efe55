//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! state backend.

/// Sequence backing session id allocation.
pub const CREATE_SESSION_ID_SEQUENCE: &str = r#"
CREATE SEQUENCE IF NOT EXISTS session_id_seq START WITH 1 INCREMENT BY 1
"#;

/// One row per allocated session.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id BIGINT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// The job list of every session; `repo_index` is the job's position.
pub const CREATE_SESSION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS session_jobs (
    session_id BIGINT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    repo_index BIGINT NOT NULL,
    job JSONB NOT NULL,
    PRIMARY KEY (session_id, owner, repo),
    UNIQUE (session_id, repo_index)
)
"#;

pub const CREATE_JOB_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_status (
    session_id BIGINT NOT NULL,
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (session_id, owner, repo)
)
"#;

pub const CREATE_JOB_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_results (
    session_id BIGINT NOT NULL,
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    result JSONB NOT NULL,
    PRIMARY KEY (session_id, owner, repo)
)
"#;

pub const CREATE_JOB_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_info (
    session_id BIGINT NOT NULL,
    owner TEXT NOT NULL,
    repo TEXT NOT NULL,
    info JSONB NOT NULL,
    PRIMARY KEY (session_id, owner, repo)
)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SESSION_ID_SEQUENCE,
        CREATE_SESSIONS_TABLE,
        CREATE_SESSION_JOBS_TABLE,
        CREATE_JOB_STATUS_TABLE,
        CREATE_JOB_RESULTS_TABLE,
        CREATE_JOB_INFO_TABLE,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const SESSIONS: &str = "sessions";
    pub const SESSION_JOBS: &str = "session_jobs";
    pub const JOB_STATUS: &str = "job_status";
    pub const JOB_RESULTS: &str = "job_results";
    pub const JOB_INFO: &str = "job_info";
}
