//! External analysis runner.
//!
//! A runner takes one repository's database bundle and a query pack and
//! produces a result archive plus the metadata the commander reports back
//! to clients.
//!
//! # Architecture
//!
//! ```text
//! query pack (tgz) ─┐
//!                   ├─> CodeqlRunner ──> results.sarif ──> result archive (tgz)
//! database (zip) ───┘        │
//!                            └─> result count, source prefix, database sha
//! ```

pub mod archive;
pub mod codeql;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use codeql::CodeqlRunner;

/// Errors that can occur while running an analysis.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The external tool could not be started or exited unsuccessfully.
    #[error("{command} failed: {message}")]
    ToolInvocationFailed { command: String, message: String },

    /// The tool produced output this runner cannot interpret.
    #[error("Unsupported output format: {0}")]
    UnsupportedOutputFormat(String),

    /// An input archive could not be unpacked.
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a successful analysis produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub result_count: u64,
    /// Gzip-compressed tarball of the raw results.
    pub archive: Vec<u8>,
    pub source_location_prefix: String,
    pub database_sha: String,
}

/// Runs one analysis of a query pack against one database.
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    /// # Arguments
    ///
    /// * `database` - database bundle bytes as returned by the locator
    /// * `query_pack` - path of the gzip-compressed query pack tarball
    /// * `language` - query language of the session
    async fn run(
        &self,
        database: &[u8],
        query_pack: &Path,
        language: &str,
    ) -> Result<RunOutput, RunnerError>;
}
