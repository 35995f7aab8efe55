//! Analysis runner that shells out to the CodeQL CLI.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use super::archive::{pack_tar_gz, unpack_tar_gz};
use super::{AnalysisRunner, RunOutput, RunnerError};

/// Name of the SARIF file inside the result archive.
pub const RESULTS_FILE: &str = "results.sarif";

/// Runner invoking `codeql` subcommands in a scratch directory per run.
#[derive(Debug, Clone)]
pub struct CodeqlRunner {
    cli_path: PathBuf,
    ram_mb: Option<u64>,
    threads: Option<u32>,
}

impl CodeqlRunner {
    /// Creates a runner for the CLI at `cli_path`.
    pub fn new(cli_path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            ram_mb: None,
            threads: None,
        }
    }

    /// Caps the memory `database analyze` may use.
    pub fn with_ram_mb(mut self, ram_mb: u64) -> Self {
        self.ram_mb = Some(ram_mb);
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    /// Runs the CLI and returns its stdout.
    async fn invoke(&self, args: Vec<OsString>) -> Result<Vec<u8>, RunnerError> {
        let command = describe(&args);
        debug!(command = %command, "Invoking codeql");

        let output = Command::new(&self.cli_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunnerError::ToolInvocationFailed {
                command: command.clone(),
                message: format!("could not start {}: {}", self.cli_path.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::ToolInvocationFailed {
                command,
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(output.stdout)
    }

    async fn unbundle(&self, bundle: &Path, target: &Path) -> Result<PathBuf, RunnerError> {
        self.invoke(vec![
            "database".into(),
            "unbundle".into(),
            bundle.into(),
            flag("--target=", target),
            "--name=db".into(),
        ])
        .await?;
        Ok(target.join("db"))
    }

    async fn analyze(
        &self,
        database: &Path,
        query_pack: &Path,
        output: &Path,
    ) -> Result<(), RunnerError> {
        let mut args: Vec<OsString> = vec![
            "database".into(),
            "analyze".into(),
            "--format=sarif-latest".into(),
            flag("--output=", output),
            flag("--additional-packs=", query_pack),
        ];
        if let Some(ram) = self.ram_mb {
            args.push(format!("--ram={}", ram).into());
        }
        if let Some(threads) = self.threads {
            args.push(format!("--threads={}", threads).into());
        }
        args.push("--".into());
        args.push(database.into());
        args.push(query_pack.into());

        self.invoke(args).await.map(|_| ())
    }

    async fn source_location_prefix(&self, database: &Path) -> Result<String, RunnerError> {
        let stdout = self
            .invoke(vec![
                "resolve".into(),
                "database".into(),
                "--format=json".into(),
                "--".into(),
                database.into(),
            ])
            .await?;
        parse_source_location_prefix(&stdout)
    }
}

#[async_trait]
impl AnalysisRunner for CodeqlRunner {
    async fn run(
        &self,
        database: &[u8],
        query_pack: &Path,
        language: &str,
    ) -> Result<RunOutput, RunnerError> {
        let started = Instant::now();
        let scratch = tempfile::Builder::new().prefix("mrva-run-").tempdir()?;

        let pack_dir = scratch.path().join("pack");
        let pack_archive = query_pack.to_path_buf();
        let unpack_to = pack_dir.clone();
        tokio::task::spawn_blocking(move || unpack_tar_gz(&pack_archive, &unpack_to))
            .await
            .map_err(|e| RunnerError::InvalidArchive(e.to_string()))?
            .map_err(|e| RunnerError::InvalidArchive(format!("query pack: {}", e)))?;

        let bundle = scratch.path().join("database.zip");
        fs::write(&bundle, database).await?;
        let db_dir = self.unbundle(&bundle, scratch.path()).await?;
        let database_sha = read_database_sha(&db_dir).await?;

        let sarif_path = scratch.path().join(RESULTS_FILE);
        self.analyze(&db_dir, &pack_dir, &sarif_path).await?;

        let source_location_prefix = self.source_location_prefix(&db_dir).await?;
        let sarif = fs::read(&sarif_path).await?;
        let result_count = count_sarif_results(&sarif)?;

        let archive = tokio::task::spawn_blocking(move || {
            pack_tar_gz(&[(RESULTS_FILE, sarif_path.as_path())])
        })
        .await
        .map_err(|e| RunnerError::Io(std::io::Error::other(e.to_string())))??;

        info!(
            language = language,
            result_count = result_count,
            duration_ms = started.elapsed().as_millis() as u64,
            "Analysis finished"
        );

        Ok(RunOutput {
            result_count,
            archive,
            source_location_prefix,
            database_sha,
        })
    }
}

fn flag(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

fn describe(args: &[OsString]) -> String {
    let words: Vec<_> = args
        .iter()
        .take_while(|a| !a.to_string_lossy().starts_with('-'))
        .map(|a| a.to_string_lossy().into_owned())
        .take(2)
        .collect();
    format!("codeql {}", words.join(" "))
}

#[derive(Debug, Deserialize)]
struct DatabaseMetadata {
    #[serde(rename = "creationMetadata", default)]
    creation_metadata: Option<CreationMetadata>,
}

#[derive(Debug, Deserialize)]
struct CreationMetadata {
    #[serde(default)]
    sha: Option<String>,
}

/// Extracts the source revision from `codeql-database.yml` contents.
///
/// Databases built without revision information yield an empty string.
fn parse_database_sha(yaml: &str) -> Result<String, RunnerError> {
    let meta: DatabaseMetadata = serde_yaml::from_str(yaml)
        .map_err(|e| RunnerError::UnsupportedOutputFormat(format!("codeql-database.yml: {}", e)))?;
    Ok(meta
        .creation_metadata
        .and_then(|m| m.sha)
        .unwrap_or_default())
}

async fn read_database_sha(db_dir: &Path) -> Result<String, RunnerError> {
    let yaml = fs::read_to_string(db_dir.join("codeql-database.yml")).await?;
    parse_database_sha(&yaml)
}

fn parse_source_location_prefix(json: &[u8]) -> Result<String, RunnerError> {
    #[derive(Deserialize)]
    struct Resolved {
        #[serde(rename = "sourceLocationPrefix")]
        source_location_prefix: String,
    }

    serde_json::from_slice::<Resolved>(json)
        .map(|r| r.source_location_prefix)
        .map_err(|e| RunnerError::UnsupportedOutputFormat(format!("resolve database: {}", e)))
}

/// Counts results across all runs of a SARIF log.
fn count_sarif_results(sarif: &[u8]) -> Result<u64, RunnerError> {
    let value: serde_json::Value = serde_json::from_slice(sarif)
        .map_err(|e| RunnerError::UnsupportedOutputFormat(format!("SARIF: {}", e)))?;
    let runs = value
        .get("runs")
        .and_then(|r| r.as_array())
        .ok_or_else(|| RunnerError::UnsupportedOutputFormat("SARIF without runs".to_string()))?;

    Ok(runs
        .iter()
        .filter_map(|run| run.get("results").and_then(|r| r.as_array()))
        .map(|results| results.len() as u64)
        .sum())
}
