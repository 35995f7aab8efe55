//! Process configuration.
//!
//! Selects the queue, state, artifact and database backends and carries their
//! connection parameters. Values come from defaults, then `MRVA_*` environment
//! variables, then CLI flags applied through the builder methods.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::commander::DEFAULT_PUBLIC_URL;
use crate::locator::bucket::DEFAULT_DATABASE_BUCKET;
use crate::scheduler::queue::default_consumer_name;
use crate::scheduler::sizing::DEFAULT_WORKER_MEMORY_MB;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

macro_rules! backend_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown backend '{}', expected one of: {}",
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

backend_enum! {
    /// Transport between commander and workers.
    QueueBackend { Memory => "memory", Redis => "redis" }
}

backend_enum! {
    /// Where session bookkeeping lives.
    StateBackend { Memory => "memory", Postgres => "postgres" }
}

backend_enum! {
    /// Where query packs and result archives are stored.
    ArtifactBackend { Memory => "memory", Filesystem => "filesystem", S3 => "s3" }
}

backend_enum! {
    /// Where pre-built analysis databases are looked up.
    DatabaseBackend { Filesystem => "filesystem", S3 => "s3" }
}

/// Configuration of a commander, agent or standalone process.
#[derive(Debug, Clone)]
pub struct Config {
    // Queue
    pub queue_backend: QueueBackend,
    pub redis_url: String,
    /// Consumer name within the Redis consumer group.
    pub queue_consumer: String,

    // State
    pub state_backend: StateBackend,
    /// PostgreSQL connection URL, required for the postgres backend.
    pub database_url: Option<String>,
    /// First session id handed out by a fresh state.
    pub starting_id: i64,

    // Artifacts
    pub artifact_backend: ArtifactBackend,
    pub artifact_root: PathBuf,

    // S3-compatible object storage
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_region: String,

    // Databases
    pub db_backend: DatabaseBackend,
    pub db_root: PathBuf,
    pub db_bucket: String,

    // Agent
    pub codeql_cli_path: PathBuf,
    /// Worker count; zero sizes the pool from host resources.
    pub num_workers: usize,
    pub worker_memory_mb: u64,

    // HTTP
    pub listen_addr: SocketAddr,
    /// Base URL clients reach the server on, used in download links.
    pub public_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            queue_consumer: default_consumer_name(),

            state_backend: StateBackend::Memory,
            database_url: None,
            starting_id: 1,

            artifact_backend: ArtifactBackend::Memory,
            artifact_root: PathBuf::from("./artifacts"),

            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_region: "us-east-1".to_string(),

            db_backend: DatabaseBackend::Filesystem,
            db_root: PathBuf::from("./databases"),
            db_bucket: DEFAULT_DATABASE_BUCKET.to_string(),

            codeql_cli_path: PathBuf::from("codeql"),
            num_workers: 0,
            worker_memory_mb: DEFAULT_WORKER_MEMORY_MB,

            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MRVA_QUEUE_BACKEND`: `memory` or `redis` (default: memory)
    /// - `MRVA_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `MRVA_QUEUE_CONSUMER`: consumer name in the stream group (default: `{hostname}-{pid}`)
    /// - `MRVA_STATE_BACKEND`: `memory` or `postgres` (default: memory)
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `MRVA_STARTING_ID`: first session id (default: 1)
    /// - `MRVA_ARTIFACT_BACKEND`: `memory`, `filesystem` or `s3` (default: memory)
    /// - `MRVA_ARTIFACT_ROOT`: filesystem store root (default: ./artifacts)
    /// - `MRVA_S3_ENDPOINT`, `MRVA_S3_ACCESS_KEY`, `MRVA_S3_SECRET_KEY`,
    ///   `MRVA_S3_REGION`: object storage access
    /// - `MRVA_DB_BACKEND`: `filesystem` or `s3` (default: filesystem)
    /// - `MRVA_DB_ROOT`: database directory (default: ./databases)
    /// - `MRVA_DB_BUCKET`: database bucket (default: qldb)
    /// - `CODEQL_CLI_PATH`: CodeQL CLI binary (default: codeql)
    /// - `MRVA_WORKERS`: worker count, 0 for elastic (default: 0)
    /// - `MRVA_WORKER_MEMORY_MB`: memory budget per worker (default: 2048)
    /// - `MRVA_LISTEN_ADDR`: HTTP listen address (default: 0.0.0.0:8080)
    /// - `MRVA_PUBLIC_URL`: base of download links (default: http://localhost:8080)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Queue settings
        if let Some(val) = lookup("MRVA_QUEUE_BACKEND") {
            config.queue_backend = parse_env_value(&val, "MRVA_QUEUE_BACKEND")?;
        }
        if let Some(val) = lookup("MRVA_REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = lookup("MRVA_QUEUE_CONSUMER") {
            config.queue_consumer = val;
        }

        // State settings
        if let Some(val) = lookup("MRVA_STATE_BACKEND") {
            config.state_backend = parse_env_value(&val, "MRVA_STATE_BACKEND")?;
        }
        config.database_url = lookup("DATABASE_URL");
        if let Some(val) = lookup("MRVA_STARTING_ID") {
            config.starting_id = parse_env_value(&val, "MRVA_STARTING_ID")?;
        }

        // Artifact settings
        if let Some(val) = lookup("MRVA_ARTIFACT_BACKEND") {
            config.artifact_backend = parse_env_value(&val, "MRVA_ARTIFACT_BACKEND")?;
        }
        if let Some(val) = lookup("MRVA_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(val);
        }
        config.s3_endpoint = lookup("MRVA_S3_ENDPOINT");
        config.s3_access_key = lookup("MRVA_S3_ACCESS_KEY");
        config.s3_secret_key = lookup("MRVA_S3_SECRET_KEY");
        if let Some(val) = lookup("MRVA_S3_REGION") {
            config.s3_region = val;
        }

        // Database settings
        if let Some(val) = lookup("MRVA_DB_BACKEND") {
            config.db_backend = parse_env_value(&val, "MRVA_DB_BACKEND")?;
        }
        if let Some(val) = lookup("MRVA_DB_ROOT") {
            config.db_root = PathBuf::from(val);
        }
        if let Some(val) = lookup("MRVA_DB_BUCKET") {
            config.db_bucket = val;
        }

        // Agent settings
        if let Some(val) = lookup("CODEQL_CLI_PATH") {
            config.codeql_cli_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("MRVA_WORKERS") {
            config.num_workers = parse_env_value(&val, "MRVA_WORKERS")?;
        }
        if let Some(val) = lookup("MRVA_WORKER_MEMORY_MB") {
            config.worker_memory_mb = parse_env_value(&val, "MRVA_WORKER_MEMORY_MB")?;
        }

        // HTTP settings
        if let Some(val) = lookup("MRVA_LISTEN_ADDR") {
            config.listen_addr = parse_env_value(&val, "MRVA_LISTEN_ADDR")?;
        }
        if let Some(val) = lookup("MRVA_PUBLIC_URL") {
            config.public_url = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_backend == QueueBackend::Redis {
            if self.redis_url.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "redis_url cannot be empty with the redis queue".to_string(),
                ));
            }
            if self.queue_consumer.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "queue_consumer cannot be empty with the redis queue".to_string(),
                ));
            }
        }

        if self.state_backend == StateBackend::Postgres
            && self.database_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
        }

        if self.starting_id < 1 {
            return Err(ConfigError::ValidationFailed(
                "starting_id must be at least 1".to_string(),
            ));
        }

        let needs_s3 = self.artifact_backend == ArtifactBackend::S3
            || self.db_backend == DatabaseBackend::S3;
        if needs_s3 {
            for (key, value) in [
                ("MRVA_S3_ENDPOINT", &self.s3_endpoint),
                ("MRVA_S3_ACCESS_KEY", &self.s3_access_key),
                ("MRVA_S3_SECRET_KEY", &self.s3_secret_key),
            ] {
                if value.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::MissingEnvVar(key.to_string()));
                }
            }
        }

        if self.db_backend == DatabaseBackend::S3 && self.db_bucket.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "db_bucket cannot be empty".to_string(),
            ));
        }

        if self.worker_memory_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_memory_mb must be greater than 0".to_string(),
            ));
        }

        if self.public_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "public_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_queue_backend(mut self, backend: QueueBackend) -> Self {
        self.queue_backend = backend;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_state_backend(mut self, backend: StateBackend) -> Self {
        self.state_backend = backend;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_artifact_backend(mut self, backend: ArtifactBackend) -> Self {
        self.artifact_backend = backend;
        self
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Sets endpoint and credentials of the object storage service.
    pub fn with_s3(
        mut self,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.s3_endpoint = Some(endpoint.into());
        self.s3_access_key = Some(access_key.into());
        self.s3_secret_key = Some(secret_key.into());
        self
    }

    pub fn with_db_backend(mut self, backend: DatabaseBackend) -> Self {
        self.db_backend = backend;
        self
    }

    pub fn with_db_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.db_root = root.into();
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_worker_memory_mb(mut self, mb: u64) -> Self {
        self.worker_memory_mb = mb;
        self
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue_backend, QueueBackend::Memory);
        assert_eq!(config.state_backend, StateBackend::Memory);
        assert_eq!(config.artifact_backend, ArtifactBackend::Memory);
        assert_eq!(config.db_backend, DatabaseBackend::Filesystem);
        assert_eq!(config.db_bucket, "qldb");
        assert_eq!(config.worker_memory_mb, 2048);
        assert_eq!(config.num_workers, 0);
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_consumer_differs_per_process() {
        let config = Config::default();
        assert_ne!(config.queue_consumer, "mrva-1");
        assert!(config
            .queue_consumer
            .ends_with(&format!("-{}", std::process::id())));

        let named = Config::from_lookup(lookup(&[("MRVA_QUEUE_CONSUMER", "agent-east")])).unwrap();
        assert_eq!(named.queue_consumer, "agent-east");
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = Config::from_lookup(lookup(&[
            ("MRVA_QUEUE_BACKEND", "redis"),
            ("MRVA_REDIS_URL", "redis://queue:6379"),
            ("MRVA_STATE_BACKEND", "Postgres"),
            ("DATABASE_URL", "postgres://db/mrva"),
            ("MRVA_STARTING_ID", "1000"),
            ("MRVA_ARTIFACT_BACKEND", "s3"),
            ("MRVA_S3_ENDPOINT", "http://minio:9000"),
            ("MRVA_S3_ACCESS_KEY", "user"),
            ("MRVA_S3_SECRET_KEY", "secret"),
            ("MRVA_WORKERS", "4"),
            ("MRVA_LISTEN_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();

        assert_eq!(config.queue_backend, QueueBackend::Redis);
        assert_eq!(config.redis_url, "redis://queue:6379");
        assert_eq!(config.state_backend, StateBackend::Postgres);
        assert_eq!(config.starting_id, 1000);
        assert_eq!(config.artifact_backend, ArtifactBackend::S3);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("MRVA_QUEUE_BACKEND", "kafka")])).unwrap_err();
        assert!(err.to_string().contains("MRVA_QUEUE_BACKEND"));

        let err = Config::from_lookup(lookup(&[("MRVA_STARTING_ID", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation_requires_backend_parameters() {
        let postgres = Config::new().with_state_backend(StateBackend::Postgres);
        assert!(matches!(
            postgres.validate(),
            Err(ConfigError::MissingEnvVar(key)) if key == "DATABASE_URL"
        ));

        let s3 = Config::new().with_db_backend(DatabaseBackend::S3);
        assert!(matches!(s3.validate(), Err(ConfigError::MissingEnvVar(_))));
        let s3 = s3.with_s3("http://minio:9000", "a", "b");
        assert!(s3.validate().is_ok());

        let memory = Config::new().with_worker_memory_mb(0);
        assert!(memory.validate().unwrap_err().to_string().contains("worker_memory_mb"));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("FILESYSTEM".parse::<ArtifactBackend>().unwrap(), ArtifactBackend::Filesystem);
        assert_eq!(DatabaseBackend::S3.to_string(), "s3");
        assert!("sqlite".parse::<StateBackend>().is_err());
    }
}
