//! Lookup of pre-built analysis databases.
//!
//! The commander asks the locator which requested repositories have a
//! database at all and skips the rest. Workers ask it for the database bytes
//! of the repository they are analyzing.
//!
//! # Backends
//!
//! - **FilesystemLocator**: `{root}/{owner}/{repo}/{owner}_{repo}_db.zip`
//! - **BucketLocator**: key `{owner}${repo}.zip` in the `qldb` bucket of an
//!   S3-compatible service

pub mod bucket;
pub mod filesystem;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::NameWithOwner;
use crate::storage::ArtifactError;

pub use bucket::BucketLocator;
pub use filesystem::FilesystemLocator;

/// Errors that can occur while locating or reading databases.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The database disappeared between lookup and read.
    #[error("Database not found: {0}")]
    NotFound(DatabaseLocation),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store access failed.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] ArtifactError),
}

/// Where a repository's database lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseLocation {
    Path(PathBuf),
    Object { bucket: String, key: String },
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLocation::Path(path) => write!(f, "{}", path.display()),
            DatabaseLocation::Object { bucket, key } => write!(f, "{}/{}", bucket, key),
        }
    }
}

/// Partition of a request into repositories with and without a database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    /// Requested repositories without a database, in request order.
    pub not_found: Vec<NameWithOwner>,
    /// Repositories with a database, mapped to its location.
    pub found: HashMap<NameWithOwner, DatabaseLocation>,
}

/// Resolves repositories to their analysis databases.
#[async_trait]
pub trait DatabaseLocator: Send + Sync {
    /// Returns the location of the repository's database, if it has one.
    async fn locate(&self, nwo: &NameWithOwner) -> Result<Option<DatabaseLocation>, LocatorError>;

    /// Reads the database archive at `location`.
    async fn get_database(&self, location: &DatabaseLocation) -> Result<Vec<u8>, LocatorError>;

    /// Splits `requested` into repositories with and without a database.
    ///
    /// Duplicates in `requested` are reported once.
    async fn find_available(&self, requested: &[NameWithOwner]) -> Result<Availability, LocatorError> {
        let mut availability = Availability::default();
        for nwo in requested {
            if availability.found.contains_key(nwo) || availability.not_found.contains(nwo) {
                continue;
            }
            match self.locate(nwo).await? {
                Some(location) => {
                    availability.found.insert(nwo.clone(), location);
                }
                None => availability.not_found.push(nwo.clone()),
            }
        }
        Ok(availability)
    }
}
