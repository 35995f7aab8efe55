//! Databases stored as zip bundles in a local directory tree.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{DatabaseLocation, DatabaseLocator, LocatorError};
use crate::scheduler::job::NameWithOwner;

/// Locator for `{root}/{owner}/{repo}/{owner}_{repo}_db.zip`.
#[derive(Debug, Clone)]
pub struct FilesystemLocator {
    root: PathBuf,
}

impl FilesystemLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path the database of `nwo` would have.
    pub fn database_path(&self, nwo: &NameWithOwner) -> PathBuf {
        self.root
            .join(&nwo.owner)
            .join(&nwo.repo)
            .join(format!("{}_{}_db.zip", nwo.owner, nwo.repo))
    }
}

#[async_trait]
impl DatabaseLocator for FilesystemLocator {
    async fn locate(&self, nwo: &NameWithOwner) -> Result<Option<DatabaseLocation>, LocatorError> {
        if !nwo.is_valid() {
            return Ok(None);
        }
        let path = self.database_path(nwo);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(DatabaseLocation::Path(path))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_database(&self, location: &DatabaseLocation) -> Result<Vec<u8>, LocatorError> {
        let DatabaseLocation::Path(path) = location else {
            return Err(LocatorError::NotFound(location.clone()));
        };
        match fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LocatorError::NotFound(location.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path, owner: &str, repo: &str, data: &[u8]) {
        let dir = root.join(owner).join(repo);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}_{}_db.zip", owner, repo)), data).unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_locator_finds_seeded_database() {
        let dir = TempDir::new().unwrap();
        seed(dir.path(), "octo", "cat", b"zip-bytes");
        let locator = FilesystemLocator::new(dir.path());

        let nwo = NameWithOwner::new("octo", "cat");
        let location = locator.locate(&nwo).await.unwrap().unwrap();

        assert_eq!(location, DatabaseLocation::Path(locator.database_path(&nwo)));
        assert_eq!(locator.get_database(&location).await.unwrap(), b"zip-bytes");
    }

    #[tokio::test]
    async fn test_filesystem_locator_find_available() {
        let dir = TempDir::new().unwrap();
        seed(dir.path(), "octo", "cat", b"db");
        // A directory at the database path is not a database.
        std::fs::create_dir_all(dir.path().join("octo/dog/octo_dog_db.zip")).unwrap();
        let locator = FilesystemLocator::new(dir.path());

        let availability = locator
            .find_available(&[
                NameWithOwner::new("octo", "cat"),
                NameWithOwner::new("octo", "dog"),
                NameWithOwner::new("octo", "bird"),
            ])
            .await
            .unwrap();

        assert_eq!(availability.found.len(), 1);
        assert_eq!(availability.not_found.len(), 2);
    }

    #[tokio::test]
    async fn test_filesystem_locator_ignores_dot_segments() {
        let outer = TempDir::new().unwrap();
        // `{root}/../../.._.._db.zip` would resolve to outer/.._.._db.zip.
        std::fs::write(outer.path().join(".._.._db.zip"), b"outside").unwrap();
        let root = outer.path().join("a/b");
        std::fs::create_dir_all(&root).unwrap();
        let locator = FilesystemLocator::new(&root);

        let location = locator
            .locate(&NameWithOwner::new("..", ".."))
            .await
            .unwrap();
        assert!(location.is_none());
    }

    #[tokio::test]
    async fn test_filesystem_locator_missing_file() {
        let dir = TempDir::new().unwrap();
        let locator = FilesystemLocator::new(dir.path());
        let location = DatabaseLocation::Path(dir.path().join("gone.zip"));

        assert!(matches!(
            locator.get_database(&location).await,
            Err(LocatorError::NotFound(_))
        ));
    }
}
