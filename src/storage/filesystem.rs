//! Filesystem-backed artifact store.
//!
//! Artifacts live at `{root}/{bucket}/{key}`. Writes go to a temporary file
//! in the target directory and are renamed into place, so a reader either
//! sees the previous complete blob or the new complete blob.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ArtifactError, ArtifactLocation, ArtifactStore};
use crate::scheduler::job::{JobSpec, SessionId};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Artifact store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the base storage path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a location under the root. Keys with `..`, root or prefix
    /// components are refused.
    fn path_for(&self, location: &ArtifactLocation) -> Result<PathBuf, ArtifactError> {
        let inside = [location.bucket(), location.key()].iter().all(|part| {
            let mut components = Path::new(part).components().peekable();
            components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
        });
        if !inside {
            return Err(ArtifactError::InvalidKey(location.clone()));
        }
        Ok(self.root.join(location.bucket()).join(location.key()))
    }

    async fn write(
        &self,
        location: ArtifactLocation,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        let path = self.path_for(&location)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).await?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(
            ".{}.{}-{}.tmp",
            file_name,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(location = %location, bytes = data.len(), "Stored artifact");
        Ok(location)
    }

    async fn read(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        match fs::read(self.path_for(location)?).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(location.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn save_query_pack(
        &self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        self.write(ArtifactLocation::query_pack(session_id), data).await
    }

    async fn get_query_pack(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.read(location).await
    }

    async fn save_result(
        &self,
        spec: &JobSpec,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        self.write(ArtifactLocation::result(spec), data).await
    }

    async fn get_result(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.read(location).await
    }

    async fn get_result_size(&self, location: &ArtifactLocation) -> Result<u64, ArtifactError> {
        match fs::metadata(self.path_for(location)?).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(location.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NameWithOwner;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filesystem_store_layout() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());

        let location = store.save_query_pack(3, b"qp-bytes").await.unwrap();

        let on_disk = dir.path().join("packs").join("qp-3.tgz");
        assert!(on_disk.exists());
        assert_eq!(store.get_query_pack(&location).await.unwrap(), b"qp-bytes");
    }

    #[tokio::test]
    async fn test_filesystem_store_result_roundtrip_and_size() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let spec = JobSpec::new(8, NameWithOwner::new("octo", "cat"));

        let location = store.save_result(&spec, &[1, 2, 3, 4]).await.unwrap();
        store.save_result(&spec, &[9, 9]).await.unwrap();

        assert_eq!(store.get_result(&location).await.unwrap(), vec![9, 9]);
        assert_eq!(store.get_result_size(&location).await.unwrap(), 2);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("results/8/octo"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_results_of_similar_names_do_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let first = JobSpec::new(1, NameWithOwner::new("octo-org", "cat"));
        let second = JobSpec::new(1, NameWithOwner::new("octo", "org-cat"));

        let first_location = store.save_result(&first, b"ARCHIVE-A").await.unwrap();
        let second_location = store.save_result(&second, b"ARCHIVE-B").await.unwrap();

        assert_eq!(store.get_result(&first_location).await.unwrap(), b"ARCHIVE-A");
        assert_eq!(store.get_result(&second_location).await.unwrap(), b"ARCHIVE-B");
    }

    #[tokio::test]
    async fn test_filesystem_store_missing() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(dir.path());
        let spec = JobSpec::new(1, NameWithOwner::new("a", "b"));
        let location = ArtifactLocation::result(&spec);

        assert!(matches!(
            store.get_result(&location).await,
            Err(ArtifactError::NotFound(_))
        ));
        assert!(matches!(
            store.get_result_size(&location).await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_filesystem_store_refuses_keys_outside_root() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("store");
        let store = FilesystemArtifactStore::new(&root);

        let escaping = JobSpec::new(1, NameWithOwner::new("..", ".."));
        assert!(matches!(
            store.save_result(&escaping, b"x").await,
            Err(ArtifactError::InvalidKey(_))
        ));

        let outside = ArtifactLocation::new("results", "../../escaped.tgz");
        assert!(matches!(
            store.write(outside, b"x").await,
            Err(ArtifactError::InvalidKey(_))
        ));
        assert!(!outer.path().join("escaped.tgz").exists());

        let absolute = ArtifactLocation::new("results", "/etc/passwd");
        assert!(matches!(
            store.get_result(&absolute).await,
            Err(ArtifactError::InvalidKey(_))
        ));
    }
}
