//! In-process artifact store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ArtifactError, ArtifactLocation, ArtifactStore};
use crate::scheduler::job::{JobSpec, SessionId};

/// Artifact store that keeps every blob in memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<ArtifactLocation, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn put(&self, location: ArtifactLocation, data: &[u8]) -> ArtifactLocation {
        self.blobs.write().await.insert(location.clone(), data.to_vec());
        location
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.blobs
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(location.clone()))
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save_query_pack(
        &self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        Ok(self.put(ArtifactLocation::query_pack(session_id), data).await)
    }

    async fn get_query_pack(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.get(location).await
    }

    async fn save_result(
        &self,
        spec: &JobSpec,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        Ok(self.put(ArtifactLocation::result(spec), data).await)
    }

    async fn get_result(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.get(location).await
    }

    async fn get_result_size(&self, location: &ArtifactLocation) -> Result<u64, ArtifactError> {
        self.blobs
            .read()
            .await
            .get(location)
            .map(|data| data.len() as u64)
            .ok_or_else(|| ArtifactError::NotFound(location.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NameWithOwner;

    #[tokio::test]
    async fn test_memory_store_query_pack() {
        let store = MemoryArtifactStore::new();
        let location = store.save_query_pack(5, b"pack").await.unwrap();

        assert_eq!(location, ArtifactLocation::query_pack(5));
        assert_eq!(store.get_query_pack(&location).await.unwrap(), b"pack");
    }

    #[tokio::test]
    async fn test_memory_store_result_overwrite_and_size() {
        let store = MemoryArtifactStore::new();
        let spec = JobSpec::new(1, NameWithOwner::new("a", "b"));

        let first = store.save_result(&spec, b"first").await.unwrap();
        let second = store.save_result(&spec, b"second!").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_result(&second).await.unwrap(), b"second!");
        assert_eq!(store.get_result_size(&second).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryArtifactStore::new();
        let missing = ArtifactLocation::query_pack(99);

        assert!(matches!(
            store.get_query_pack(&missing).await,
            Err(ArtifactError::NotFound(_))
        ));
        assert!(store.get_result_size(&missing).await.is_err());
    }
}
