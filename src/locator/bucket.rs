//! Databases stored as objects in an S3-compatible bucket.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DatabaseLocation, DatabaseLocator, LocatorError};
use crate::scheduler::job::NameWithOwner;
use crate::storage::S3Client;

/// Default bucket holding database bundles.
pub const DEFAULT_DATABASE_BUCKET: &str = "qldb";

/// Locator for `{owner}${repo}.zip` objects.
#[derive(Debug, Clone)]
pub struct BucketLocator {
    client: Arc<S3Client>,
    bucket: String,
}

impl BucketLocator {
    pub fn new(client: Arc<S3Client>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Object key the database of `nwo` would have.
    pub fn object_key(nwo: &NameWithOwner) -> String {
        format!("{}${}.zip", nwo.owner, nwo.repo)
    }
}

#[async_trait]
impl DatabaseLocator for BucketLocator {
    async fn locate(&self, nwo: &NameWithOwner) -> Result<Option<DatabaseLocation>, LocatorError> {
        let key = Self::object_key(nwo);
        let size = self.client.head_object(&self.bucket, &key).await?;
        Ok(size.map(|_| DatabaseLocation::Object {
            bucket: self.bucket.clone(),
            key,
        }))
    }

    async fn get_database(&self, location: &DatabaseLocation) -> Result<Vec<u8>, LocatorError> {
        let DatabaseLocation::Object { bucket, key } = location else {
            return Err(LocatorError::NotFound(location.clone()));
        };
        self.client
            .get_object(bucket, key)
            .await?
            .ok_or_else(|| LocatorError::NotFound(location.clone()))
    }
}
