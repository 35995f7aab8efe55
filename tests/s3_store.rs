//! S3 artifact store and bucket locator against a live S3-compatible service.
//!
//! Run with `MRVA_TEST_S3_ENDPOINT`, `MRVA_TEST_S3_ACCESS_KEY` and
//! `MRVA_TEST_S3_SECRET_KEY` set, then `cargo test -- --ignored`.

use std::sync::Arc;

use mrva_commander::locator::{BucketLocator, DatabaseLocator};
use mrva_commander::storage::{ArtifactStore, S3ArtifactStore, S3Client, S3Config};
use mrva_commander::{JobSpec, NameWithOwner};

fn client() -> Arc<S3Client> {
    let var = |name: &str| std::env::var(name).unwrap_or_else(|_| panic!("{} must be set", name));
    let config = S3Config::new(
        var("MRVA_TEST_S3_ENDPOINT"),
        var("MRVA_TEST_S3_ACCESS_KEY"),
        var("MRVA_TEST_S3_SECRET_KEY"),
    );
    Arc::new(S3Client::new(config).unwrap())
}

#[tokio::test]
#[ignore = "requires an S3-compatible service"]
async fn test_artifacts_roundtrip() {
    let store = S3ArtifactStore::connect(client()).await.unwrap();

    let pack = store.save_query_pack(42, b"query pack").await.unwrap();
    assert_eq!(store.get_query_pack(&pack).await.unwrap(), b"query pack");

    let spec = JobSpec::new(42, NameWithOwner::new("octo", "cat"));
    let result = store.save_result(&spec, b"sarif.tgz").await.unwrap();
    assert_eq!(store.get_result_size(&result).await.unwrap(), 9);
    assert_eq!(store.get_result(&result).await.unwrap(), b"sarif.tgz");
}

#[tokio::test]
#[ignore = "requires an S3-compatible service"]
async fn test_bucket_locator() {
    let client = client();
    let bucket = format!("mrva-test-dbs-{}", std::process::id());
    client.ensure_bucket(&bucket).await.unwrap();

    let cat = NameWithOwner::new("octo", "cat");
    client
        .put_object(&bucket, &BucketLocator::object_key(&cat), b"db")
        .await
        .unwrap();

    let locator = BucketLocator::new(client, &bucket);
    let location = locator.locate(&cat).await.unwrap().expect("database should exist");
    assert_eq!(locator.get_database(&location).await.unwrap(), b"db");
    assert!(locator
        .locate(&NameWithOwner::new("octo", "dog"))
        .await
        .unwrap()
        .is_none());
}
