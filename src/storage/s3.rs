//! S3-compatible object storage (MinIO).
//!
//! Requests are path-style (`{endpoint}/{bucket}/{key}`) and signed with AWS
//! Signature Version 4. Only the handful of operations the commander needs
//! are implemented: bucket creation, PUT, GET and HEAD of single objects.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{ArtifactError, ArtifactLocation, ArtifactStore, PACKS_BUCKET, RESULTS_BUCKET};
use crate::scheduler::job::{JobSpec, SessionId};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Base URL, e.g. `http://minio:9000`.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Config {
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: "us-east-1".to_string(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// Minimal SigV4 client for path-style object access.
#[derive(Debug, Clone)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    config: S3Config,
}

impl S3Client {
    /// Creates a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::Configuration` if the endpoint is not a valid
    /// absolute URL.
    pub fn new(config: S3Config) -> Result<Self, ArtifactError> {
        let endpoint = Url::parse(config.endpoint.trim_end_matches('/')).map_err(|e| {
            ArtifactError::Configuration(format!("invalid endpoint '{}': {}", config.endpoint, e))
        })?;
        if endpoint.host_str().is_none() {
            return Err(ArtifactError::Configuration(format!(
                "endpoint '{}' has no host",
                config.endpoint
            )));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            config,
        })
    }

    /// Creates the bucket unless it already exists.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), ArtifactError> {
        let response = self.send(Method::PUT, bucket, None, Vec::new()).await?;
        let status = response.status();
        if status.is_success() {
            info!(bucket = bucket, "Created bucket");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT && body.contains("BucketAlreadyOwnedByYou") {
            debug!(bucket = bucket, "Bucket already exists");
            return Ok(());
        }

        Err(remote_error("PUT bucket", status, body))
    }

    /// Uploads an object, replacing any previous value.
    pub async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), ArtifactError> {
        let response = self
            .send(Method::PUT, bucket, Some(key), data.to_vec())
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(remote_error("PUT object", status, body))
    }

    /// Downloads an object, or `None` if it does not exist.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        let response = self.send(Method::GET, bucket, Some(key), Vec::new()).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(remote_error("GET object", status, body));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Returns the size of an object, or `None` if it does not exist.
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, ArtifactError> {
        let response = self.send(Method::HEAD, bucket, Some(key), Vec::new()).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(remote_error("HEAD object", status, String::new()));
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| remote_error("HEAD object", status, "missing Content-Length".to_string()))
    }

    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ArtifactError> {
        let mut path = format!("/{}", uri_encode(bucket, false));
        if let Some(key) = key {
            path.push('/');
            path.push_str(&uri_encode(key, false));
        }

        let mut url = self.endpoint.clone();
        url.set_path(&path);
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ArtifactError::Configuration("endpoint has no host".to_string()))
            }
        };

        let payload_hash = hex::encode(Sha256::digest(&body));
        let signed = sign_request(
            &self.config,
            method.as_str(),
            &host,
            &path,
            &payload_hash,
            Utc::now(),
        )?;

        let response = self
            .http
            .request(method, url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", signed.authorization)
            .body(body)
            .send()
            .await?;

        Ok(response)
    }
}

fn remote_error(operation: &str, status: StatusCode, message: String) -> ArtifactError {
    ArtifactError::Remote {
        operation: operation.to_string(),
        status: status.as_u16(),
        message,
    }
}

/// Headers produced by SigV4 signing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignedRequest {
    amz_date: String,
    authorization: String,
}

/// Signs a request with an empty query string over the `host`,
/// `x-amz-content-sha256` and `x-amz-date` headers.
fn sign_request(
    config: &S3Config,
    method: &str,
    host: &str,
    canonical_uri: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest, ArtifactError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    );
    let scope = format!("{}/{}/{}/aws4_request", date, config.region, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&config.secret_key, &date, &config.region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            config.access_key, scope, SIGNED_HEADERS, signature
        ),
    })
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, ArtifactError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ArtifactError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ArtifactError::Configuration(format!("signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encodes everything except the SigV4 unreserved set.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Artifact store backed by an S3-compatible service.
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Arc<S3Client>,
}

impl S3ArtifactStore {
    /// Creates the store and makes sure its buckets exist.
    pub async fn connect(client: Arc<S3Client>) -> Result<Self, ArtifactError> {
        for bucket in [PACKS_BUCKET, RESULTS_BUCKET] {
            client.ensure_bucket(bucket).await?;
        }
        Ok(Self { client })
    }

    async fn fetch(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.client
            .get_object(location.bucket(), location.key())
            .await?
            .ok_or_else(|| ArtifactError::NotFound(location.clone()))
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn save_query_pack(
        &self,
        session_id: SessionId,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        let location = ArtifactLocation::query_pack(session_id);
        self.client
            .put_object(location.bucket(), location.key(), data)
            .await?;
        Ok(location)
    }

    async fn get_query_pack(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.fetch(location).await
    }

    async fn save_result(
        &self,
        spec: &JobSpec,
        data: &[u8],
    ) -> Result<ArtifactLocation, ArtifactError> {
        let location = ArtifactLocation::result(spec);
        self.client
            .put_object(location.bucket(), location.key(), data)
            .await?;
        Ok(location)
    }

    async fn get_result(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactError> {
        self.fetch(location).await
    }

    async fn get_result_size(&self, location: &ArtifactLocation) -> Result<u64, ArtifactError> {
        self.client
            .head_object(location.bucket(), location.key())
            .await?
            .ok_or_else(|| ArtifactError::NotFound(location.clone()))
    }
}
