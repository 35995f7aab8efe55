//! HTTP surface of the commander.
//!
//! Routes mirror the variant-analysis endpoints clients already speak:
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | POST | `/repos/{owner}/{repo}/code-scanning/codeql/variant-analyses` | submit |
//! | GET | `.../variant-analyses/{id}` | session status |
//! | GET | `.../variant-analyses/{id}/repos/{repo_owner}/{repo_name}` | download info |
//! | GET | `/repositories/{session_id}/{repo_index}` | download info by index |
//! | GET | `/download-server/{token}` | result archive |
//! | GET | `/metrics` | Prometheus text format |

pub mod errors;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commander::{Commander, DownloadResponse, StatusResponse, SubmitRequest, SubmitResponse};
use crate::metrics::metrics_handler;
use crate::scheduler::job::{JobSpec, NameWithOwner, SessionId};

pub use errors::{ApiError, ApiResult};

const VARIANT_ANALYSES: &str = "/repos/{owner}/{repo}/code-scanning/codeql/variant-analyses";

/// Largest accepted submission body. The query pack travels base64-encoded
/// inside it.
pub const MAX_SUBMIT_BODY_BYTES: usize = 128 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub commander: Arc<Commander>,
}

/// Builds the router for `commander`.
pub fn router(commander: Arc<Commander>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/metrics", get(metrics_handler))
        .route(
            VARIANT_ANALYSES,
            axum::routing::post(submit).layer(DefaultBodyLimit::max(MAX_SUBMIT_BODY_BYTES)),
        )
        .route(&format!("{}/{{id}}", VARIANT_ANALYSES), get(status))
        .route(
            &format!("{}/{{id}}/repos/{{repo_owner}}/{{repo_name}}", VARIANT_ANALYSES),
            get(download),
        )
        .route("/repositories/{session_id}/{repo_index}", get(download_by_repo_id))
        .route("/download-server/{token}", get(artifact))
        .with_state(AppState { commander })
}

/// Serves `router` on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn root() -> &'static str {
    "mrva-commander"
}

/// POST `.../variant-analyses`
async fn submit(
    State(state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    info!(controller = %format!("{}/{}", owner, repo), "New variant analysis");
    let request: SubmitRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid submission body: {}", e)))?;
    Ok(Json(state.commander.submit(request).await?))
}

/// GET `.../variant-analyses/{id}`
async fn status(
    State(state): State<AppState>,
    Path((_owner, _repo, id)): Path<(String, String, String)>,
) -> ApiResult<Json<StatusResponse>> {
    let session_id = parse_number(&id, "variant analysis id")?;
    Ok(Json(state.commander.status(session_id).await?))
}

/// GET `.../variant-analyses/{id}/repos/{repo_owner}/{repo_name}`
async fn download(
    State(state): State<AppState>,
    Path((_owner, _repo, id, repo_owner, repo_name)): Path<(String, String, String, String, String)>,
) -> ApiResult<Json<DownloadResponse>> {
    let session_id: SessionId = parse_number(&id, "variant analysis id")?;
    let spec = JobSpec::new(session_id, NameWithOwner::new(repo_owner, repo_name));
    Ok(Json(state.commander.download(&spec).await?))
}

/// GET `/repositories/{session_id}/{repo_index}`
async fn download_by_repo_id(
    State(state): State<AppState>,
    Path((session_id, repo_index)): Path<(String, String)>,
) -> ApiResult<Json<DownloadResponse>> {
    let session_id = parse_number(&session_id, "session id")?;
    let repo_index = parse_number(&repo_index, "repository index")?;
    Ok(Json(
        state
            .commander
            .download_by_repo_id(session_id, repo_index)
            .await?,
    ))
}

/// GET `/download-server/{token}`
async fn artifact(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let artifact = state.commander.artifact(&token).await?;
    let disposition = format!("attachment; filename={}", artifact.file_name());
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}

fn parse_number(value: &str, what: &str) -> ApiResult<i64> {
    value
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{} must be an integer, got '{}'", what, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::FilesystemLocator;
    use crate::scheduler::job::AnalyzeResult;
    use crate::scheduler::queue::{JobQueue, MemoryQueue};
    use crate::state::MemoryState;
    use crate::storage::{ArtifactStore, MemoryArtifactStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _dir: TempDir,
        queue: Arc<MemoryQueue>,
        artifacts: Arc<MemoryArtifactStore>,
        commander: Arc<Commander>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("octo/cat");
        std::fs::create_dir_all(&db).unwrap();
        std::fs::write(db.join("octo_cat_db.zip"), b"db").unwrap();

        let queue = Arc::new(MemoryQueue::new(8));
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let commander = Arc::new(Commander::new(
            queue.clone(),
            Arc::new(MemoryState::new(1)),
            artifacts.clone(),
            Arc::new(FilesystemLocator::new(dir.path())),
        ));
        Fixture {
            _dir: dir,
            queue,
            artifacts,
            commander,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn submit_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/repos/ctl/repo/code-scanning/codeql/variant-analyses")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_status_download_roundtrip() {
        let f = fixture();
        let app = router(f.commander.clone());

        let body = serde_json::json!({
            "query_pack": STANDARD.encode([0x1F, 0x8B, 0x08]),
            "language": "cpp",
            "repositories": ["octo/cat", "octo/missing"],
        });
        let (status, bytes) = send(app.clone(), submit_request(body.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let submitted: SubmitResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            submitted.skipped_repositories.not_found_repos.repository_count,
            1
        );

        let job = f.queue.next_job().await.unwrap();
        let location = f.artifacts.save_result(&job.spec, b"tgz!").await.unwrap();
        f.commander
            .apply_result(&AnalyzeResult::success(job.spec.clone(), 1, location, "", ""))
            .await
            .unwrap();

        let uri = format!(
            "/repos/ctl/repo/code-scanning/codeql/variant-analyses/{}",
            submitted.id
        );
        let (status, bytes) = send(app.clone(), get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        let progress: StatusResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(progress.status, "succeeded");

        let (status, bytes) = send(app.clone(), get(&format!("{}/repos/octo/cat", uri))).await;
        assert_eq!(status, StatusCode::OK);
        let download: DownloadResponse = serde_json::from_slice(&bytes).unwrap();
        let path = download
            .artifact_url
            .strip_prefix("http://localhost:8080")
            .unwrap()
            .to_string();

        let response = app.clone().oneshot(get(&path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=octo-cat.tgz"
        );
        let archive = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&archive[..], b"tgz!");

        let (status, _) = send(app, get(&format!("/repositories/{}/0", submitted.id))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_submissions() {
        let f = fixture();
        let app = router(f.commander.clone());

        let unknown_field = serde_json::json!({
            "query_pack": STANDARD.encode([0x1F, 0x8B]),
            "language": "cpp",
            "repositories": [],
            "action_repo_ref": "main",
        });
        let (status, body) = send(app.clone(), submit_request(unknown_field.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["error"]["status"], 400);

        let not_gzip = serde_json::json!({
            "query_pack": STANDARD.encode(b"zip"),
            "language": "cpp",
            "repositories": ["octo/cat"],
        });
        let (status, _) = send(app, submit_request(not_gzip.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_accepts_large_query_packs() {
        let f = fixture();
        let app = router(f.commander.clone());

        // Well past axum's 2 MiB default once base64-encoded.
        let mut pack = vec![0x1F, 0x8B, 0x08];
        pack.resize(4 * 1024 * 1024, 0xAB);
        let body = serde_json::json!({
            "query_pack": STANDARD.encode(&pack),
            "language": "cpp",
            "repositories": ["octo/cat"],
        });
        let (status, bytes) = send(app, submit_request(body.to_string())).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&bytes));

        let job = f.queue.next_job().await.unwrap();
        let stored = f.artifacts.get_query_pack(&job.query_pack).await.unwrap();
        assert_eq!(stored.len(), pack.len());
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let f = fixture();
        let app = router(f.commander.clone());

        let base = "/repos/ctl/repo/code-scanning/codeql/variant-analyses";
        let (status, _) = send(app.clone(), get(&format!("{}/abc", base))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app.clone(), get(&format!("{}/77", base))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(app.clone(), get(&format!("{}/77/repos/a/b", base))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(app.clone(), get("/download-server/!!")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
