//! HTTP endpoints for Prometheus remote read and write.
//!
//! The storage façade is blocking, so every read and write runs on tokio's
//! blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use promdex::proto::{self, ReadResponse};
use promdex::{AdapterError, RemoteStorage};
use tokio::signal;

/// Largest accepted request body (compressed).
const MAX_BODY_BYTES: usize = 32 << 20;

/// Shared application state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) storage: Arc<dyn RemoteStorage>,
}

/// Builds the router over `storage`.
pub(crate) fn router(storage: Arc<dyn RemoteStorage>) -> Router {
    Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/read", post(handle_read))
        .route("/v1/write", post(handle_write))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { storage })
}

/// Serves until SIGINT or SIGTERM.
pub(crate) async fn serve(port: u16, storage: Arc<dyn RemoteStorage>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let adapter = storage.name();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, adapter, "remote storage adapter listening");

    axum::serve(listener, router(storage))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

/// Error response for a failed read or write.
#[derive(Debug)]
enum ApiError {
    Adapter(AdapterError),
    Task(tokio::task::JoinError),
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        Self::Adapter(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Adapter(e) => e.to_string(),
            Self::Task(e) => format!("request task failed: {e}"),
        };
        tracing::error!(error = %message, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_write(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let started = Instant::now();
    let body_size = body.len();
    let storage = Arc::clone(&state.storage);

    let (series, stats) = tokio::task::spawn_blocking(move || {
        let request = proto::decode_write_request(&body)?;
        let stats = storage.write(&request.timeseries)?;
        Ok::<_, AdapterError>((request.timeseries.len(), stats))
    })
    .await??;

    tracing::info!(
        body_size,
        series,
        documents = stats.succeeded,
        elapsed_ms = started.elapsed().as_millis(),
        "write handled"
    );
    Ok(StatusCode::OK)
}

async fn handle_read(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let started = Instant::now();
    let storage = Arc::clone(&state.storage);

    let (queries, results, encoded) = tokio::task::spawn_blocking(move || {
        let request = proto::decode_read_request(&body)?;
        let results = storage.read(&request.queries)?;
        let counts = (request.queries.len(), results.len());
        let encoded = proto::encode_read_response(&ReadResponse { results })?;
        Ok::<_, AdapterError>((counts.0, counts.1, encoded))
    })
    .await??;

    tracing::info!(
        queries,
        results,
        elapsed_ms = started.elapsed().as_millis(),
        "read handled"
    );
    Ok((
        [
            (CONTENT_TYPE, "application/x-protobuf"),
            (CONTENT_ENCODING, "snappy"),
        ],
        encoded,
    )
        .into_response())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        () = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use promdex::backend::MemoryBackend;
    use promdex::proto::{
        Label, LabelMatcher, MatchType, Query, ReadRequest, Sample, TimeSeries, WriteRequest,
    };
    use promdex::{BulkConfig, DocumentStorage, SearchOptions};
    use tower::ServiceExt;

    fn memory_storage() -> Arc<DocumentStorage<MemoryBackend>> {
        Arc::new(DocumentStorage::new(
            MemoryBackend::new(),
            BulkConfig::default(),
            SearchOptions::default(),
        ))
    }

    fn write_body() -> Vec<u8> {
        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![
                    Label {
                        name: "__name__".to_string(),
                        value: "up".to_string(),
                    },
                    Label {
                        name: "job".to_string(),
                        value: "api".to_string(),
                    },
                ],
                samples: vec![
                    Sample {
                        value: 1.0,
                        timestamp: 1000,
                    },
                    Sample {
                        value: 0.0,
                        timestamp: 2000,
                    },
                ],
            }],
        };
        proto::encode_message(&request).unwrap()
    }

    fn read_body(job: &str) -> Vec<u8> {
        let request = ReadRequest {
            queries: vec![Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 5000,
                matchers: vec![LabelMatcher::new("job", job, MatchType::Eq)],
                hints: None,
            }],
            accepted_response_types: vec![],
        };
        proto::encode_message(&request).unwrap()
    }

    fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-protobuf")
            .header("content-encoding", "snappy")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(memory_storage());
        let req = Request::builder()
            .uri("/v1/health")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let storage = memory_storage();
        let app = router(storage.clone());

        let resp = app.clone().oneshot(post("/v1/write", write_body())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(storage.backend().document_count(), 2);

        let resp = app.oneshot(post("/v1/read", read_body("api"))).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_ENCODING).unwrap(), "snappy");
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-protobuf"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let response: ReadResponse = proto::decode_message(&body).unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].timeseries[0].samples.len(), 2);
    }

    #[tokio::test]
    async fn test_read_omits_queries_without_matches() {
        let storage = memory_storage();
        let app = router(storage);
        app.clone().oneshot(post("/v1/write", write_body())).await.unwrap();

        let resp = app.oneshot(post("/v1/read", read_body("db"))).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let response: ReadResponse = proto::decode_message(&body).unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body_returns_500() {
        let app = router(memory_storage());

        let write = app
            .clone()
            .oneshot(post("/v1/write", b"not snappy".to_vec()))
            .await
            .unwrap();
        let read = app
            .oneshot(post("/v1/read", b"not snappy".to_vec()))
            .await
            .unwrap();

        assert_eq!(write.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(read.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_bulk_failure_returns_500() {
        let storage = memory_storage();
        storage.backend().fail_bulk_requests("cluster_block_exception");
        let app = router(storage);

        let resp = app.oneshot(post("/v1/write", write_body())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_get_on_write_is_rejected() {
        let app = router(memory_storage());
        let req = Request::builder()
            .uri("/v1/write")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
