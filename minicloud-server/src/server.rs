use crate::config::{Config, StorageBackend};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::BytesMut;
use futures_util::{StreamExt, stream};
use minicloud_core::{
    ContentStore, ErrorKind, FsContentStore, MemoryContentStore, MiniCloudError, ObjectService,
    Result, SqliteMetadataIndex,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

const MAX_LIST_LIMIT: usize = 1000;
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

pub struct ServerState {
    pub service: ObjectService,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    prefix: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Open the content store and metadata index named by `config`.
///
/// The memory backend starts from an empty index: entries left by an earlier
/// process would name blobs that no longer exist.
pub fn build_service(config: &Config) -> Result<ObjectService> {
    let index = SqliteMetadataIndex::new(config.storage.metadata_db_path())?;

    let content: Arc<dyn ContentStore> = match config.storage.backend {
        StorageBackend::Fs => Arc::new(FsContentStore::new(config.storage.data_dir.clone())?),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory content store; objects will not survive a restart");
            index.clear()?;
            Arc::new(MemoryContentStore::new())
        }
    };

    Ok(ObjectService::with_options(
        content,
        Arc::new(index),
        config.service.options(),
    ))
}

pub fn router(state: Arc<ServerState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v1/object/*key",
            get(get_object)
                .put(put_object)
                .delete(delete_object)
                .head(head_object),
        )
        .route("/v1/head/*key", get(get_object_meta))
        .route("/v1/verify/*key", get(verify_object))
        .route("/v1/objects", get(list_objects))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let service = build_service(&config)?;
    let state = Arc::new(ServerState { service });
    let app = router(state, config.server.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!("Server listening on {}", config.server.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn status_for(error: &MiniCloudError) -> StatusCode {
    match error.kind() {
        ErrorKind::InvalidKey => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Io | ErrorKind::PartialWrite => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: MiniCloudError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    }

    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
        error_kind: Some(error.kind().as_str()),
    };
    (status, axum::Json(resp)).into_response()
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({ "ok": true })))
}

async fn put_object(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    match state.service.put(&key, &mut &body[..]).await {
        Ok(result) => (StatusCode::OK, axum::Json(ApiResponse::ok(result))).into_response(),
        Err(error) => error_response(error),
    }
}

type GetOutcome = oneshot::Receiver<Result<u64>>;

/// Streams the blob through a pipe fed by a background `get`. The first
/// chunk is awaited before answering so lookup failures still map to a
/// status code; a failure after that aborts the body.
async fn get_object(State(state): State<Arc<ServerState>>, Path(key): Path<String>) -> Response {
    let (mut reader, mut writer) = tokio::io::duplex(STREAM_CHUNK_SIZE);
    let (done_tx, done_rx) = oneshot::channel();

    let service = state.service.clone();
    tokio::spawn(async move {
        let result = service.get(&key, &mut writer).await;
        let _ = done_tx.send(result);
    });

    let mut first = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
    match reader.read_buf(&mut first).await {
        Ok(0) => match finish(done_rx).await {
            Ok(()) => octet_stream(Body::empty()),
            Err(error) => error_response(error),
        },
        Ok(_) => {
            let rest = stream::unfold(Some((reader, done_rx)), next_chunk);
            let body = stream::once(async move { Ok::<_, io::Error>(first.freeze()) }).chain(rest);
            octet_stream(Body::from_stream(body))
        }
        Err(error) => error_response(error.into()),
    }
}

fn octet_stream(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

async fn finish(done_rx: GetOutcome) -> Result<()> {
    match done_rx.await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(MiniCloudError::Internal("blob reader task ended early".to_string())),
    }
}

async fn next_chunk(
    state: Option<(DuplexStream, GetOutcome)>,
) -> Option<(io::Result<Bytes>, Option<(DuplexStream, GetOutcome)>)> {
    let (mut reader, done_rx) = state?;

    let mut chunk = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
    match reader.read_buf(&mut chunk).await {
        Ok(0) => match finish(done_rx).await {
            Ok(()) => None,
            Err(error) => {
                tracing::error!("Object stream failed: {}", error);
                Some((Err(io::Error::other(error.to_string())), None))
            }
        },
        Ok(_) => Some((Ok(chunk.freeze()), Some((reader, done_rx)))),
        Err(error) => Some((Err(error), None)),
    }
}

async fn head_object(State(state): State<Arc<ServerState>>, Path(key): Path<String>) -> Response {
    match state.service.head(&key).await {
        Ok(meta) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
            if let Some(tag) = meta.integrity_tag.as_deref() {
                if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", tag)) {
                    headers.insert(header::ETAG, value);
                }
            }
            (StatusCode::OK, headers).into_response()
        }
        Err(error) => status_for(&error).into_response(),
    }
}

async fn get_object_meta(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Response {
    match state.service.head(&key).await {
        Ok(meta) => (StatusCode::OK, axum::Json(ApiResponse::ok(meta))).into_response(),
        Err(error) => error_response(error),
    }
}

async fn delete_object(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Response {
    match state.service.delete(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

async fn verify_object(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Response {
    match state.service.verify(&key).await {
        Ok(consistency) => {
            let report = serde_json::json!({
                "key": key,
                "consistent": consistency.is_consistent(),
                "consistency": consistency,
            });
            (StatusCode::OK, axum::Json(ApiResponse::ok(report))).into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn list_objects(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
    match state.service.list(&query.prefix, limit).await {
        Ok(objects) => (StatusCode::OK, axum::Json(ApiResponse::ok(objects))).into_response(),
        Err(error) => error_response(error),
    }
}
