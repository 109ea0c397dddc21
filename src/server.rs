//! HTTP front end for the visualization UI.
//!
//! Every data route lives under `/data`; anything else falls through to the
//! static frontend bundle.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`/`HEAD` | `/data/dataset.parquet` | Dataset as Parquet, single-range aware |
//! | `GET`  | `/data/metadata.json` | Dataset descriptor |
//! | `GET`/`POST` | `/data/cache/{name}` | Client-side JSON cache |
//! | `POST` | `/data/clinical-feedback?topic=` | Append a feedback record |
//! | `GET`  | `/data/archive.zip` | Self-contained static export |
//! | `POST` | `/data/upload-neighbors?k=` | Neighbors of an uploaded image (`file` field) |
//! | `GET`  | `/data/text-neighbors?q=&k=` | Neighbors of a text query |
//! | `POST` | `/data/upload-embeddings` | Batch placement, one multipart field per item |
//! | `GET`  | `/data/point-neighbors?id=&k=` | Neighbors of an existing row |
//! | `GET`  | `/data/images/{column}/{filename}` | Image asset bytes |
//! | `GET`/`POST` | `/data/query` | Ad-hoc SQL (server engine only) |
//! | `POST` | `/data/selection` | Export a filtered selection (server engine only) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "cache body must be valid JSON" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (404),
//! `query_error` (500), `search_error` (500), `internal` (500).

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::app::Atlas;
use crate::config::Config;
use crate::metadata::with_database;
use crate::query::{QueryError, QueryOutput, QueryProxy, QueryRequest, SelectionFormat, SelectionRequest};
use crate::search::{NeighborResponse, SearchError, SearchOrchestrator, Upload};
use crate::store::StoreError;

const BODY_LIMIT: usize = 64 * 1024 * 1024;
const DEFAULT_FEEDBACK_TOPIC: &str = "clinical-feedback";

/// Loads the dataset and serves it on `[server].bind` until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let owned = config.clone();
    let atlas = tokio::task::spawn_blocking(move || Atlas::from_config(&owned)).await??;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("atlas listening on http://{}", listener.local_addr()?);
    serve(Arc::new(atlas), listener).await
}

/// Serve on an already-bound listener.
pub async fn serve(atlas: Arc<Atlas>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    axum::serve(listener, router(atlas)).await?;
    Ok(())
}

pub fn router(atlas: Arc<Atlas>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
        ]);

    let data = Router::new()
        .route(
            "/dataset.parquet",
            get(handle_dataset_get).head(handle_dataset_head),
        )
        .route("/metadata.json", get(handle_metadata))
        .route("/cache/{name}", get(handle_cache_get).post(handle_cache_set))
        .route("/clinical-feedback", post(handle_feedback))
        .route("/archive.zip", get(handle_archive))
        .route("/upload-neighbors", post(handle_upload_neighbors))
        .route("/text-neighbors", get(handle_text_neighbors))
        .route("/upload-embeddings", post(handle_upload_embeddings))
        .route("/point-neighbors", get(handle_point_neighbors))
        .route("/images/{column}/{filename}", get(handle_image))
        .route("/query", get(handle_query_get).post(handle_query_post))
        .route("/selection", post(handle_selection));

    let static_dir = atlas.static_dir.clone();
    Router::new()
        .nest("/data", data)
        .route("/health", get(handle_health))
        .fallback_service(ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .with_state(atlas)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "not_found", message)
}

/// A feature that is not configured, or whose backend failed to load.
fn unavailable(message: impl Into<String>) -> AppError {
    error(StatusCode::NOT_FOUND, "unavailable", message)
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!("request failed: {:#}", err);
    error(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{:#}", err))
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_client_error() {
            bad_request(err.to_string())
        } else {
            internal(err.into())
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        if err.is_client_error() {
            return bad_request(err.to_string());
        }
        tracing::warn!("query failed: {}", err);
        error(StatusCode::INTERNAL_SERVER_ERROR, "query_error", err.to_string())
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Unavailable(_) => unavailable(err.to_string()),
            SearchError::NotFound(message) => not_found(message),
            SearchError::Invalid(message) => bad_request(message),
            SearchError::Backend(_) => {
                tracing::warn!("{}", err);
                error(StatusCode::INTERNAL_SERVER_ERROR, "search_error", err.to_string())
            }
        }
    }
}

type Handled = Result<Response, AppError>;

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, AppError> {
    serde_json::from_slice(bytes).map_err(|e| bad_request(format!("invalid {}: {}", what, e)))
}

fn bytes_response(content_type: &str, bytes: impl Into<Body>) -> Handled {
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(bytes.into())
        .map_err(|e| internal(e.into()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Dataset and descriptor ============

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

async fn handle_dataset_get(State(atlas): State<Arc<Atlas>>, headers: HeaderMap) -> Handled {
    atlas
        .dataset_blob
        .get(range_header(&headers))
        .await
        .map_err(internal)
}

async fn handle_dataset_head(State(atlas): State<Arc<Atlas>>, headers: HeaderMap) -> Handled {
    atlas
        .dataset_blob
        .head(range_header(&headers))
        .await
        .map_err(internal)
}

async fn handle_metadata(State(atlas): State<Arc<Atlas>>) -> Json<Value> {
    Json(with_database(atlas.store.metadata(), &atlas.database))
}

// ============ Cache ============

async fn handle_cache_get(
    State(atlas): State<Arc<Atlas>>,
    Path(name): Path<String>,
) -> Handled {
    let store = atlas.store.clone();
    let lookup = name.clone();
    let cached = atlas
        .workers
        .run_blocking(move || Ok(store.cache_get(&lookup)))
        .await
        .map_err(internal)??;
    match cached {
        Some(bytes) => bytes_response("application/json", bytes),
        None => Err(not_found(format!("cache entry not found: {}", name))),
    }
}

async fn handle_cache_set(
    State(atlas): State<Arc<Atlas>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let _: Value = parse_json(&body, "cache body")?;
    let store = atlas.store.clone();
    atlas
        .workers
        .run_blocking(move || Ok(store.cache_set(&name, &body)))
        .await
        .map_err(internal)??;
    Ok(Json(json!({})))
}

// ============ Feedback and archive ============

#[derive(Deserialize)]
struct FeedbackParams {
    topic: Option<String>,
}

async fn handle_feedback(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<FeedbackParams>,
    body: Bytes,
) -> Handled {
    let record: Value = parse_json(&body, "feedback record")?;
    let topic = params
        .topic
        .unwrap_or_else(|| DEFAULT_FEEDBACK_TOPIC.to_string());
    let store = atlas.store.clone();
    let receipt = atlas
        .workers
        .run_blocking(move || Ok(store.append_feedback(&topic, record)))
        .await
        .map_err(internal)??;
    Ok(Json(receipt).into_response())
}

async fn handle_archive(State(atlas): State<Arc<Atlas>>) -> Handled {
    let bytes = atlas.export_archive().await.map_err(internal)?;
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"atlas.zip\"",
        )
        .body(Body::from(bytes))
        .map_err(|e| internal(e.into()))
}

// ============ Images ============

async fn handle_image(
    State(atlas): State<Arc<Atlas>>,
    Path((column, filename)): Path<(String, String)>,
) -> Handled {
    let store = atlas.store.clone();
    let (col, file) = (column.clone(), filename.clone());
    let resolved = atlas
        .workers
        .run_blocking(move || Ok(store.resolve_image(&col, &file)?))
        .await;
    match resolved {
        Ok(Some(image)) => bytes_response(image.mime, image.bytes),
        Ok(None) => Err(not_found(format!("no image {}/{}", column, filename))),
        Err(e) => {
            tracing::warn!(column = %column, filename = %filename, "image unresolvable: {:#}", e);
            Err(not_found(format!("image {}/{} could not be loaded", column, filename)))
        }
    }
}

// ============ Search ============

fn search(atlas: &Atlas) -> Result<&SearchOrchestrator, AppError> {
    atlas
        .search
        .as_ref()
        .ok_or_else(|| unavailable("no search backend configured"))
}

#[derive(Deserialize)]
struct NeighborParams {
    k: Option<usize>,
    q: Option<String>,
    id: Option<String>,
}

async fn handle_upload_neighbors(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<NeighborParams>,
    mut multipart: Multipart,
) -> Handled {
    let search = search(&atlas)?;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        if field.name() == Some("file") {
            upload = Some(field.bytes().await.map_err(|e| bad_request(e.to_string()))?);
            break;
        }
    }
    let Some(bytes) = upload else {
        return Err(bad_request("multipart field 'file' is required"));
    };
    let response = search.image_neighbors(&bytes, params.k).await?;
    Ok(Json(response).into_response())
}

async fn handle_text_neighbors(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<NeighborParams>,
) -> Handled {
    let text = params.q.unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(Json(NeighborResponse::empty()).into_response());
    }
    let response = search(&atlas)?.text_neighbors(&text, params.k).await?;
    Ok(Json(response).into_response())
}

async fn handle_point_neighbors(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<NeighborParams>,
) -> Handled {
    let search = search(&atlas)?;
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return Err(bad_request("query parameter 'id' is required"));
    };
    let response = search.point_neighbors(&id, params.k).await?;
    Ok(Json(response).into_response())
}

async fn handle_upload_embeddings(
    State(atlas): State<Arc<Atlas>>,
    mut multipart: Multipart,
) -> Handled {
    let search = search(&atlas)?;
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field
            .file_name()
            .or(field.name())
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload-{}", uploads.len()));
        let bytes = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
        uploads.push(Upload {
            name,
            bytes: bytes.to_vec(),
        });
    }
    let response = search.embed_batch(uploads).await?;
    Ok(Json(response).into_response())
}

// ============ Query and selection ============

fn query_proxy(atlas: &Atlas) -> Result<&QueryProxy, AppError> {
    atlas.query.as_ref().ok_or_else(|| {
        unavailable("queries are not executed by this server; see metadata.json database")
    })
}

#[derive(Deserialize)]
struct QueryParams {
    query: Option<String>,
}

async fn run_query(atlas: &Atlas, request: QueryRequest) -> Handled {
    let proxy = query_proxy(atlas)?;
    match proxy.execute(request).await? {
        QueryOutput::Empty => Ok(Json(json!({})).into_response()),
        QueryOutput::Arrow(bytes) => bytes_response("application/vnd.apache.arrow.stream", bytes),
        QueryOutput::Json(bytes) => bytes_response("application/json", bytes),
    }
}

async fn handle_query_get(
    State(atlas): State<Arc<Atlas>>,
    Query(params): Query<QueryParams>,
) -> Handled {
    let Some(raw) = params.query else {
        return Err(bad_request("query parameter 'query' is required"));
    };
    let request = parse_json(raw.as_bytes(), "query request")?;
    run_query(&atlas, request).await
}

async fn handle_query_post(State(atlas): State<Arc<Atlas>>, body: Bytes) -> Handled {
    let request = parse_json(&body, "query request")?;
    run_query(&atlas, request).await
}

async fn handle_selection(State(atlas): State<Arc<Atlas>>, body: Bytes) -> Handled {
    let proxy = query_proxy(&atlas)?;
    let request: SelectionRequest = parse_json(&body, "selection request")?;
    let (content_type, extension) = match request.format {
        SelectionFormat::Json => ("application/json", "json"),
        SelectionFormat::Jsonl => ("application/x-ndjson", "jsonl"),
        SelectionFormat::Csv => ("text/csv", "csv"),
        SelectionFormat::Parquet => ("application/octet-stream", "parquet"),
    };
    let bytes = proxy.export_selection(request).await?;
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"selection.{}\"", extension),
        )
        .body(Body::from(bytes))
        .map_err(|e| internal(e.into()))
}
