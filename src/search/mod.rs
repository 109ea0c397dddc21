//! Similarity search over the served dataset.
//!
//! A [`SearchBackend`] turns images and text into vectors, finds the nearest
//! dataset rows for a vector, and may place a vector on the 2-D plane. The
//! [`SearchOrchestrator`] builds the backend lazily, exactly once, and runs
//! the embed → search → project pipeline for every query kind:
//!
//! | Query | Input | Limit |
//! |-------|-------|-------|
//! | image | uploaded bytes | `max_results` |
//! | text | query string (empty ⇒ no results) | `max_results` |
//! | point | id of a dataset row with a stored vector | `max_point_results` |
//! | batch | several uploads; per-item novelty score | `batch_max` items |
//!
//! Backend construction failure is remembered: every later request gets the
//! same [`SearchError::Unavailable`] without another attempt.
//!
//! # Backend configuration
//!
//! A JSON document selects the implementation:
//!
//! ```json
//! { "backend": "remote", "url": "http://127.0.0.1:7000" }
//! { "backend": "local", "vectors": "vectors.jsonl", "projection": "proj.json" }
//! ```

pub mod index;
#[cfg(feature = "local-embeddings-fastembed")]
mod local;
pub mod remote;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::SearchConfig;
use crate::models::{Cell, Dataset};
use crate::projection::LinearProjection;
use crate::workers::{PoolClosed, WorkerPool};

pub use index::VectorIndex;
pub use remote::{RemoteBackend, RemoteConfig};

/// A raw backend hit: dataset row index and distance (smaller is closer).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>>;

    async fn encode_text(&self, text: &str) -> Result<Vec<f32>>;

    async fn find_nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Backend-native projection. `Ok(None)` when the backend has none.
    async fn project_vector(&self, _vector: &[f32]) -> Result<Option<(f64, f64)>> {
        Ok(None)
    }
}

/// Builds the backend on first use.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn SearchBackend>>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("search unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("search backend failed: {0}")]
    Backend(String),
}

impl From<PoolClosed> for SearchError {
    fn from(e: PoolClosed) -> Self {
        SearchError::Backend(e.to_string())
    }
}

fn backend_error(context: &str, e: anyhow::Error) -> SearchError {
    SearchError::Backend(format!("{}: {:#}", context, e))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborHit {
    pub id: Value,
    pub row_index: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueryPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborResponse {
    pub neighbors: Vec<NeighborHit>,
    pub query: Option<QueryPoint>,
}

impl NeighborResponse {
    pub fn empty() -> Self {
        Self {
            neighbors: Vec::new(),
            query: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub index: usize,
    pub name: String,
    pub query: Option<QueryPoint>,
    /// Mean distance to the item's nearest dataset rows.
    pub novelty: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchError {
    pub index: usize,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub items: Vec<BatchItem>,
    pub errors: Vec<BatchError>,
    pub truncated: bool,
}

/// One uploaded file in a batch request.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct SearchOrchestrator {
    loader: Arc<dyn BackendLoader>,
    backend: OnceCell<Result<Arc<dyn SearchBackend>, String>>,
    constructions: AtomicUsize,
    projection: Option<LinearProjection>,
    dataset: Arc<Dataset>,
    point_vectors: Option<VectorIndex>,
    limits: SearchConfig,
    workers: WorkerPool,
}

impl SearchOrchestrator {
    pub fn new(
        loader: Arc<dyn BackendLoader>,
        dataset: Arc<Dataset>,
        point_vectors: Option<VectorIndex>,
        projection: Option<LinearProjection>,
        limits: SearchConfig,
        workers: WorkerPool,
    ) -> Self {
        Self {
            loader,
            backend: OnceCell::new(),
            constructions: AtomicUsize::new(0),
            projection,
            dataset,
            point_vectors,
            limits,
            workers,
        }
    }

    /// Number of backend construction attempts (at most one).
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn supports_point_queries(&self) -> bool {
        self.point_vectors.is_some()
    }

    pub fn default_k(&self) -> usize {
        self.limits.default_k
    }

    async fn backend(&self) -> Result<Arc<dyn SearchBackend>, SearchError> {
        let outcome = self
            .backend
            .get_or_init(|| async {
                self.constructions.fetch_add(1, Ordering::SeqCst);
                match self.loader.load().await {
                    Ok(backend) => {
                        tracing::info!("search backend '{}' ready", backend.name());
                        Ok(backend)
                    }
                    Err(e) => {
                        tracing::error!("search backend unavailable: {:#}", e);
                        Err(format!("{:#}", e))
                    }
                }
            })
            .await;
        outcome.clone().map_err(SearchError::Unavailable)
    }

    fn clamp(k: Option<usize>, default: usize, max: usize) -> usize {
        k.unwrap_or(default).clamp(1, max.max(1))
    }

    /// Backend projector first, then the linear model. Projection failures
    /// are not request failures.
    async fn project(&self, backend: &dyn SearchBackend, vector: &[f32]) -> Option<QueryPoint> {
        let native = match backend.project_vector(vector).await {
            Ok(coords) => coords,
            Err(e) => {
                tracing::debug!("backend projection failed: {:#}", e);
                None
            }
        };
        native
            .or_else(|| self.projection.as_ref()?.project(vector))
            .map(|(x, y)| QueryPoint { x, y })
    }

    /// Map backend hits to dataset rows: drop out-of-range and excluded
    /// rows, order ascending by distance, keep `k`.
    fn translate(&self, hits: Vec<Neighbor>, exclude: Option<usize>, k: usize) -> Vec<NeighborHit> {
        let total = self.dataset.num_rows();
        let mut hits: Vec<Neighbor> = hits
            .into_iter()
            .filter(|h| h.index < total && Some(h.index) != exclude && !h.distance.is_nan())
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        hits.into_iter()
            .map(|h| NeighborHit {
                id: self
                    .dataset
                    .row_id(h.index)
                    .map(Cell::to_json)
                    .unwrap_or_else(|| Value::from(h.index)),
                row_index: h.index,
                distance: h.distance,
            })
            .collect()
    }

    async fn neighbors_of(
        &self,
        backend: &dyn SearchBackend,
        vector: &[f32],
        k: usize,
        exclude: Option<usize>,
    ) -> Result<NeighborResponse, SearchError> {
        let fetch = if exclude.is_some() { k + 1 } else { k };
        let hits = self
            .workers
            .run(backend.find_nearest_neighbors(vector, fetch))
            .await?
            .map_err(|e| backend_error("nearest-neighbor search failed", e))?;
        let neighbors = self.translate(hits, exclude, k);
        let query = self.project(backend, vector).await;
        Ok(NeighborResponse { neighbors, query })
    }

    pub async fn image_neighbors(
        &self,
        bytes: &[u8],
        k: Option<usize>,
    ) -> Result<NeighborResponse, SearchError> {
        let backend = self.backend().await?;
        let k = Self::clamp(k, self.limits.default_k, self.limits.max_results);
        let vector = self
            .workers
            .run(backend.embed_bytes(bytes))
            .await?
            .map_err(|e| backend_error("failed to embed image", e))?;
        self.neighbors_of(backend.as_ref(), &vector, k, None).await
    }

    pub async fn text_neighbors(
        &self,
        text: &str,
        k: Option<usize>,
    ) -> Result<NeighborResponse, SearchError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(NeighborResponse::empty());
        }
        let backend = self.backend().await?;
        let k = Self::clamp(k, self.limits.default_k, self.limits.max_results);
        let vector = self
            .workers
            .run(backend.encode_text(text))
            .await?
            .map_err(|e| backend_error("failed to encode text", e))?;
        self.neighbors_of(backend.as_ref(), &vector, k, None).await
    }

    /// Neighbors of an existing row, never including the row itself.
    pub async fn point_neighbors(
        &self,
        id: &str,
        k: Option<usize>,
    ) -> Result<NeighborResponse, SearchError> {
        let Some(vectors) = &self.point_vectors else {
            return Err(SearchError::Unavailable(
                "no vector column configured for point queries".into(),
            ));
        };
        let backend = self.backend().await?;
        let row = self
            .dataset
            .find_row(id)
            .ok_or_else(|| SearchError::NotFound(format!("unknown row id: {}", id)))?;
        let vector = vectors
            .get(row)
            .ok_or_else(|| SearchError::NotFound(format!("row {} has no stored vector", id)))?
            .to_vec();
        let k = Self::clamp(k, self.limits.default_k, self.limits.max_point_results);
        self.neighbors_of(backend.as_ref(), &vector, k, Some(row))
            .await
    }

    async fn batch_item(
        &self,
        backend: &dyn SearchBackend,
        index: usize,
        upload: &Upload,
    ) -> Result<BatchItem, SearchError> {
        if upload.bytes.is_empty() {
            return Err(SearchError::Invalid("empty upload".into()));
        }
        let vector = self
            .workers
            .run(backend.embed_bytes(&upload.bytes))
            .await?
            .map_err(|e| backend_error("failed to embed image", e))?;
        let hits = self
            .workers
            .run(backend.find_nearest_neighbors(&vector, self.limits.novelty_k))
            .await?
            .map_err(|e| backend_error("nearest-neighbor search failed", e))?;
        let hits = self.translate(hits, None, self.limits.novelty_k);
        let novelty = (!hits.is_empty())
            .then(|| hits.iter().map(|h| h.distance).sum::<f32>() / hits.len() as f32);
        Ok(BatchItem {
            index,
            name: upload.name.clone(),
            query: self.project(backend, &vector).await,
            novelty,
        })
    }

    /// Embed, project, and score each upload independently.
    pub async fn embed_batch(&self, uploads: Vec<Upload>) -> Result<BatchResponse, SearchError> {
        let backend = self.backend().await?;
        let truncated = uploads.len() > self.limits.batch_max;
        if truncated {
            tracing::warn!(
                received = uploads.len(),
                limit = self.limits.batch_max,
                "batch truncated"
            );
        }

        let mut items = Vec::new();
        let mut errors = Vec::new();
        for (index, upload) in uploads.iter().take(self.limits.batch_max).enumerate() {
            match self.batch_item(backend.as_ref(), index, upload).await {
                Ok(item) => items.push(item),
                Err(e) => errors.push(BatchError {
                    index,
                    name: upload.name.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(BatchResponse {
            items,
            errors,
            truncated,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Remote(RemoteConfig),
    Local(LocalConfig),
}

/// Settings for the in-process backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// fastembed image model name; CLIP ViT-B/32 when unset.
    #[serde(default)]
    pub image_model: Option<String>,
    /// fastembed text model sharing the image model's vector space.
    #[serde(default)]
    pub text_model: Option<String>,
    /// JSON-lines vector file, one row per line. Falls back to the
    /// dataset's vector column.
    #[serde(default)]
    pub vectors: Option<PathBuf>,
    /// Linear projection model used as the backend's own projector.
    #[serde(default)]
    pub projection: Option<PathBuf>,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Loads the backend named by a JSON configuration file.
pub struct ConfigLoader {
    path: PathBuf,
    dataset: Arc<Dataset>,
    vector_column: Option<String>,
    scratch_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(
        path: PathBuf,
        dataset: Arc<Dataset>,
        vector_column: Option<String>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            path,
            dataset,
            vector_column,
            scratch_dir,
        }
    }

    #[cfg_attr(not(feature = "local-embeddings-fastembed"), allow(unused_variables))]
    async fn load_local(&self, config: LocalConfig, base: &Path) -> Result<Arc<dyn SearchBackend>> {
        let index = match (&config.vectors, &self.vector_column) {
            (Some(path), _) => VectorIndex::from_jsonl(&resolve(base, path))?,
            (None, Some(column)) => VectorIndex::from_dataset(&self.dataset, column)?,
            (None, None) => anyhow::bail!(
                "local backend needs a 'vectors' file or a dataset vector column"
            ),
        };
        let projection = config
            .projection
            .as_ref()
            .map(|p| LinearProjection::load(&resolve(base, p)))
            .transpose()?;

        #[cfg(feature = "local-embeddings-fastembed")]
        {
            let backend = local::LocalBackend::load(
                config,
                index,
                projection,
                self.scratch_dir.clone(),
            )
            .await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        {
            anyhow::bail!(
                "Local search backend requires --features local-embeddings-fastembed"
            )
        }
    }
}

#[async_trait]
impl BackendLoader for ConfigLoader {
    async fn load(&self) -> Result<Arc<dyn SearchBackend>> {
        tracing::info!("Initializing search backend from {}", self.path.display());
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read backend config: {}", self.path.display()))?;
        let config: BackendConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backend config: {}", self.path.display()))?;
        let base = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        match config {
            BackendConfig::Remote(remote) => Ok(Arc::new(RemoteBackend::new(remote)?)),
            BackendConfig::Local(local) => self.load_local(local, &base).await,
        }
    }
}
