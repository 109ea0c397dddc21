use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// JSON-array or JSON-lines files, concatenated in order.
    pub inputs: Vec<PathBuf>,
    /// Existing column to use as row identifier. A fresh `_row_index`
    /// column is generated when unset.
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub neighbors: Option<String>,
    /// Column holding precomputed embedding vectors (enables point queries).
    #[serde(default)]
    pub vector: Option<String>,
    /// Point size in the embedding view. The UI picks one from density
    /// when unset.
    #[serde(default)]
    pub point_size: Option<f64>,
    /// JSON/JSON-lines rows with a `word` field, excluded from automatic labels.
    #[serde(default)]
    pub stop_words: Option<PathBuf>,
    /// JSON/JSON-lines rows with `x`, `y`, `text` and optionally `level`
    /// and `priority`, shown as fixed labels.
    #[serde(default)]
    pub labels: Option<PathBuf>,
    /// Column used for automatic cluster labels instead of `text`.
    #[serde(default)]
    pub label_column: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_feedback_root")]
    pub feedback_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            feedback_root: default_feedback_root(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(".atlas/cache")
}
fn default_feedback_root() -> PathBuf {
    PathBuf::from(".atlas/feedback")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_thumbnail")]
    pub max_thumbnail: u32,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_thumbnail: default_max_thumbnail(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_thumbnail() -> u32 {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// `server`, `wasm`, or an `http(s)://` / `ws(s)://` URI.
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Where selection exports stage their temporary files.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            workers: default_workers(),
            scratch_dir: None,
        }
    }
}

fn default_engine() -> String {
    "server".to_string()
}
fn default_workers() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Backend configuration document (JSON). Search is disabled when unset.
    #[serde(default)]
    pub backend_config: Option<PathBuf>,
    /// Fallback 2-D projection model (JSON), used when the backend has none.
    #[serde(default)]
    pub projection_model: Option<PathBuf>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_max_point_results")]
    pub max_point_results: usize,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_novelty_k")]
    pub novelty_k: usize,
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// In-flight backend calls. Kept apart from `query.workers` so slow
    /// searches cannot starve dataset, cache and archive requests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend_config: None,
            projection_model: None,
            max_results: default_max_results(),
            max_point_results: default_max_point_results(),
            batch_max: default_batch_max(),
            novelty_k: default_novelty_k(),
            default_k: default_k(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_results() -> usize {
    1000
}
fn default_max_point_results() -> usize {
    500
}
fn default_batch_max() -> usize {
    32
}
fn default_novelty_k() -> usize {
    10
}
fn default_k() -> usize {
    16
}
fn default_max_concurrent() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchivePolicy {
    /// Log the failing asset and keep going.
    #[default]
    Skip,
    /// Fail the whole export.
    Abort,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub on_asset_error: ArchivePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Frontend bundle served at `/` and copied into archives.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl QueryConfig {
    pub fn is_server(&self) -> bool {
        self.engine == "server"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.dataset.inputs.is_empty() {
        anyhow::bail!("dataset.inputs must list at least one file");
    }

    if config.images.max_thumbnail == 0 {
        anyhow::bail!("images.max_thumbnail must be > 0");
    }

    if config.query.workers == 0 {
        anyhow::bail!("query.workers must be >= 1");
    }

    match config.query.engine.as_str() {
        "server" | "wasm" => {}
        uri if uri.starts_with("http") || uri.starts_with("ws") => {}
        other => anyhow::bail!(
            "Unknown query engine: '{}'. Must be server, wasm, or an http/ws URI.",
            other
        ),
    }

    if let Some(size) = config.dataset.point_size {
        if !size.is_finite() || size <= 0.0 {
            anyhow::bail!("dataset.point_size must be a positive number, got {}", size);
        }
    }

    let search = &config.search;
    if search.max_results == 0 || search.max_point_results == 0 {
        anyhow::bail!("search.max_results and search.max_point_results must be >= 1");
    }
    if search.batch_max == 0 {
        anyhow::bail!("search.batch_max must be >= 1");
    }
    if search.novelty_k == 0 {
        anyhow::bail!("search.novelty_k must be >= 1");
    }
    if search.max_concurrent == 0 {
        anyhow::bail!("search.max_concurrent must be >= 1");
    }

    Ok(())
}
