//! Assembly of the serving components.
//!
//! [`Atlas`] owns one instance of each component and is shared by every
//! request handler through axum's `State`. Construction order:
//!
//! 1. load the inputs and attach row identifiers ([`crate::source`])
//! 2. tokenize image cells ([`crate::image_assets`]), drop provenance
//! 3. build the descriptor and hash it into the dataset identifier
//! 4. wire the asset store, query proxy, search orchestrator, and the
//!    range-addressable `dataset.parquet` blob

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::encode;
use crate::image_assets::extract_image_assets;
use crate::metadata::{apply_view_options, build_metadata, enable_search, DatabaseMode};
use crate::models::Dataset;
use crate::projection::LinearProjection;
use crate::query::QueryProxy;
use crate::range::BlobResource;
use crate::search::{BackendLoader, ConfigLoader, SearchOrchestrator, VectorIndex};
use crate::source::{self, SOURCE_DIR_COLUMN};
use crate::store::AssetStore;
use crate::workers::WorkerPool;

pub struct Atlas {
    pub store: Arc<AssetStore>,
    /// Present only when queries run on this server.
    pub query: Option<QueryProxy>,
    /// Present only when a search backend is configured.
    pub search: Option<SearchOrchestrator>,
    pub dataset_blob: BlobResource,
    pub database: DatabaseMode,
    pub static_dir: PathBuf,
    pub workers: WorkerPool,
}

impl Atlas {
    pub fn from_config(config: &Config) -> Result<Self> {
        let table = source::load_datasets(&config.dataset.inputs)?;
        let dataset = source::into_dataset(table, config.dataset.id_column.as_deref())?;
        Self::from_dataset(config, dataset, None)
    }

    /// Build from an already-loaded dataset. `loader` overrides the backend
    /// configured in `[search]`.
    pub fn from_dataset(
        config: &Config,
        mut dataset: Dataset,
        loader: Option<Arc<dyn BackendLoader>>,
    ) -> Result<Self> {
        let source_column = dataset
            .table
            .has_column(SOURCE_DIR_COLUMN)
            .then_some(SOURCE_DIR_COLUMN);

        let images = if config.images.enabled {
            extract_image_assets(&mut dataset, source_column, config.images.max_thumbnail)
        } else {
            Default::default()
        };
        dataset.table.drop_column(SOURCE_DIR_COLUMN);

        let image_columns: Vec<String> = images.columns.iter().cloned().collect();
        let mut metadata = build_metadata(&config.dataset, &dataset.id_column, &image_columns);
        apply_view_options(&mut metadata, &config.dataset)?;
        let identifier = source::dataset_identifier(&config.dataset.inputs, &metadata);
        tracing::info!(identifier = %identifier, rows = dataset.num_rows(), "dataset ready");

        let workers = WorkerPool::new(config.query.workers);
        let scratch_dir = config
            .query
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let dataset = Arc::new(dataset);

        let loader: Option<Arc<dyn BackendLoader>> = match (loader, &config.search.backend_config) {
            (Some(loader), _) => Some(loader),
            (None, Some(path)) => Some(Arc::new(ConfigLoader::new(
                path.clone(),
                dataset.clone(),
                config.dataset.vector.clone(),
                scratch_dir.clone(),
            ))),
            (None, None) => None,
        };

        let search = match loader {
            Some(loader) => {
                let point_vectors = match &config.dataset.vector {
                    Some(column) => match VectorIndex::from_dataset(&dataset, column) {
                        Ok(index) => Some(index),
                        Err(e) => {
                            tracing::warn!("point queries disabled: {:#}", e);
                            None
                        }
                    },
                    None => None,
                };
                let projection = config
                    .search
                    .projection_model
                    .as_deref()
                    .map(LinearProjection::load)
                    .transpose()?;
                enable_search(&mut metadata, point_vectors.is_some());
                Some(SearchOrchestrator::new(
                    loader,
                    dataset.clone(),
                    point_vectors,
                    projection,
                    config.search.clone(),
                    WorkerPool::new(config.search.max_concurrent),
                ))
            }
            None => None,
        };

        let database = DatabaseMode::parse(&config.query.engine)?;
        let query = config
            .query
            .is_server()
            .then(|| QueryProxy::new(dataset.clone(), workers.clone(), Some(&scratch_dir)));

        let blob_source = dataset.clone();
        let dataset_blob = BlobResource::new("application/octet-stream", workers.clone(), move || {
            encode::to_parquet_bytes(&blob_source.table)
        });

        let store = AssetStore::new(
            identifier,
            dataset,
            metadata,
            images.assets,
            &config.storage,
            config.archive.on_asset_error,
        );
        tracing::info!(images = store.image_count(), "asset store ready");

        Ok(Self {
            store: Arc::new(store),
            query,
            search,
            dataset_blob,
            database,
            static_dir: config.server.static_dir.clone(),
            workers,
        })
    }

    /// Build the static archive on the worker pool.
    pub async fn export_archive(&self) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let static_dir = self.static_dir.clone();
        self.workers
            .run_blocking(move || Ok(store.export_archive(&static_dir)?))
            .await
    }
}
