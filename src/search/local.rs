//! In-process backend: fastembed CLIP models plus an exact vector scan.
//!
//! Image and text models share one embedding space, so uploads and text
//! queries are comparable with the dataset's stored vectors. Inference runs
//! on the blocking pool; each model sits behind its own mutex since
//! fastembed sessions need exclusive access.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, TextEmbedding,
    TextInitOptions,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::{LocalConfig, Neighbor, SearchBackend, VectorIndex};
use crate::projection::LinearProjection;

pub struct LocalBackend {
    image: Arc<Mutex<ImageEmbedding>>,
    text: Arc<Mutex<TextEmbedding>>,
    index: Arc<VectorIndex>,
    projection: Option<LinearProjection>,
    scratch_dir: PathBuf,
}

impl LocalBackend {
    pub async fn load(
        config: LocalConfig,
        index: VectorIndex,
        projection: Option<LinearProjection>,
        scratch_dir: PathBuf,
    ) -> Result<Self> {
        let image_model = match &config.image_model {
            Some(name) => name.parse::<ImageEmbeddingModel>().map_err(|e| anyhow!("{}", e))?,
            None => ImageEmbeddingModel::ClipVitB32,
        };
        let text_model = match &config.text_model {
            Some(name) => name.parse::<EmbeddingModel>().map_err(|e| anyhow!("{}", e))?,
            None => EmbeddingModel::ClipVitB32,
        };

        let (image, text) = tokio::task::spawn_blocking(move || -> Result<_> {
            let image = ImageEmbedding::try_new(ImageInitOptions::new(image_model))
                .map_err(|e| anyhow!("Failed to initialize image model: {}", e))?;
            let text = TextEmbedding::try_new(TextInitOptions::new(text_model))
                .map_err(|e| anyhow!("Failed to initialize text model: {}", e))?;
            Ok((image, text))
        })
        .await??;

        tracing::info!(vectors = index.len(), "local search backend loaded");
        Ok(Self {
            image: Arc::new(Mutex::new(image)),
            text: Arc::new(Mutex::new(text)),
            index: Arc::new(index),
            projection,
            scratch_dir,
        })
    }
}

/// Upload staged on disk for the image model; removed on drop.
struct StagedUpload(PathBuf);

impl Drop for StagedUpload {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl SearchBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let staged = StagedUpload(
            self.scratch_dir
                .join(format!(".upload-{}.img", uuid::Uuid::new_v4())),
        );
        tokio::fs::write(&staged.0, bytes).await?;
        let model = self.image.clone();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("image model lock poisoned"))?;
            let vectors = model
                .embed(vec![&staged.0], None)
                .map_err(|e| anyhow!("Local image embedding failed: {}", e))?;
            vectors
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("image embedding returned no vectors"))
        })
        .await?
    }

    async fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.text.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("text model lock poisoned"))?;
            let vectors = model
                .embed(vec![text], None)
                .map_err(|e| anyhow!("Local text embedding failed: {}", e))?;
            vectors
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("text embedding returned no vectors"))
        })
        .await?
    }

    async fn find_nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let index = self.index.clone();
        let vector = vector.to_vec();
        Ok(tokio::task::spawn_blocking(move || index.nearest(&vector, k)).await?)
    }

    async fn project_vector(&self, vector: &[f32]) -> Result<Option<(f64, f64)>> {
        Ok(self.projection.as_ref().and_then(|p| p.project(vector)))
    }
}
