//! Write the static archive to disk without starting the server.
//!
//! Produces the same zip as `GET /data/archive.zip`: the frontend bundle,
//! the dataset as Parquet, a static descriptor, image assets, and the
//! dataset's cache and feedback directories.

use anyhow::{Context, Result};
use std::path::Path;

use crate::app::Atlas;
use crate::config::Config;

/// Build the archive and write it to `output`, creating parent directories.
pub async fn run_export(config: &Config, output: &Path) -> Result<()> {
    let owned = config.clone();
    let atlas = tokio::task::spawn_blocking(move || Atlas::from_config(&owned)).await??;

    let bytes = atlas.export_archive().await?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write archive: {}", output.display()))?;

    tracing::info!(
        identifier = %atlas.store.identifier(),
        size = bytes.len(),
        "archive written to {}",
        output.display()
    );
    Ok(())
}
