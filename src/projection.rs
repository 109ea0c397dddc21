//! Linear 2-D projection model.
//!
//! Places a query vector onto the visualization plane when the search
//! backend cannot project it itself. The model is a JSON document:
//!
//! ```json
//! { "mean": [0.1, ...], "components": [[...], [...]] }
//! ```
//!
//! `x = (v - mean) · components[0]`, `y = (v - mean) · components[1]`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct LinearProjection {
    #[serde(default)]
    mean: Vec<f32>,
    components: Vec<Vec<f32>>,
}

impl LinearProjection {
    pub fn new(mean: Vec<f32>, components: Vec<Vec<f32>>) -> Result<Self> {
        let projection = Self { mean, components };
        projection.validate()?;
        Ok(projection)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read projection model: {}", path.display()))?;
        let projection: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse projection model: {}", path.display()))?;
        projection.validate()?;
        tracing::info!(dims = projection.dims(), "loaded projection model from {}", path.display());
        Ok(projection)
    }

    fn validate(&self) -> Result<()> {
        if self.components.len() < 2 {
            bail!("projection model needs two components");
        }
        let dims = self.components[0].len();
        if dims == 0 || self.components[1].len() != dims {
            bail!("projection components must be non-empty and equally sized");
        }
        if !self.mean.is_empty() && self.mean.len() != dims {
            bail!("projection mean has {} dims, components have {}", self.mean.len(), dims);
        }
        Ok(())
    }

    pub fn dims(&self) -> usize {
        self.components[0].len()
    }

    /// `None` when the vector's dimensionality does not match the model.
    pub fn project(&self, vector: &[f32]) -> Option<(f64, f64)> {
        if vector.len() != self.dims() {
            return None;
        }
        let axis = |component: &[f32]| -> f64 {
            vector
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let centered = v - self.mean.get(i).copied().unwrap_or(0.0);
                    centered as f64 * component[i] as f64
                })
                .sum()
        };
        Some((axis(&self.components[0]), axis(&self.components[1])))
    }
}
