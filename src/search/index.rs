//! Exact nearest-neighbor scan over an in-memory vector table.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;

use super::Neighbor;
use crate::models::{Cell, Dataset};

/// Cosine similarity; `0.0` for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Vector stored in a dataset cell: a JSON array, or text holding one.
pub fn cell_vector(cell: &Cell) -> Option<Vec<f32>> {
    match cell {
        Cell::Json(value) => parse_vector(value),
        Cell::Text(text) => parse_vector(&serde_json::from_str(text).ok()?),
        _ => None,
    }
}

/// One optional vector per dataset row, searched by brute force.
#[derive(Debug, Default)]
pub struct VectorIndex {
    vectors: Vec<Option<Vec<f32>>>,
}

impl VectorIndex {
    pub fn new(vectors: Vec<Option<Vec<f32>>>) -> Self {
        Self { vectors }
    }

    pub fn from_dataset(dataset: &Dataset, column: &str) -> Result<Self> {
        let Some(column) = dataset.table.column(column) else {
            bail!("vector column '{}' not found in dataset", column);
        };
        let vectors: Vec<Option<Vec<f32>>> = column.values.iter().map(cell_vector).collect();
        tracing::info!(
            rows = vectors.len(),
            with_vectors = vectors.iter().filter(|v| v.is_some()).count(),
            "vector index built from column '{}'",
            column.name
        );
        Ok(Self { vectors })
    }

    /// One JSON array per line, line `i` belonging to row `i`.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vector file: {}", path.display()))?;
        let mut vectors = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse line {} of {}", n + 1, path.display()))?;
            vectors.push(parse_vector(&value));
        }
        Ok(Self { vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&[f32]> {
        self.vectors.get(row)?.as_deref()
    }

    /// `k` closest rows by cosine distance, ascending.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut scored: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .filter_map(|(index, v)| {
                let v = v.as_deref()?;
                (v.len() == query.len()).then(|| Neighbor {
                    index,
                    distance: 1.0 - cosine_similarity(query, v),
                })
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Table};
    use serde_json::json;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_nearest_orders_by_distance() {
        let index = VectorIndex::new(vec![
            Some(vec![0.0, 1.0]),
            Some(vec![1.0, 0.0]),
            None,
            Some(vec![1.0, 1.0]),
        ]);
        let hits = index.nearest(&[1.0, 0.1], 2);
        assert_eq!(hits.iter().map(|h| h.index).collect::<Vec<_>>(), vec![1, 3]);
        assert!(hits[0].distance <= hits[1].distance);
        assert_eq!(index.nearest(&[1.0, 0.0], 10).len(), 3);
    }

    #[test]
    fn test_from_dataset_accepts_json_and_text() {
        let dataset = Dataset {
            table: Table::new(vec![
                Column::new("id", vec![Cell::Int(0), Cell::Int(1), Cell::Int(2)]),
                Column::new(
                    "vec",
                    vec![
                        Cell::Json(json!([1.0, 2.0])),
                        Cell::Text("[3, 4]".into()),
                        Cell::Null,
                    ],
                ),
            ]),
            id_column: "id".into(),
        };
        let index = VectorIndex::from_dataset(&dataset, "vec").unwrap();
        assert_eq!(index.get(1), Some(&[3.0f32, 4.0][..]));
        assert_eq!(index.get(2), None);
        assert!(VectorIndex::from_dataset(&dataset, "missing").is_err());
    }
}
