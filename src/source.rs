//! Dataset loading and content identifiers.
//!
//! Inputs are JSON-array or JSON-lines files. Rows from every file are
//! concatenated; the union of their keys becomes the column set (first-seen
//! order), with missing values filled as nulls. Two bookkeeping columns are
//! added: [`SOURCE_DIR_COLUMN`] (each row's source directory, used to resolve
//! relative image paths and dropped before serving) and a `FILE_NAME` column
//! recording which input each row came from.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::{Cell, Column, Dataset, Table};

pub const SOURCE_DIR_COLUMN: &str = "__atlas_source_dir__";
pub const ROW_INDEX_COLUMN: &str = "_row_index";

fn read_rows(path: &Path) -> Result<Vec<serde_json::Map<String, Value>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;

    let values: Vec<Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON array: {}", path.display()))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("Failed to parse line {} of {}", n + 1, path.display())
                })
            })
            .collect::<Result<_>>()?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(n, value)| match value {
            Value::Object(map) => Ok(map),
            _ => bail!("row {} of {} is not a JSON object", n, path.display()),
        })
        .collect()
}

fn source_dir(path: &Path) -> Option<String> {
    let resolved = path.canonicalize().ok()?;
    let dir = if resolved.is_file() {
        resolved.parent()?.to_path_buf()
    } else {
        resolved
    };
    Some(dir.display().to_string())
}

/// Load and concatenate the given inputs into a single table.
pub fn load_datasets(inputs: &[PathBuf]) -> Result<Table> {
    let mut names: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut columns: Vec<Vec<Cell>> = Vec::new();
    let mut dirs: Vec<Cell> = Vec::new();
    let mut files: Vec<Cell> = Vec::new();
    let mut total = 0;

    for input in inputs {
        tracing::info!("Loading data from {}", input.display());
        let rows = read_rows(input)?;
        let dir = source_dir(input).map(Cell::Text).unwrap_or(Cell::Null);
        let file = Cell::Text(input.display().to_string());

        for row in rows {
            for (key, value) in row {
                let col = *index.entry(key.clone()).or_insert_with(|| {
                    names.push(key);
                    columns.push(vec![Cell::Null; total]);
                    columns.len() - 1
                });
                columns[col].push(Cell::from_json(value));
            }
            total += 1;
            for values in columns.iter_mut() {
                if values.len() < total {
                    values.push(Cell::Null);
                }
            }
            dirs.push(dir.clone());
            files.push(file.clone());
        }
    }

    let mut table = Table::new(
        names
            .into_iter()
            .zip(columns)
            .map(|(name, values)| Column::new(name, values))
            .collect(),
    );
    let file_column = table.unused_column_name("FILE_NAME");
    table.columns.push(Column::new(file_column, files));
    table.columns.push(Column::new(SOURCE_DIR_COLUMN, dirs));
    Ok(table)
}

/// Words from the `word` field of each row. Rows without a text `word`
/// are an error.
pub fn load_stop_words(path: &Path) -> Result<Vec<String>> {
    read_rows(path)?
        .into_iter()
        .enumerate()
        .map(|(n, row)| match row.get("word") {
            Some(Value::String(word)) => Ok(word.clone()),
            _ => bail!("row {} of {} has no text 'word' field", n, path.display()),
        })
        .collect()
}

/// Fixed view labels. Each row needs numeric `x` and `y` and a text `text`;
/// other fields such as `level` and `priority` pass through.
pub fn load_labels(path: &Path) -> Result<Vec<Value>> {
    read_rows(path)?
        .into_iter()
        .enumerate()
        .map(|(n, row)| {
            let valid = row.get("x").is_some_and(Value::is_number)
                && row.get("y").is_some_and(Value::is_number)
                && row.get("text").is_some_and(Value::is_string);
            if !valid {
                bail!("label {} of {} needs numeric x, y and a text field", n, path.display());
            }
            Ok(Value::Object(row))
        })
        .collect()
}

/// Attach a row identifier: either an existing unique column, or a fresh
/// `_row_index` column numbering rows from zero.
pub fn into_dataset(mut table: Table, id_column: Option<&str>) -> Result<Dataset> {
    if let Some(name) = id_column {
        let Some(column) = table.column(name) else {
            bail!("dataset.id_column '{}' not found in dataset", name);
        };
        let mut seen = std::collections::HashSet::new();
        for value in &column.values {
            if value.is_null() || !seen.insert(value.render()) {
                bail!("dataset.id_column '{}' must be unique and non-null", name);
            }
        }
        return Ok(Dataset {
            table,
            id_column: name.to_string(),
        });
    }

    let name = table.unused_column_name(ROW_INDEX_COLUMN);
    let ids = (0..table.num_rows() as i64).map(Cell::Int).collect();
    table.columns.push(Column::new(name.clone(), ids));
    tracing::info!("Assigned row id column '{}'", name);
    Ok(Dataset {
        table,
        id_column: name,
    })
}

/// Incremental SHA-256 over JSON-serializable parts.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, value: &impl serde::Serialize) -> &mut Self {
        // serde_json never fails on Value / String / Vec<String>.
        let encoded = serde_json::to_vec(value).unwrap_or_default();
        self.inner.update((encoded.len() as u64).to_le_bytes());
        self.inner.update(&encoded);
        self
    }

    pub fn hexdigest(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Content identifier namespacing cache and feedback storage.
pub fn dataset_identifier(inputs: &[PathBuf], metadata: &Value) -> String {
    let inputs: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
    let mut hasher = Hasher::new();
    hasher
        .update(&env!("CARGO_PKG_VERSION"))
        .update(&inputs)
        .update(metadata);
    hasher.hexdigest()
}
