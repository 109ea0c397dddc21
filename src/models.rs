//! Core data models shared by every serving component.
//!
//! A [`Table`] is column-major: each [`Column`] owns one [`Cell`] per row.
//! The served [`Dataset`] is a table plus the name of its row-identifier
//! column. Query results coming back from the engine are plain tables too,
//! so the same encoders (JSON, CSV, Arrow, Parquet) serve both.

use image::DynamicImage;
use serde_json::Value;

/// A single dataset value.
///
/// JSON-sourced rows only produce `Null`, `Bool`, `Int`, `Float`, `Text` and
/// `Json`; `Bytes` and `Image` come from programmatic ingestion or the query
/// engine's BLOB results.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Nested object or array.
    Json(Value),
    /// An already-decoded image handle.
    Image(DynamicImage),
}

impl Cell {
    /// Convert a JSON value into a cell. Objects and arrays stay nested.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => Cell::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Cell::Text(s),
            other => Cell::Json(other),
        }
    }

    /// JSON rendering used by row-oriented encoders.
    ///
    /// Bytes and images have no JSON form; they render as their length in
    /// bytes tagged with a marker object so clients can tell them apart.
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Int(i) => Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Bytes(b) => serde_json::json!({ "$binary": b.len() }),
            Cell::Json(v) => v.clone(),
            Cell::Image(img) => {
                serde_json::json!({ "$image": [img.width(), img.height()] })
            }
        }
    }

    /// Plain-text rendering, used for CSV, filenames, and row-id lookup.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Text(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// True for values a heuristic "object" column may hold: anything that is
    /// not a plain number or boolean.
    pub fn is_object_like(&self) -> bool {
        matches!(
            self,
            Cell::Text(_) | Cell::Bytes(_) | Cell::Json(_) | Cell::Image(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Cell>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Cell>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// Column-major table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(pos))
    }

    /// Returns `candidate`, or `candidate_1`, `candidate_2`, … if taken.
    pub fn unused_column_name(&self, candidate: &str) -> String {
        if !self.has_column(candidate) {
            return candidate.to_string();
        }
        let mut index = 1;
        loop {
            let name = format!("{}_{}", candidate, index);
            if !self.has_column(&name) {
                return name;
            }
            index += 1;
        }
    }
}

/// The served dataset: a table with a designated row-identifier column.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub table: Table,
    pub id_column: String,
}

impl Dataset {
    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    /// Row-identifier cell for a row index.
    pub fn row_id(&self, row: usize) -> Option<&Cell> {
        self.table.column(&self.id_column)?.values.get(row)
    }

    /// Find the row whose identifier renders as `id`.
    pub fn find_row(&self, id: &str) -> Option<usize> {
        let column = self.table.column(&self.id_column)?;
        column.values.iter().position(|cell| cell.render() == id)
    }
}
