//! Ad-hoc query proxy over the served dataset.
//!
//! The dataset is loaded into a single in-memory SQLite database, registered
//! as the table `dataset`, on the first query. Clients send `{sql, type}`
//! requests (`exec`, `arrow`, `json`) or ask for a filtered export of the
//! dataset (a *selection*) in one of four file formats.
//!
//! Free-form selection predicates pass a textual denylist before they reach
//! the engine. The filter is best-effort; structured [`FilterClause`]s, which
//! compile to a parameterized query, are the safe interface.

use serde::Deserialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Executor, Row, Sqlite, Statement, TypeInfo, ValueRef};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use arrow_schema::DataType;

use crate::encode;
use crate::models::{Cell, Column, Dataset, Table};
use crate::workers::{PoolClosed, WorkerPool};

pub const DATASET_TABLE: &str = "dataset";

const DENIED_TOKENS: &[&str] = &[";", "--", "/*", "*/"];
const DENIED_KEYWORDS: &[&str] = &[
    "ATTACH", "DETACH", "COPY", "EXPORT", "IMPORT", "INSTALL", "LOAD", "PRAGMA", "CREATE", "DROP",
    "ALTER", "INSERT", "UPDATE", "DELETE", "REPLACE", "VACUUM",
];

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("predicate rejected: {0}")]
    Unsafe(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("query failed: {0}")]
    Engine(#[from] sqlx::Error),
    #[error("failed to encode result: {0:#}")]
    Encode(#[from] anyhow::Error),
    #[error(transparent)]
    Closed(#[from] PoolClosed),
}

impl QueryError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, QueryError::Unsafe(_) | QueryError::Invalid(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Exec,
    Arrow,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(rename = "type")]
    pub mode: QueryMode,
}

pub enum QueryOutput {
    /// `exec` mode; serialized as `{}`.
    Empty,
    /// Arrow IPC stream.
    Arrow(Vec<u8>),
    /// JSON array of row objects.
    Json(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionFormat {
    Json,
    Jsonl,
    Csv,
    Parquet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "not_null")]
    NotNull,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Like => "LIKE",
            FilterOp::IsNull => "IS NULL",
            FilterOp::NotNull => "IS NOT NULL",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::NotNull)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionRequest {
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub filters: Option<Vec<FilterClause>>,
    pub format: SelectionFormat,
}

/// Reject predicates containing statement separators, comments, or
/// keywords that change state. Keywords match as whole words, any case.
pub fn check_predicate(predicate: &str) -> Result<(), QueryError> {
    for token in DENIED_TOKENS {
        if predicate.contains(token) {
            return Err(QueryError::Unsafe(format!("'{}' is not allowed", token)));
        }
    }
    let denied = predicate
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|word| {
            DENIED_KEYWORDS
                .iter()
                .any(|keyword| word.eq_ignore_ascii_case(keyword))
        });
    match denied {
        Some(word) => Err(QueryError::Unsafe(format!(
            "keyword '{}' is not allowed",
            word.to_ascii_uppercase()
        ))),
        None => Ok(()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(values: &[Cell]) -> &'static str {
    match encode::infer_type(values) {
        DataType::Boolean | DataType::Int64 => "INTEGER",
        DataType::Float64 => "REAL",
        DataType::Binary => "BLOB",
        _ => "TEXT",
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_cell<'q>(query: SqliteQuery<'q>, cell: &Cell) -> SqliteQuery<'q> {
    match cell {
        Cell::Null => query.bind(None::<String>),
        Cell::Bool(b) => query.bind(*b),
        Cell::Int(i) => query.bind(*i),
        Cell::Float(f) => query.bind(*f),
        Cell::Text(s) => query.bind(s.clone()),
        Cell::Bytes(b) => query.bind(b.clone()),
        Cell::Json(v) => query.bind(v.to_string()),
        Cell::Image(img) => query.bind(encode::image_png(img)),
    }
}

fn decode_row_value(row: &SqliteRow, index: usize) -> Result<Cell, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Cell::Null);
    }
    let kind = raw.type_info().name().to_string();
    let cell = match kind.as_str() {
        "INTEGER" | "BOOLEAN" => Cell::Int(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" | "NUMERIC" => Cell::Float(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => Cell::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => Cell::Text(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(cell)
}

fn rows_to_table(names: Vec<String>, rows: &[SqliteRow]) -> Result<Table, sqlx::Error> {
    let mut columns: Vec<Column> = names
        .into_iter()
        .map(|name| Column::new(name, Vec::with_capacity(rows.len())))
        .collect();
    for row in rows {
        for (index, column) in columns.iter_mut().enumerate() {
            column.values.push(decode_row_value(row, index)?);
        }
    }
    Ok(Table::new(columns))
}

/// Removes the staged file on every exit path.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

async fn open_engine(dataset: &Dataset) -> Result<SqlitePool, sqlx::Error> {
    // An in-memory database lives as long as its connection: keep exactly one,
    // forever.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    let table = &dataset.table;
    let definitions: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(&c.values)))
        .collect();
    if definitions.is_empty() {
        return Err(sqlx::Error::Protocol("dataset has no columns".into()));
    }
    sqlx::query(&format!(
        "CREATE TABLE {} ({})",
        DATASET_TABLE,
        definitions.join(", ")
    ))
    .execute(&pool)
    .await?;

    let placeholders = vec!["?"; table.columns.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", DATASET_TABLE, placeholders);
    let mut tx = pool.begin().await?;
    for row in 0..table.num_rows() {
        let mut query = sqlx::query(&insert);
        for column in &table.columns {
            query = bind_cell(query, &column.values[row]);
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(rows = table.num_rows(), "registered dataset with query engine");
    Ok(pool)
}

pub struct QueryProxy {
    dataset: Arc<Dataset>,
    engine: OnceCell<SqlitePool>,
    constructions: AtomicUsize,
    workers: WorkerPool,
    scratch_dir: PathBuf,
}

impl QueryProxy {
    pub fn new(dataset: Arc<Dataset>, workers: WorkerPool, scratch_dir: Option<&Path>) -> Self {
        Self {
            dataset,
            engine: OnceCell::new(),
            constructions: AtomicUsize::new(0),
            workers,
            scratch_dir: scratch_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    /// How many times the engine connection has been built (at most once on
    /// success).
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    async fn engine(&self) -> Result<&SqlitePool, QueryError> {
        let pool = self
            .engine
            .get_or_try_init(|| async {
                self.constructions.fetch_add(1, Ordering::SeqCst);
                open_engine(&self.dataset).await
            })
            .await?;
        Ok(pool)
    }

    async fn fetch_table(&self, sql: &str) -> Result<Table, QueryError> {
        let pool = self.engine().await?;
        let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
        let names = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => pool
                .prepare(sql)
                .await?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };
        Ok(rows_to_table(names, &rows)?)
    }

    pub async fn execute(&self, request: QueryRequest) -> Result<QueryOutput, QueryError> {
        tracing::debug!(mode = ?request.mode, sql = %request.sql, "query");
        if request.mode == QueryMode::Exec {
            self.workers
                .run(async {
                    let pool = self.engine().await?;
                    sqlx::raw_sql(&request.sql).execute(pool).await?;
                    Ok::<_, QueryError>(())
                })
                .await??;
            return Ok(QueryOutput::Empty);
        }

        let table = self.workers.run(self.fetch_table(&request.sql)).await??;
        let output = match request.mode {
            QueryMode::Arrow => QueryOutput::Arrow(
                self.workers
                    .run_blocking(move || encode::to_arrow_ipc(&table))
                    .await?,
            ),
            _ => QueryOutput::Json(
                self.workers
                    .run_blocking(move || {
                        let mut buf = Vec::new();
                        encode::write_json_array(&table, &mut buf)?;
                        Ok(buf)
                    })
                    .await?,
            ),
        };
        Ok(output)
    }

    fn compile_filters(&self, filters: &[FilterClause]) -> Result<(String, Vec<Cell>), QueryError> {
        let mut clauses = Vec::with_capacity(filters.len());
        let mut params = Vec::new();
        for filter in filters {
            if !self.dataset.table.has_column(&filter.column) {
                return Err(QueryError::Invalid(format!(
                    "unknown column '{}'",
                    filter.column
                )));
            }
            let column = quote_ident(&filter.column);
            if !filter.op.takes_value() {
                clauses.push(format!("{} {}", column, filter.op.sql()));
                continue;
            }
            let value = match &filter.value {
                Some(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => {
                    Cell::from_json(v.clone())
                }
                _ => {
                    return Err(QueryError::Invalid(format!(
                        "filter on '{}' needs a scalar value",
                        filter.column
                    )))
                }
            };
            clauses.push(format!("{} {} ?", column, filter.op.sql()));
            params.push(value);
        }
        Ok((clauses.join(" AND "), params))
    }

    async fn select_rows(&self, request: &SelectionRequest) -> Result<Table, QueryError> {
        match (&request.predicate, &request.filters) {
            (Some(_), Some(_)) => Err(QueryError::Invalid(
                "use either predicate or filters, not both".into(),
            )),
            (Some(predicate), None) => {
                check_predicate(predicate)?;
                self.fetch_table(&format!(
                    "SELECT * FROM {} WHERE {}",
                    DATASET_TABLE, predicate
                ))
                .await
            }
            (None, Some(filters)) if !filters.is_empty() => {
                let (clause, params) = self.compile_filters(filters)?;
                let sql = format!("SELECT * FROM {} WHERE {}", DATASET_TABLE, clause);
                let pool = self.engine().await?;
                let mut query = sqlx::query(&sql);
                for param in &params {
                    query = bind_cell(query, param);
                }
                let rows = query.fetch_all(pool).await?;
                Ok(rows_to_table(self.dataset.table.column_names(), &rows)?)
            }
            _ => {
                self.fetch_table(&format!("SELECT * FROM {}", DATASET_TABLE))
                    .await
            }
        }
    }

    /// Export the selected rows. The encoded output is staged in a scratch
    /// file which is always removed before returning.
    pub async fn export_selection(&self, request: SelectionRequest) -> Result<Vec<u8>, QueryError> {
        let table = self.workers.run(self.select_rows(&request)).await??;
        let format = request.format;
        let path = self
            .scratch_dir
            .join(format!(".selection-{}.tmp", uuid::Uuid::new_v4()));

        let bytes = self
            .workers
            .run_blocking(move || {
                let guard = TempFileGuard(path);
                let file = BufWriter::new(std::fs::File::create(&guard.0)?);
                match format {
                    SelectionFormat::Json => encode::write_json_array(&table, file)?,
                    SelectionFormat::Jsonl => encode::write_json_lines(&table, file)?,
                    SelectionFormat::Csv => encode::write_csv(&table, file)?,
                    SelectionFormat::Parquet => encode::write_parquet(&table, file)?,
                }
                Ok(std::fs::read(&guard.0)?)
            })
            .await?;
        tracing::debug!(?format, size = bytes.len(), "selection exported");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dataset() -> Arc<Dataset> {
        Arc::new(Dataset {
            table: Table::new(vec![
                Column::new("_row_index", (0..4).map(Cell::Int).collect()),
                Column::new(
                    "label",
                    vec![
                        Cell::Text("cat".into()),
                        Cell::Text("dog".into()),
                        Cell::Text("cat".into()),
                        Cell::Null,
                    ],
                ),
                Column::new(
                    "score",
                    vec![Cell::Float(0.5), Cell::Int(2), Cell::Float(1.5), Cell::Float(3.0)],
                ),
            ]),
            id_column: "_row_index".into(),
        })
    }

    fn proxy(scratch: &Path) -> QueryProxy {
        QueryProxy::new(dataset(), WorkerPool::new(4), Some(scratch))
    }

    fn request(sql: &str, mode: QueryMode) -> QueryRequest {
        QueryRequest {
            sql: sql.into(),
            mode,
        }
    }

    fn json_rows(output: QueryOutput) -> Value {
        match output {
            QueryOutput::Json(bytes) => serde_json::from_slice(&bytes).unwrap(),
            _ => panic!("expected json output"),
        }
    }

    #[test]
    fn test_safety_filter_accepts_plain_predicates() {
        assert!(check_predicate("label = 'cat' AND score > 1").is_ok());
        assert!(check_predicate("updated_at > 3").is_ok());
        assert!(check_predicate("label IN ('a', 'b')").is_ok());
    }

    #[test]
    fn test_safety_filter_rejects() {
        for bad in [
            "1=1; DROP TABLE dataset",
            "1=1 -- comment",
            "/* x */ 1=1",
            "label = 'x' OR attach = 1",
            "replace(label, 'a', 'b') = 'x'",
            "x = 1 AND Delete",
        ] {
            let err = check_predicate(bad);
            assert!(matches!(err, Err(QueryError::Unsafe(_))), "accepted {}", bad);
        }
    }

    #[test]
    fn test_request_parsing() {
        let req: QueryRequest =
            serde_json::from_value(json!({ "sql": "SELECT 1", "type": "arrow" })).unwrap();
        assert_eq!(req.mode, QueryMode::Arrow);
        assert!(serde_json::from_value::<QueryRequest>(json!({ "sql": "x", "type": "csv" })).is_err());

        let sel: SelectionRequest = serde_json::from_value(json!({
            "format": "csv",
            "filters": [{ "column": "label", "op": "=", "value": "cat" }, { "column": "score", "op": "not_null" }]
        }))
        .unwrap();
        assert_eq!(sel.filters.unwrap()[1].op, FilterOp::NotNull);
    }

    #[tokio::test]
    async fn test_json_and_exec_modes() {
        let tmp = TempDir::new().unwrap();
        let proxy = proxy(tmp.path());

        let rows = json_rows(
            proxy
                .execute(request(
                    "SELECT label, COUNT(*) AS n FROM dataset WHERE label IS NOT NULL GROUP BY label ORDER BY label",
                    QueryMode::Json,
                ))
                .await
                .unwrap(),
        );
        assert_eq!(rows, json!([{ "label": "cat", "n": 2 }, { "label": "dog", "n": 1 }]));

        let out = proxy
            .execute(request("CREATE TEMP TABLE t AS SELECT 1 AS a", QueryMode::Exec))
            .await
            .unwrap();
        assert!(matches!(out, QueryOutput::Empty));

        let rows = json_rows(
            proxy
                .execute(request("SELECT a FROM t WHERE a > 5", QueryMode::Json))
                .await
                .unwrap(),
        );
        assert_eq!(rows, json!([]));
    }

    #[tokio::test]
    async fn test_arrow_mode_returns_ipc_stream() {
        let tmp = TempDir::new().unwrap();
        let proxy = proxy(tmp.path());
        let out = proxy
            .execute(request("SELECT * FROM dataset", QueryMode::Arrow))
            .await
            .unwrap();
        let QueryOutput::Arrow(bytes) = out else {
            panic!("expected arrow output");
        };
        let reader =
            arrow_ipc::reader::StreamReader::try_new(std::io::Cursor::new(bytes), None).unwrap();
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_engine_error_is_reported() {
        let tmp = TempDir::new().unwrap();
        let proxy = proxy(tmp.path());
        let err = proxy
            .execute(request("SELECT * FROM missing_table", QueryMode::Json))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueryError::Engine(_)));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_selection_formats_and_cleanup() {
        let tmp = TempDir::new().unwrap();
        let proxy = proxy(tmp.path());

        let json = proxy
            .export_selection(SelectionRequest {
                predicate: Some("label = 'cat'".into()),
                filters: None,
                format: SelectionFormat::Json,
            })
            .await
            .unwrap();
        let rows: Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);

        let csv = proxy
            .export_selection(SelectionRequest {
                predicate: None,
                filters: None,
                format: SelectionFormat::Csv,
            })
            .await
            .unwrap();
        let csv = String::from_utf8(csv).unwrap();
        assert_eq!(csv.lines().next(), Some("_row_index,label,score"));
        assert_eq!(csv.lines().count(), 5);

        let jsonl = proxy
            .export_selection(SelectionRequest {
                predicate: None,
                filters: Some(vec![FilterClause {
                    column: "score".into(),
                    op: FilterOp::Ge,
                    value: Some(json!(1.5)),
                }]),
                format: SelectionFormat::Jsonl,
            })
            .await
            .unwrap();
        assert_eq!(String::from_utf8(jsonl).unwrap().lines().count(), 3);

        let parquet = proxy
            .export_selection(SelectionRequest {
                predicate: None,
                filters: Some(vec![FilterClause {
                    column: "label".into(),
                    op: FilterOp::IsNull,
                    value: None,
                }]),
                format: SelectionFormat::Parquet,
            })
            .await
            .unwrap();
        assert_eq!(&parquet[..4], b"PAR1");

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_selection_rejections_leave_no_files() {
        let tmp = TempDir::new().unwrap();
        let proxy = proxy(tmp.path());

        let err = proxy
            .export_selection(SelectionRequest {
                predicate: Some("1=1; DROP TABLE dataset".into()),
                filters: None,
                format: SelectionFormat::Csv,
            })
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let err = proxy
            .export_selection(SelectionRequest {
                predicate: None,
                filters: Some(vec![FilterClause {
                    column: "nope".into(),
                    op: FilterOp::Eq,
                    value: Some(json!(1)),
                }]),
                format: SelectionFormat::Csv,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Invalid(_)));

        let err = proxy
            .export_selection(SelectionRequest {
                predicate: Some("no_such_column = 1".into()),
                filters: None,
                format: SelectionFormat::Json,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Engine(_)));

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_engine_built_once_under_concurrency() {
        let tmp = TempDir::new().unwrap();
        let proxy = Arc::new(proxy(tmp.path()));
        assert_eq!(proxy.constructions(), 0);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let proxy = proxy.clone();
            handles.push(tokio::spawn(async move {
                proxy
                    .execute(request("SELECT COUNT(*) AS n FROM dataset", QueryMode::Json))
                    .await
                    .map(json_rows)
            }));
        }
        for handle in handles {
            let rows = handle.await.unwrap().unwrap();
            assert_eq!(rows, json!([{ "n": 4 }]));
        }
        assert_eq!(proxy.constructions(), 1);
    }
}
