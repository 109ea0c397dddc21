//! Asset store: the served dataset and everything persisted next to it.
//!
//! Storage is namespaced by the dataset identifier:
//!
//! ```text
//! <cache_root>/<identifier>/<name>                      JSON cache entries
//! <feedback_root>/<identifier>/<topic>.jsonl            feedback records
//! <feedback_root>/<identifier>/<topic>.summary.jsonl    flattened rows
//! <feedback_root>/<identifier>/query-images/<id>/<file> attached images
//! ```
//!
//! [`AssetStore::export_archive`] bundles all of it, plus the static frontend
//! and resolved image assets, into a self-contained ZIP.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::{ArchivePolicy, StorageConfig};
use crate::encode;
use crate::image_assets::{
    decode_data_uri, detect_image_type, is_path_segment, ImageAssets, ImageError,
    ResolvedImage, IMAGE_RELATIVE_PATH,
};
use crate::metadata::static_metadata;
use crate::models::Dataset;

const QUERY_IMAGES_DIR: &str = "query-images";
const SUMMARY_SUFFIX: &str = ".summary";
/// Archive directory owned by the generated entries.
const ARCHIVE_DATA_DIR: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("feedback record must be a JSON object")]
    NotAnObject,
    #[error("queryImages[{0}] is not a decodable image")]
    InvalidQueryImage(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Encode(#[from] anyhow::Error),
}

impl StoreError {
    /// True when the caller sent something unusable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidName(_) | StoreError::NotAnObject | StoreError::InvalidQueryImage(_)
        )
    }
}

/// Returned to the client after a feedback record is stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackReceipt {
    pub id: String,
    pub timestamp: String,
    pub topic: String,
    pub query_images: Vec<String>,
}

/// A single path component: non-empty, no separators, no `..`.
fn validate_name(name: &str) -> Result<(), StoreError> {
    if !is_path_segment(name) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Topic names also must not collide with another topic's summary file.
fn validate_topic(topic: &str) -> Result<(), StoreError> {
    validate_name(topic)?;
    if topic.ends_with(SUMMARY_SUFFIX) {
        return Err(StoreError::InvalidName(topic.to_string()));
    }
    Ok(())
}

pub struct AssetStore {
    identifier: String,
    dataset: Arc<Dataset>,
    metadata: Value,
    cache_dir: PathBuf,
    feedback_dir: PathBuf,
    images: ImageAssets,
    feedback_lock: Mutex<()>,
    policy: ArchivePolicy,
}

impl AssetStore {
    pub fn new(
        identifier: String,
        dataset: Arc<Dataset>,
        metadata: Value,
        images: ImageAssets,
        storage: &StorageConfig,
        policy: ArchivePolicy,
    ) -> Self {
        let cache_dir = storage.cache_root.join(&identifier);
        let feedback_dir = storage.feedback_root.join(&identifier);
        Self {
            identifier,
            dataset,
            metadata,
            cache_dir,
            feedback_dir,
            images,
            feedback_lock: Mutex::new(()),
            policy,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Descriptor without the `database` section.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn feedback_dir(&self) -> &Path {
        &self.feedback_dir
    }

    pub fn cache_get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_name(name)?;
        match std::fs::read(self.cache_dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a JSON document verbatim, replacing any previous value.
    pub fn cache_set(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cache_dir.join(name), bytes)?;
        tracing::debug!(name, size = bytes.len(), "cache entry written");
        Ok(())
    }

    /// Append one feedback record under `topic`.
    ///
    /// Images in a `queryImages` array are written to disk and replaced by
    /// their relative paths before the record line is stored.
    pub fn append_feedback(
        &self,
        topic: &str,
        record: Value,
    ) -> Result<FeedbackReceipt, StoreError> {
        validate_topic(topic)?;
        let Value::Object(mut record) = record else {
            return Err(StoreError::NotAnObject);
        };

        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339();
        let images = match record.get("queryImages") {
            Some(Value::Array(items)) => decode_query_images(items)?,
            _ => Vec::new(),
        };

        let _guard = self
            .feedback_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::create_dir_all(&self.feedback_dir)?;

        let mut stored = Vec::with_capacity(images.len());
        if !images.is_empty() {
            let dir = self.feedback_dir.join(QUERY_IMAGES_DIR).join(&id);
            std::fs::create_dir_all(&dir)?;
            for (filename, bytes) in &images {
                std::fs::write(dir.join(filename), bytes)?;
                stored.push(format!("{}/{}/{}", QUERY_IMAGES_DIR, id, filename));
            }
            record.insert(
                "queryImages".into(),
                Value::Array(stored.iter().cloned().map(Value::String).collect()),
            );
        }

        record.insert("recordId".into(), Value::String(id.clone()));
        record.insert("timestamp".into(), Value::String(timestamp.clone()));
        let record = Value::Object(record);

        append_line(&self.feedback_dir.join(format!("{}.jsonl", topic)), &record)?;
        let mut summary = Map::new();
        flatten_into(&mut summary, "", &record);
        append_line(
            &self.feedback_dir.join(format!("{}{}.jsonl", topic, SUMMARY_SUFFIX)),
            &Value::Object(summary),
        )?;

        tracing::info!(topic, record_id = %id, images = stored.len(), "feedback recorded");
        Ok(FeedbackReceipt {
            id,
            timestamp,
            topic: topic.to_string(),
            query_images: stored,
        })
    }

    /// `Ok(None)` when no such asset is registered.
    pub fn resolve_image(
        &self,
        column: &str,
        filename: &str,
    ) -> Result<Option<ResolvedImage>, ImageError> {
        match self.images.get(column).and_then(|files| files.get(filename)) {
            Some(asset) => asset.load().map(Some),
            None => Ok(None),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.values().map(|files| files.len()).sum()
    }

    /// Build the self-contained static archive.
    pub fn export_archive(&self, static_root: &Path) -> Result<Vec<u8>, StoreError> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        // The bundle's own `data/` entries would clash with the generated ones.
        add_tree(&mut zip, static_root, "", Some(ARCHIVE_DATA_DIR), options)?;

        zip.start_file("data/metadata.json", options)?;
        zip.write_all(&serde_json::to_vec(&static_metadata(&self.metadata))?)?;

        zip.start_file("data/dataset.parquet", options)?;
        encode::write_parquet(&self.dataset.table, &mut zip)?;

        add_tree(&mut zip, &self.cache_dir, "data/cache", None, options)?;
        add_tree(&mut zip, &self.feedback_dir, "data/feedback", None, options)?;

        let mut skipped = 0;
        for (column, files) in &self.images {
            for (filename, asset) in files {
                if !is_path_segment(column) || !is_path_segment(filename) {
                    tracing::warn!(column = %column, filename = %filename, "skipping image asset with unsafe name");
                    skipped += 1;
                    continue;
                }
                let resolved = match asset.load() {
                    Ok(resolved) => resolved,
                    Err(e) if self.policy == ArchivePolicy::Skip => {
                        tracing::warn!(column = %column, filename = %filename, "skipping image asset: {}", e);
                        skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let path = format!("data/{}/{}/{}", IMAGE_RELATIVE_PATH, column, filename);
                zip.start_file(path, options)?;
                zip.write_all(&resolved.bytes)?;
            }
        }

        let bytes = zip.finish()?.into_inner();
        tracing::info!(size = bytes.len(), skipped, "archive built");
        Ok(bytes)
    }
}

/// Decode every attached image up front so a bad item rejects the whole
/// record before anything is written.
fn decode_query_images(items: &[Value]) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let (name, data) = match item {
            Value::String(data) => (None, data.as_str()),
            Value::Object(map) => match map.get("data") {
                Some(Value::String(data)) => (map.get("name").and_then(Value::as_str), data.as_str()),
                _ => return Err(StoreError::InvalidQueryImage(index)),
            },
            _ => return Err(StoreError::InvalidQueryImage(index)),
        };
        let bytes = decode_data_uri(data).ok_or(StoreError::InvalidQueryImage(index))?;
        let mime = detect_image_type(&bytes).ok_or(StoreError::InvalidQueryImage(index))?;

        let extension = mime.trim_start_matches("image/").replace("jpeg", "jpg");
        let filename = name
            .and_then(|n| Path::new(n).file_name())
            .and_then(|n| n.to_str())
            .filter(|n| validate_name(n).is_ok())
            .map(|n| format!("{}-{}", index, n))
            .unwrap_or_else(|| format!("{}.{}", index, extension));
        out.push((filename, bytes));
    }
    Ok(out)
}

fn append_line(path: &Path, value: &Value) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

/// Nested keys joined with `.`; arrays collapse to their length.
fn flatten_into(out: &mut Map<String, Value>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(out, &key, inner);
            }
        }
        Value::Array(items) => {
            out.insert(prefix.to_string(), Value::from(items.len()));
        }
        scalar => {
            out.insert(prefix.to_string(), scalar.clone());
        }
    }
}

/// Copy every file under `root` into the archive below `prefix`, leaving out
/// anything under the top-level directory `exclude`. A missing root
/// contributes nothing.
fn add_tree<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    prefix: &str,
    exclude: Option<&str>,
    options: SimpleFileOptions,
) -> Result<(), StoreError> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if let Some(exclude) = exclude {
            if relative.starts_with(exclude) {
                tracing::debug!(path = %relative.display(), "static entry shadowed by generated data");
                continue;
            }
        }
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = if prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", prefix, relative)
        };
        zip.start_file(name, options)?;
        let mut file = std::fs::File::open(entry.path())?;
        std::io::copy(&mut file, zip)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_assets::ImageAsset;
    use crate::models::{Cell, Column, Table};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;

    const TINY_PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn store_with(tmp: &TempDir, images: ImageAssets, policy: ArchivePolicy) -> AssetStore {
        let dataset = Dataset {
            table: Table::new(vec![
                Column::new("_row_index", vec![Cell::Int(0), Cell::Int(1)]),
                Column::new("label", vec![Cell::Text("a".into()), Cell::Text("b".into())]),
            ]),
            id_column: "_row_index".into(),
        };
        let storage = StorageConfig {
            cache_root: tmp.path().join("cache"),
            feedback_root: tmp.path().join("feedback"),
        };
        AssetStore::new(
            "abc123".into(),
            Arc::new(dataset),
            json!({ "props": { "data": { "id": "_row_index" } } }),
            images,
            &storage,
            policy,
        )
    }

    fn store(tmp: &TempDir) -> AssetStore {
        store_with(tmp, BTreeMap::new(), ArchivePolicy::Skip)
    }

    fn read_entry(bytes: &[u8], name: &str) -> Option<Vec<u8>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).unwrap();
        Some(buf)
    }

    #[test]
    fn test_cache_roundtrip_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.cache_get("layout").unwrap().is_none());

        let doc = br#"{"b": 1,  "a": [1, 2]}"#;
        store.cache_set("layout", doc).unwrap();
        store.cache_set("layout", doc).unwrap();
        assert_eq!(store.cache_get("layout").unwrap().unwrap(), doc);

        store.cache_set("layout", b"{}").unwrap();
        assert_eq!(store.cache_get("layout").unwrap().unwrap(), b"{}");
        assert!(store.cache_dir().ends_with("abc123"));
    }

    #[test]
    fn test_cache_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        for bad in ["../escape", "a/b", "..", ""] {
            let err = store.cache_set(bad, b"{}").unwrap_err();
            assert!(err.is_client_error(), "{}", bad);
        }
    }

    #[test]
    fn test_feedback_append_and_summary() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let png = format!("data:image/png;base64,{}", STANDARD.encode(TINY_PNG));

        let receipt = store
            .append_feedback(
                "review",
                json!({
                    "rating": 4,
                    "case": { "label": "x", "tags": ["a", "b", "c"] },
                    "queryImages": [png, { "name": "../scan.png", "data": png }],
                }),
            )
            .unwrap();
        assert_eq!(receipt.query_images.len(), 2);
        assert!(receipt.query_images[1].ends_with("/1-scan.png"));
        for path in &receipt.query_images {
            assert_eq!(std::fs::read(store.feedback_dir().join(path)).unwrap(), TINY_PNG);
        }

        store.append_feedback("review", json!({ "rating": 2 })).unwrap();

        let log = std::fs::read_to_string(store.feedback_dir().join("review.jsonl")).unwrap();
        let lines: Vec<Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["recordId"], receipt.id.as_str());
        assert_eq!(lines[0]["queryImages"][0], receipt.query_images[0].as_str());

        let summary =
            std::fs::read_to_string(store.feedback_dir().join("review.summary.jsonl")).unwrap();
        let first: Value = serde_json::from_str(summary.lines().next().unwrap()).unwrap();
        assert_eq!(first["case.label"], "x");
        assert_eq!(first["case.tags"], 3);
        assert_eq!(first["queryImages"], 2);
    }

    #[test]
    fn test_feedback_rejects_bad_input() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(matches!(
            store.append_feedback("t", json!([1])),
            Err(StoreError::NotAnObject)
        ));
        assert!(matches!(
            store.append_feedback("t", json!({ "queryImages": ["data:image/png;base64,AAAA"] })),
            Err(StoreError::InvalidQueryImage(0))
        ));
        assert!(!store.feedback_dir().join("t.jsonl").exists());
    }

    #[test]
    fn test_feedback_topic_cannot_target_summary_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(matches!(
            store.append_feedback("x.summary", json!({ "a": 1 })),
            Err(StoreError::InvalidName(_))
        ));
        assert!(!store.feedback_dir().join("x.summary.jsonl").exists());
        assert!(store.append_feedback("x.summary-notes", json!({ "a": 1 })).is_ok());
    }

    #[test]
    fn test_archive_with_missing_directories() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let bytes = store.export_archive(&tmp.path().join("no-static")).unwrap();

        let meta: Value = serde_json::from_slice(&read_entry(&bytes, "data/metadata.json").unwrap()).unwrap();
        assert_eq!(meta["isStatic"], true);
        assert_eq!(meta["database"]["type"], "wasm");
        let parquet = read_entry(&bytes, "data/dataset.parquet").unwrap();
        assert_eq!(&parquet[..4], b"PAR1");
    }

    #[test]
    fn test_archive_includes_static_cache_and_images() {
        let tmp = TempDir::new().unwrap();
        let static_dir = tmp.path().join("static");
        std::fs::create_dir_all(static_dir.join("assets")).unwrap();
        std::fs::write(static_dir.join("index.html"), "<html/>").unwrap();
        std::fs::write(static_dir.join("assets/app.js"), "x").unwrap();

        let mut images: ImageAssets = BTreeMap::new();
        images
            .entry("img".into())
            .or_default()
            .insert("0.png".into(), ImageAsset::inline(TINY_PNG.to_vec(), "image/png"));
        let store = store_with(&tmp, images, ArchivePolicy::Skip);
        store.cache_set("state", b"{\"k\":1}").unwrap();

        let bytes = store.export_archive(&static_dir).unwrap();
        assert_eq!(read_entry(&bytes, "index.html").unwrap(), b"<html/>");
        assert_eq!(read_entry(&bytes, "assets/app.js").unwrap(), b"x");
        assert_eq!(read_entry(&bytes, "data/cache/state").unwrap(), b"{\"k\":1}");
        assert_eq!(read_entry(&bytes, "data/images/img/0.png").unwrap(), TINY_PNG);
    }

    #[test]
    fn test_archive_ignores_static_data_dir() {
        let tmp = TempDir::new().unwrap();
        let static_dir = tmp.path().join("static");
        std::fs::create_dir_all(static_dir.join("data")).unwrap();
        std::fs::write(static_dir.join("index.html"), "<html/>").unwrap();
        std::fs::write(static_dir.join("data/metadata.json"), "{\"stale\":true}").unwrap();
        std::fs::write(static_dir.join("database.js"), "x").unwrap();

        let bytes = store(&tmp).export_archive(&static_dir).unwrap();
        let meta: Value = serde_json::from_slice(&read_entry(&bytes, "data/metadata.json").unwrap()).unwrap();
        assert_eq!(meta["isStatic"], true);
        assert!(meta.get("stale").is_none());
        assert_eq!(read_entry(&bytes, "index.html").unwrap(), b"<html/>");
        assert_eq!(read_entry(&bytes, "database.js").unwrap(), b"x");
    }

    #[test]
    fn test_archive_entries_stay_inside_data_dir() {
        let tmp = TempDir::new().unwrap();
        let mut images: ImageAssets = BTreeMap::new();
        let files = images.entry("img".into()).or_default();
        for name in ["a/b.png", "../x.png", "ok.png"] {
            files.insert(name.into(), ImageAsset::inline(TINY_PNG.to_vec(), "image/png"));
        }
        images
            .entry("../img".into())
            .or_default()
            .insert("0.png".into(), ImageAsset::inline(TINY_PNG.to_vec(), "image/png"));

        let bytes = store_with(&tmp, images, ArchivePolicy::Abort)
            .export_archive(&tmp.path().join("no-static"))
            .unwrap();
        let archive = zip::ZipArchive::new(Cursor::new(&bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.iter().all(|n| !n.contains("..")), "{:?}", names);
        assert!(names.contains(&"data/images/img/ok.png"));
        assert!(!names.iter().any(|n| n.starts_with("data/images/img/a/")));
    }

    #[test]
    fn test_archive_policy_on_missing_image() {
        let tmp = TempDir::new().unwrap();
        let missing = || {
            let mut images: ImageAssets = BTreeMap::new();
            images
                .entry("img".into())
                .or_default()
                .insert("0.png".into(), ImageAsset::lazy(PathBuf::from("/nonexistent/0.png")));
            images
        };

        let skip = store_with(&tmp, missing(), ArchivePolicy::Skip);
        let bytes = skip.export_archive(tmp.path()).unwrap();
        assert!(read_entry(&bytes, "data/images/img/0.png").is_none());

        let abort = store_with(&tmp, missing(), ArchivePolicy::Abort);
        assert!(matches!(
            abort.export_archive(tmp.path()),
            Err(StoreError::Image(ImageError::Missing { .. }))
        ));
    }
}
