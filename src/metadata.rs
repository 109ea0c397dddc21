//! The `metadata.json` descriptor read by the visualization client.
//!
//! The static part (column roles, image asset layout) is assembled once at
//! startup and hashed into the dataset identifier. Search endpoints are
//! attached afterwards, once the backend configuration is known, and the
//! `database` section is added per response from the configured
//! [`DatabaseMode`].

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::config::DatasetConfig;
use crate::image_assets::{IMAGE_RELATIVE_PATH, IMAGE_TOKEN_PREFIX};
use crate::source;

/// Where the client should run its queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseMode {
    /// In-browser engine loading `dataset.parquet`.
    Wasm,
    /// This server's `/data/query` endpoint.
    Server,
    /// External REST engine.
    Rest(String),
    /// External WebSocket engine.
    Socket(String),
}

impl DatabaseMode {
    pub fn parse(engine: &str) -> Result<Self> {
        match engine {
            "wasm" => Ok(DatabaseMode::Wasm),
            "server" => Ok(DatabaseMode::Server),
            uri if uri.starts_with("http") => Ok(DatabaseMode::Rest(uri.to_string())),
            uri if uri.starts_with("ws") => Ok(DatabaseMode::Socket(uri.to_string())),
            other => bail!("invalid query engine uri: {}", other),
        }
    }

    pub fn descriptor(&self) -> Value {
        match self {
            DatabaseMode::Wasm => json!({ "type": "wasm", "load": true }),
            DatabaseMode::Server => json!({ "type": "rest", "uri": "/data/query" }),
            DatabaseMode::Rest(uri) => json!({ "type": "rest", "uri": uri, "load": true }),
            DatabaseMode::Socket(uri) => json!({ "type": "socket", "uri": uri, "load": true }),
        }
    }
}

/// Build the descriptor's static part: `{props: {data, assets?}}`.
pub fn build_metadata(
    dataset: &DatasetConfig,
    id_column: &str,
    image_columns: &[String],
) -> Value {
    let mut data = Map::new();
    data.insert("id".into(), json!(id_column));
    for (key, value) in [
        ("x", &dataset.x),
        ("y", &dataset.y),
        ("neighbors", &dataset.neighbors),
        ("text", &dataset.text),
    ] {
        if let Some(column) = value {
            data.insert(key.into(), json!(column));
        }
    }

    let mut props = Map::new();
    props.insert("data".into(), Value::Object(data));
    if !image_columns.is_empty() {
        props.insert(
            "assets".into(),
            json!({
                "images": {
                    "tokenPrefix": IMAGE_TOKEN_PREFIX,
                    "relativePath": IMAGE_RELATIVE_PATH,
                    "columns": image_columns,
                }
            }),
        );
    }
    json!({ "props": props })
}

/// Add the optional embedding-view settings to `props`. Label and stop-word
/// files are read here, so a bad file fails startup.
pub fn apply_view_options(metadata: &mut Value, dataset: &DatasetConfig) -> Result<()> {
    let props = &mut metadata["props"];
    if let Some(size) = dataset.point_size {
        props["pointSize"] = json!(size);
    }
    if let Some(path) = &dataset.stop_words {
        props["stopWords"] = json!(source::load_stop_words(path)?);
    }
    if let Some(path) = &dataset.labels {
        props["labels"] = Value::Array(source::load_labels(path)?);
    }
    if let Some(column) = &dataset.label_column {
        props["labelColumn"] = json!(column);
    }
    Ok(())
}

/// Advertise the search endpoints once a backend is configured.
pub fn enable_search(metadata: &mut Value, point_neighbors: bool) {
    metadata["uploadSearch"] = json!({
        "enabled": true,
        "endpoint": "upload-neighbors",
        "batchEndpoint": "upload-embeddings",
    });
    let data = &mut metadata["props"]["data"];
    data["textSearchEndpoint"] = json!("text-neighbors");
    if point_neighbors {
        data["vectorNeighborsEndpoint"] = json!("point-neighbors");
    }
}

/// Descriptor as served: the stored document plus its `database` section.
pub fn with_database(metadata: &Value, mode: &DatabaseMode) -> Value {
    let mut out = metadata.clone();
    out["database"] = mode.descriptor();
    out
}

/// Descriptor written into a static archive.
pub fn static_metadata(metadata: &Value) -> Value {
    let mut out = with_database(metadata, &DatabaseMode::Wasm);
    out["isStatic"] = json!(true);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn dataset_config() -> DatasetConfig {
        DatasetConfig {
            inputs: vec![PathBuf::from("rows.jsonl")],
            id_column: None,
            text: Some("caption".into()),
            x: Some("proj_x".into()),
            y: Some("proj_y".into()),
            neighbors: None,
            vector: None,
            point_size: None,
            stop_words: None,
            labels: None,
            label_column: None,
        }
    }

    #[test]
    fn test_database_modes() {
        assert_eq!(DatabaseMode::parse("wasm").unwrap(), DatabaseMode::Wasm);
        assert_eq!(
            DatabaseMode::parse("server").unwrap().descriptor(),
            json!({ "type": "rest", "uri": "/data/query" })
        );
        assert_eq!(
            DatabaseMode::parse("ws://h:1").unwrap().descriptor(),
            json!({ "type": "socket", "uri": "ws://h:1", "load": true })
        );
        assert!(DatabaseMode::parse("ftp://x").is_err());
    }

    #[test]
    fn test_build_metadata_with_images() {
        let meta = build_metadata(&dataset_config(), "_row_index", &["img".to_string()]);
        assert_eq!(meta["props"]["data"]["id"], "_row_index");
        assert_eq!(meta["props"]["data"]["x"], "proj_x");
        assert!(meta["props"]["data"].get("neighbors").is_none());
        assert_eq!(meta["props"]["assets"]["images"]["tokenPrefix"], "ea://image/");
        assert_eq!(meta["props"]["assets"]["images"]["columns"], json!(["img"]));
    }

    #[test]
    fn test_view_options_pass_through() {
        let tmp = TempDir::new().unwrap();
        let stop_words = tmp.path().join("stop.jsonl");
        std::fs::write(&stop_words, "{\"word\": \"the\"}\n{\"word\": \"of\"}\n").unwrap();
        let labels = tmp.path().join("labels.json");
        std::fs::write(
            &labels,
            r#"[{"x": 1.5, "y": -2, "text": "cats", "level": 0, "priority": 3}]"#,
        )
        .unwrap();

        let mut config = dataset_config();
        config.point_size = Some(3.0);
        config.stop_words = Some(stop_words);
        config.labels = Some(labels);
        config.label_column = Some("topic".into());

        let mut meta = build_metadata(&config, "id", &[]);
        apply_view_options(&mut meta, &config).unwrap();
        let props = &meta["props"];
        assert_eq!(props["pointSize"], 3.0);
        assert_eq!(props["stopWords"], json!(["the", "of"]));
        assert_eq!(props["labels"][0]["text"], "cats");
        assert_eq!(props["labels"][0]["priority"], 3);
        assert_eq!(props["labelColumn"], "topic");
    }

    #[test]
    fn test_view_options_absent_and_invalid() {
        let mut meta = build_metadata(&dataset_config(), "id", &[]);
        apply_view_options(&mut meta, &dataset_config()).unwrap();
        for key in ["pointSize", "stopWords", "labels", "labelColumn"] {
            assert!(meta["props"].get(key).is_none(), "{}", key);
        }

        let tmp = TempDir::new().unwrap();
        let labels = tmp.path().join("labels.jsonl");
        std::fs::write(&labels, "{\"x\": 1, \"text\": \"no y\"}\n").unwrap();
        let mut config = dataset_config();
        config.labels = Some(labels);
        assert!(apply_view_options(&mut meta, &config).is_err());
    }

    #[test]
    fn test_enable_search() {
        let mut meta = build_metadata(&dataset_config(), "id", &[]);
        assert!(meta["props"].get("assets").is_none());
        enable_search(&mut meta, true);
        assert_eq!(meta["uploadSearch"]["batchEndpoint"], "upload-embeddings");
        assert_eq!(meta["props"]["data"]["textSearchEndpoint"], "text-neighbors");
        assert_eq!(meta["props"]["data"]["vectorNeighborsEndpoint"], "point-neighbors");
    }

    #[test]
    fn test_static_metadata() {
        let meta = static_metadata(&json!({ "props": {} }));
        assert_eq!(meta["isStatic"], true);
        assert_eq!(meta["database"], json!({ "type": "wasm", "load": true }));
    }
}
