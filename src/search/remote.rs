//! HTTP search service client.
//!
//! The service exposes four JSON endpoints under its base URL:
//!
//! | Endpoint | Request | Response |
//! |----------|---------|----------|
//! | `POST /embed-image` | `{"image": "<base64>"}` | `{"vector": [...]}` |
//! | `POST /embed-text` | `{"text": "..."}` | `{"vector": [...]}` |
//! | `POST /search` | `{"vector": [...], "k": 16}` | `{"indices": [...], "distances": [...]}` |
//! | `POST /project` | `{"vector": [...]}` | `{"x": 0.1, "y": 0.2}` or `null` |
//!
//! A missing `/project` endpoint (404) means the service has no projector.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other 4xx → fail immediately
//! - network errors → retry

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Neighbor, SearchBackend};

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

#[derive(Deserialize)]
struct VectorResponse {
    vector: Vec<f32>,
}

#[derive(Deserialize)]
struct SearchResponse {
    indices: Vec<Option<i64>>,
    distances: Vec<f32>,
}

#[derive(Deserialize)]
struct PointResponse {
    x: f64,
    y: f64,
}

pub struct RemoteBackend {
    client: reqwest::Client,
    base: String,
    api_key: Option<String>,
    config: RemoteConfig,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            bail!("remote search url must be http(s): {}", config.url);
        }
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| anyhow::anyhow!("{} not set", var))?,
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            api_key,
            config,
        })
    }

    /// POST with retry. `Ok(None)` on 404.
    async fn post(&self, endpoint: &str, body: &Value) -> Result<Option<Value>> {
        let url = format!("{}/{}", self.base, endpoint);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_ms << (attempt - 1).min(5);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(Some(response.json().await?));
                    }
                    if status.as_u16() == 404 {
                        return Ok(None);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::debug!(attempt, %status, "search service error, retrying");
                        last_err = Some(anyhow::anyhow!(
                            "search service error {} on {}: {}",
                            status,
                            endpoint,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("search service error {} on {}: {}", status, endpoint, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", endpoint)))
    }

    async fn vector(&self, endpoint: &str, body: Value) -> Result<Vec<f32>> {
        let Some(value) = self.post(endpoint, &body).await? else {
            bail!("search service has no {} endpoint", endpoint);
        };
        let parsed: VectorResponse = serde_json::from_value(value)?;
        if parsed.vector.is_empty() {
            bail!("search service returned an empty vector");
        }
        Ok(parsed.vector)
    }
}

#[async_trait]
impl SearchBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        self.vector("embed-image", json!({ "image": STANDARD.encode(bytes) }))
            .await
    }

    async fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        self.vector("embed-text", json!({ "text": text })).await
    }

    async fn find_nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let Some(value) = self.post("search", &json!({ "vector": vector, "k": k })).await? else {
            bail!("search service has no search endpoint");
        };
        let parsed: SearchResponse = serde_json::from_value(value)?;
        Ok(parsed
            .indices
            .into_iter()
            .zip(parsed.distances)
            .filter_map(|(index, distance)| {
                let index = usize::try_from(index?).ok()?;
                Some(Neighbor { index, distance })
            })
            .collect())
    }

    async fn project_vector(&self, vector: &[f32]) -> Result<Option<(f64, f64)>> {
        match self.post("project", &json!({ "vector": vector })).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let point: PointResponse = serde_json::from_value(value)?;
                Ok(Some((point.x, point.y)))
            }
        }
    }
}
