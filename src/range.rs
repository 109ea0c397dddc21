//! Range-addressable immutable blobs.
//!
//! A [`BlobResource`] computes its bytes once, on first request, on the
//! worker pool, and serves `HEAD` and `GET` with single-range support:
//! `Range: bytes=start-end` (inclusive end) answers 206 with
//! `Content-Range`. Anything malformed or out of bounds falls back to the
//! full body with 200.

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::workers::WorkerPool;

/// Parse `bytes=start-end` against a body of `len` bytes.
///
/// Returns `(start, end_exclusive)` for a satisfiable range with
/// `start <= end < len`, else `None`.
pub fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let rest = header.trim_matches(' ').strip_prefix("bytes")?;
    let rest = rest.trim_start_matches(' ').strip_prefix('=')?;
    let (start, end) = rest.split_once('-')?;
    let (start, end) = (start.trim_matches(' '), end.trim_matches(' '));
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(start) || !digits(end) {
        return None;
    }
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse::<usize>().ok()?.checked_add(1)?;
    (start < end && end <= len).then_some((start, end))
}

type BlobFn = dyn Fn() -> Result<Vec<u8>> + Send + Sync;

pub struct BlobResource {
    content_type: &'static str,
    make: Arc<BlobFn>,
    blob: OnceCell<Bytes>,
    computations: AtomicUsize,
    workers: WorkerPool,
}

impl BlobResource {
    pub fn new<F>(content_type: &'static str, workers: WorkerPool, make: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            content_type,
            make: Arc::new(make),
            blob: OnceCell::new(),
            computations: AtomicUsize::new(0),
            workers,
        }
    }

    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    pub async fn content(&self) -> Result<Bytes> {
        let blob = self
            .blob
            .get_or_try_init(|| async {
                self.computations.fetch_add(1, Ordering::SeqCst);
                let make = self.make.clone();
                let bytes = self.workers.run_blocking(move || make()).await?;
                tracing::info!(size = bytes.len(), "blob materialized");
                Ok::<_, anyhow::Error>(Bytes::from(bytes))
            })
            .await?;
        Ok(blob.clone())
    }

    pub async fn head(&self, range: Option<&str>) -> Result<Response> {
        let content = self.content().await?;
        let length = match range.and_then(|r| parse_range(r, content.len())) {
            Some((start, end)) => end - start,
            None => content.len(),
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_LENGTH, length)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())?)
    }

    pub async fn get(&self, range: Option<&str>) -> Result<Response> {
        let content = self.content().await?;
        let total = content.len();
        let response = match range.and_then(|r| parse_range(r, total)) {
            Some((start, end)) => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, self.content_type)
                .header(header::CONTENT_LENGTH, end - start)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end - 1, total),
                )
                .body(Body::from(content.slice(start..end)))?,
            None => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, self.content_type)
                .header(header::CONTENT_LENGTH, total)
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from(content))?,
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> BlobResource {
        BlobResource::new("application/octet-stream", WorkerPool::new(2), move || {
            Ok((0..len).map(|i| i as u8).collect())
        })
    }

    async fn body(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 10)));
        assert_eq!(parse_range(" bytes = 5 - 5 ", 100), Some((5, 6)));
        assert_eq!(parse_range("bytes=99-99", 100), Some((99, 100)));
        assert_eq!(parse_range("bytes=90-150", 100), None);
        assert_eq!(parse_range("bytes=10-5", 100), None);
        assert_eq!(parse_range("bytes=-5", 100), None);
        assert_eq!(parse_range("bytes=5-", 100), None);
        assert_eq!(parse_range("bytes=0-1,4-5", 100), None);
        assert_eq!(parse_range("items=0-9", 100), None);
    }

    #[tokio::test]
    async fn test_partial_content() {
        let resource = blob(100);
        let response = resource.get(Some("bytes=0-9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/100");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert_eq!(body(response).await, (0..10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_out_of_bounds_returns_full_body() {
        let resource = blob(100);
        let response = resource.get(Some("bytes=90-150")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body(response).await.len(), 100);

        let response = resource.get(None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await.len(), 100);
    }

    #[tokio::test]
    async fn test_head_and_memoization() {
        let resource = blob(64);
        let response = resource.head(None).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "64");
        let response = resource.head(Some("bytes=4-7")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        resource.get(None).await.unwrap();
        assert_eq!(resource.computations(), 1);
    }
}
