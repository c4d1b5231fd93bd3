//! HTTP client for the local embedding model server.
//!
//! The model server exposes `POST {base_url}/api/embed` accepting
//! `{model, input: [..], truncate: true}` and returning
//! `{embeddings: [[f32]]}`. Every input text is prefixed with its task
//! prefix (`"search_document"` for stored chunks, `"search_query"` for
//! query text) before transmission, a requirement of the model
//! interface that applies on both the single and batch paths.
//!
//! # Retry Strategy
//!
//! - HTTP 5xx and transport errors (reset, EOF) → retryable, exponential
//!   backoff 1s, 2s; 3 attempts total. A spent budget surfaces as the
//!   terminal [`ModelError::RetriesExhausted`].
//! - HTTP 4xx → fatal, no retry.
//! - Vector count ≠ input count → fatal [`ModelError::IndexMismatch`].
//! - 60 s per-request budget → fatal [`ModelError::Timeout`].
//!
//! One [`ModelClient`] is constructed at startup and shared by `Arc`;
//! it owns a single keep-alive connection pool. The client adds no
//! artificial inter-request delays; backpressure comes from the
//! embedding pipeline's concurrency limit.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ModelError;

/// Task prefix for stored note chunks.
pub const TASK_PREFIX_DOCUMENT: &str = "search_document";
/// Task prefix for search query text.
pub const TASK_PREFIX_QUERY: &str = "search_query";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 1;
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Seam for embedding generation so the pipeline and search service can
/// be exercised with a scripted implementation in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, applying the task prefix to each.
    async fn embed_batch(
        &self,
        texts: &[String],
        task_prefix: &str,
    ) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Embed a single text. Implemented as a batch of one.
    async fn embed_one(&self, text: &str, task_prefix: &str) -> Result<Vec<f32>, ModelError> {
        let vectors = self.embed_batch(&[text.to_string()], task_prefix).await?;
        vectors.into_iter().next().ok_or(ModelError::IndexMismatch {
            sent: 1,
            received: 0,
        })
    }
}

/// Client for the embedding model HTTP server.
pub struct ModelClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl ModelClient {
    pub fn new(base_url: &str, model: &str, dims: usize) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ModelError::Fatal {
                status: 0,
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dims,
        })
    }

    /// Check whether the model server is reachable.
    pub async fn health(&self) -> bool {
        match self.http.get(&self.base_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn request_once(&self, input: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "truncate": true,
        });

        let resp = self
            .http
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if status.is_server_error() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ModelError::Retryable {
                status: Some(status.as_u16()),
                message,
            });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ModelError::Fatal {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: EmbedResponse = resp.json().await.map_err(|e| ModelError::Fatal {
            status: status.as_u16(),
            message: format!("invalid embed response: {e}"),
        })?;

        if parsed.embeddings.len() != input.len() {
            return Err(ModelError::IndexMismatch {
                sent: input.len(),
                received: parsed.embeddings.len(),
            });
        }

        Ok(parsed.embeddings)
    }
}

fn classify_transport(e: reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout
    } else {
        // Connection reset, refused, EOF: the server may come back.
        ModelError::Retryable {
            status: None,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for ModelClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        task_prefix: &str,
    ) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input: Vec<String> = texts
            .iter()
            .map(|t| format!("{task_prefix}: {t}"))
            .collect();

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = Duration::from_secs(BACKOFF_BASE_SECS << (attempt - 1));
                tokio::time::sleep(delay).await;
            }

            match self.request_once(&input).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "embed request failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // A spent retry budget is terminal; re-surfacing a retryable
        // error here would invite callers to loop again.
        Err(ModelError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            message: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }
}
