//! Embedding clients used by ingestion and retrieval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Malformed embedding response: {0}")]
    Malformed(String),
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EmbeddingError::Api { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::DimensionMismatch { .. } | EmbeddingError::Malformed(_) => false,
        }
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError>;
}

pub type SharedEmbedder = Arc<dyn Embedder>;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<Arc<String>>,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(
        api_base: &str,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(32)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", api_base.trim_end_matches('/')),
            api_key: api_key.map(Arc::new),
            model,
            dimensions,
        })
    }
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbeddingError> {
        debug!("Requesting embedding for {} bytes", input.len());
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input,
            dimensions: self.dimensions,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<EmbeddingResponse>().await?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Malformed("no embedding data".to_string()))?;

        check_dimensions(&vector, self.dimensions)?;
        Ok(vector)
    }
}

pub fn check_dimensions(vector: &[f32], expected: usize) -> Result<(), EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

pub fn serialize_f32_le(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Returns `None` if the byte length is not a whole number of f32 values.
pub fn deserialize_f32_le(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
