//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`CohereProvider`]** — calls the Cohere `/v1/embed` API with query/document input types.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API.
//!
//! Both remote providers batch requests and retry transient failures:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Also provides vector utilities used by the SQLite vector store:
//! [`cosine_similarity`], [`vec_to_blob`], and [`blob_to_vec`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;

const COHERE_EMBED_URL: &str = "https://api.cohere.com/v1/embed";
const OPENAI_EMBED_URL: &str = "https://api.openai.com/v1/embeddings";

/// What the embedded text will be used for. Cohere embeds queries and
/// documents into asymmetric spaces, so the distinction matters there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    SearchQuery,
    SearchDocument,
}

impl InputKind {
    pub fn cohere_input_type(&self) -> &'static str {
        match self {
            InputKind::SearchQuery => "search_query",
            InputKind::SearchDocument => "search_document",
        }
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"embed-english-v3.0"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts. Output order matches input order.
    async fn embed(&self, texts: &[String], kind: InputKind) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider
        .embed(&[text.to_string()], InputKind::SearchQuery)
        .await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

/// Exponential backoff delay before retry `attempt` (1-based).
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String], _kind: InputKind) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Remote providers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remote {
    Cohere,
    OpenAI,
}

/// Shared HTTP plumbing for the remote providers.
struct RemoteEmbedder {
    remote: Remote,
    url: String,
    model: String,
    dims: usize,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl RemoteEmbedder {
    fn from_env(remote: Remote, config: &EmbeddingConfig, key_var: &str) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow!("{} environment variable not set", key_var))?;
        let url = match remote {
            Remote::Cohere => COHERE_EMBED_URL,
            Remote::OpenAI => OPENAI_EMBED_URL,
        };
        Self::new(remote, url, config, api_key)
    }

    fn new(remote: Remote, url: &str, config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", config.provider))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", config.provider))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            remote,
            url: url.to_string(),
            model,
            dims,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed(&self, texts: &[String], kind: InputKind) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(batch, kind).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "Embedding response size mismatch: sent {}, got {}",
                    batch.len(),
                    vectors.len()
                );
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn embed_batch(&self, texts: &[String], kind: InputKind) -> Result<Vec<Vec<f32>>> {
        let body = match self.remote {
            Remote::Cohere => serde_json::json!({
                "model": self.model,
                "texts": texts,
                "input_type": kind.cohere_input_type(),
            }),
            Remote::OpenAI => serde_json::json!({
                "model": self.model,
                "input": texts,
            }),
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return match self.remote {
                            Remote::Cohere => parse_cohere_response(&json),
                            Remote::OpenAI => parse_openai_response(&json),
                        };
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "embedding request failed, retrying");
                        last_err = Some(anyhow!("Embedding API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("Embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "embedding request error, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

/// Embedding provider backed by Cohere. Requires `COHERE_API_KEY`.
pub struct CohereProvider {
    inner: RemoteEmbedder,
}

impl CohereProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            inner: RemoteEmbedder::from_env(Remote::Cohere, config, "COHERE_API_KEY")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for CohereProvider {
    fn model_name(&self) -> &str {
        &self.inner.model
    }
    fn dims(&self) -> usize {
        self.inner.dims
    }
    async fn embed(&self, texts: &[String], kind: InputKind) -> Result<Vec<Vec<f32>>> {
        self.inner.embed(texts, kind).await
    }
}

/// Embedding provider backed by OpenAI. Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    inner: RemoteEmbedder,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            inner: RemoteEmbedder::from_env(Remote::OpenAI, config, "OPENAI_API_KEY")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.inner.model
    }
    fn dims(&self) -> usize {
        self.inner.dims
    }
    async fn embed(&self, texts: &[String], kind: InputKind) -> Result<Vec<Vec<f32>>> {
        self.inner.embed(texts, kind).await
    }
}

fn json_to_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Parse a Cohere `/v1/embed` response (`embeddings: [[f32]]`).
fn parse_cohere_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("embeddings")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid Cohere response: missing embeddings array"))?;

    data.iter()
        .map(|item| {
            item.as_array()
                .map(|values| json_to_vec(values))
                .ok_or_else(|| anyhow!("Invalid Cohere response: embedding is not an array"))
        })
        .collect()
}

/// Parse an OpenAI embeddings response, ordering by `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_to_vec(embedding)));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"cohere"` | [`CohereProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "cohere" => Ok(Box::new(CohereProvider::new(config)?)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{closed_local_url, StubServer};

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_parse_cohere() {
        let json = serde_json::json!({ "embeddings": [[0.5, 1.0], [0.25, -1.0]] });
        let out = parse_cohere_response(&json).unwrap();
        assert_eq!(out, vec![vec![0.5, 1.0], vec![0.25, -1.0]]);
    }

    #[test]
    fn test_parse_openai_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(20), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let err = embed_query(&DisabledProvider, "hello").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_create_disabled() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert_eq!(provider.dims(), 0);
    }
    fn remote_config(max_retries: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "cohere".into(),
            model: Some("embed-english-v3.0".into()),
            dims: Some(2),
            batch_size: 2,
            max_retries,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_cohere_request_shape_and_batching() {
        let stub = StubServer::start().await.unwrap();
        stub.push(200, serde_json::json!({ "embeddings": [[1.0, 0.0], [0.0, 1.0]] }));
        stub.push(200, serde_json::json!({ "embeddings": [[0.5, 0.5]] }));
        let url = format!("{}/v1/embed", stub.base_url);
        let embedder =
            RemoteEmbedder::new(Remote::Cohere, &url, &remote_config(0), "co-key".into()).unwrap();

        let texts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let out = embedder.embed(&texts, InputKind::SearchDocument).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], vec![0.5, 0.5]);

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, "/v1/embed");
        assert_eq!(requests[0].headers["authorization"], "Bearer co-key");
        assert_eq!(requests[0].body["model"], "embed-english-v3.0");
        assert_eq!(requests[0].body["input_type"], "search_document");
        assert_eq!(requests[0].body["texts"], serde_json::json!(["a", "b"]));
        assert_eq!(requests[1].body["texts"], serde_json::json!(["c"]));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let stub = StubServer::start().await.unwrap();
        stub.push(500, serde_json::json!({ "message": "boom" }));
        stub.push(200, serde_json::json!({ "data": [{ "index": 0, "embedding": [0.25, 0.75] }] }));
        let embedder =
            RemoteEmbedder::new(Remote::OpenAI, &stub.base_url, &remote_config(1), "k".into())
                .unwrap();

        let out = embedder
            .embed(&["hello".to_string()], InputKind::SearchQuery)
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.25, 0.75]]);
        assert_eq!(stub.requests().len(), 2);
        assert_eq!(stub.requests()[1].body["input"], serde_json::json!(["hello"]));
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retry() {
        let stub = StubServer::start().await.unwrap();
        stub.push(400, serde_json::json!({ "message": "bad model" }));
        let embedder =
            RemoteEmbedder::new(Remote::Cohere, &stub.base_url, &remote_config(3), "k".into())
                .unwrap();

        let err = embedder
            .embed(&["hello".to_string()], InputKind::SearchQuery)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(stub.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_network_error_retries_then_fails() {
        let url = closed_local_url().unwrap();
        let embedder =
            RemoteEmbedder::new(Remote::Cohere, &url, &remote_config(1), "k".into()).unwrap();

        let started = std::time::Instant::now();
        let result = embedder
            .embed(&["hello".to_string()], InputKind::SearchQuery)
            .await;
        assert!(result.is_err());
        // One backoff sleep happened before the second attempt.
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
