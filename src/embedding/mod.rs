//! Embedding backends.
//!
//! - **[`HashedProvider`]**: deterministic feature hashing, no network. Default.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed` endpoint.
//!
//! Use [`create_embedder`] to instantiate the configured backend.
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use policy_retrieval_core::embedding::{EmbeddingProvider, HashedEmbedder};

use crate::config::EmbeddingConfig;
use crate::error::{Result, RetrievalError};

/// An embedding backend that can vectorise text.
#[async_trait]
pub trait Embedder: EmbeddingProvider {
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::Embedding("empty embedding response".into()))
    }
}

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hashed" => Ok(Arc::new(HashedProvider::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => Err(RetrievalError::Config(format!(
            "Unknown embedding provider: '{}'",
            other
        ))),
    }
}

/// Embed `texts` in batches of `batch_size`, checking every vector's dimension.
pub async fn embed_all(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(RetrievalError::Embedding(format!(
                "{} returned {} vectors for {} texts",
                embedder.model_name(),
                vectors.len(),
                batch.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != embedder.dims()) {
            return Err(RetrievalError::Embedding(format!(
                "{} returned a {}-dimensional vector, expected {}",
                embedder.model_name(),
                bad.len(),
                embedder.dims()
            )));
        }
        out.extend(vectors);
    }
    Ok(out)
}

// ============ Hashed Provider ============

pub struct HashedProvider {
    inner: HashedEmbedder,
}

impl HashedProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            inner: HashedEmbedder::new(dims),
        }
    }
}

impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
}

#[async_trait]
impl Embedder for HashedProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.inner.embed(t)).collect())
    }
}

// ============ HTTP providers ============

/// POST `body` to `url`, retrying 429/5xx/network failures with backoff.
async fn post_json_with_retries(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::warn!(provider = label, attempt, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| RetrievalError::Embedding(format!("{} response: {}", label, e)));
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = RetrievalError::Embedding(format!("{} API error {}: {}", label, status, body_text));
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(RetrievalError::Embedding(format!("{} connection error: {}", label, e)));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| RetrievalError::Embedding(format!("{} embedding failed after retries", label))))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| RetrievalError::Config(format!("failed to build HTTP client: {}", e)))
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        RetrievalError::Config(format!(
            "embedding.model required for provider '{}'",
            config.provider
        ))
    })
}

fn parse_vectors(array: Option<&Vec<serde_json::Value>>, field: Option<&str>, label: &str) -> Result<Vec<Vec<f32>>> {
    let items = array.ok_or_else(|| RetrievalError::Embedding(format!("invalid {} response", label)))?;
    items
        .iter()
        .map(|item| {
            let values = match field {
                Some(f) => item.get(f),
                None => Some(item),
            }
            .and_then(|v| v.as_array())
            .ok_or_else(|| RetrievalError::Embedding(format!("invalid {} embedding", label)))?;
            Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

/// Embedding provider using the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(config)?,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[async_trait]
impl Embedder for OpenAIProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RetrievalError::Config("OPENAI_API_KEY not set".into()))?;
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json =
            post_json_with_retries(&self.client, &self.url, Some(&api_key), &body, self.max_retries, "OpenAI")
                .await?;

        // Results carry an `index`; sort so output order matches input order.
        let mut data = json
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        data.sort_by_key(|item| item.get("index").and_then(|i| i.as_u64()).unwrap_or(0));
        parse_vectors(Some(&data), Some("embedding"), "OpenAI")
    }
}

/// Embedding provider using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model: required_model(config)?,
            dims: config.dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[async_trait]
impl Embedder for OllamaProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json =
            post_json_with_retries(&self.client, &self.url, None, &body, self.max_retries, "Ollama").await?;
        parse_vectors(
            json.get("embeddings").and_then(|e| e.as_array()),
            None,
            "Ollama",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashed_provider_batches() {
        let e = HashedProvider::new(32);
        let texts: Vec<String> = (0..5).map(|i| format!("policy text {}", i)).collect();
        let vectors = embed_all(&e, &texts, 2).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert!(vectors.iter().all(|v| v.len() == 32));
        assert_eq!(e.embed_one("policy text 0").await.unwrap(), vectors[0]);
    }

    #[test]
    fn test_create_embedder_defaults_to_hashed() {
        let e = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(e.model_name(), "hashed-v1");
        assert_eq!(e.dims(), 384);
    }

    #[test]
    fn test_remote_providers_require_model() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_parse_ollama_vectors() {
        let json = serde_json::json!({ "embeddings": [[0.5, 1.0], [0.0, -1.0]] });
        let v = parse_vectors(json.get("embeddings").and_then(|e| e.as_array()), None, "Ollama").unwrap();
        assert_eq!(v, vec![vec![0.5, 1.0], vec![0.0, -1.0]]);
    }
}
