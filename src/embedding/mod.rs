//! Embedding backends.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`HashEmbedder`]**: deterministic feature hashing; offline, no model.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAiEmbedder`]**: the OpenAI `/v1/embeddings` API.
//! - **`LocalEmbedder`**: fastembed models run in-process (feature
//!   `local-embeddings`).
//!
//! Every call makes exactly one attempt bounded by `timeout_secs`. Retrying
//! is the indexing pipeline's decision, not the backend's.
//!
//! Also provides the vector helpers [`cosine_similarity`], [`vec_to_blob`]
//! and [`blob_to_vec`].

mod hash;
#[cfg(feature = "local-embeddings")]
mod local;

pub use hash::HashEmbedder;
#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Result, SearchError};

/// Turns batches of text into fixed-length vectors.
///
/// Implementations return exactly one vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded next to every vector it produces.
    fn model_id(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed one query string.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let vectors = embedder.embed(&[text.to_string()]).await?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| SearchError::embedding(embedder.model_id(), "empty embedding response"))
}

/// Check a backend response against the request: same count, expected dims.
pub fn check_batch(
    backend: &str,
    model: &str,
    dims: usize,
    requested: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != requested {
        return Err(SearchError::embedding(
            backend,
            format!("expected {} vectors, got {}", requested, vectors.len()),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(SearchError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
            model: model.to_string(),
        });
    }
    Ok(vectors)
}

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(hash::DEFAULT_DIMS),
        ))),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(SearchError::Config(
            "local embedding provider requires --features local-embeddings".to_string(),
        )),
        other => Err(SearchError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

fn http_client(timeout_secs: u64, backend: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SearchError::embedding(backend, e.to_string()))
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        SearchError::Config(format!(
            "embedding.model required for {} provider",
            config.provider
        ))
    })
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config.dims.ok_or_else(|| {
        SearchError::Config(format!(
            "embedding.dims required for {} provider",
            config.provider
        ))
    })
}

/// POST `body` to `url`, mapping transport failures and non-2xx statuses to
/// `EmbeddingUnavailable`.
async fn post_json(
    client: &reqwest::Client,
    backend: &str,
    timeout_secs: u64,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = client.post(url).json(body);
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = match tokio::time::timeout(Duration::from_secs(timeout_secs), request.send()).await
    {
        Err(_) => return Err(SearchError::embedding_timeout(backend, timeout_secs)),
        Ok(Err(e)) if e.is_timeout() => {
            return Err(SearchError::embedding_timeout(backend, timeout_secs))
        }
        Ok(Err(e)) => {
            return Err(SearchError::embedding(
                backend,
                format!("connection error at {}: {}", url, e),
            ))
        }
        Ok(Ok(r)) => r,
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SearchError::embedding(
            backend,
            format!("API error {}: {}", status, text),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| SearchError::embedding(backend, format!("invalid response body: {}", e)))
}

fn json_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ Ollama ============

/// Embedder backed by Ollama's `POST /api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs, "ollama")?,
            model: required_model(config)?,
            dims: required_dims(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            "ollama",
            self.timeout_secs,
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
        )
        .await?;
        let vectors = parse_ollama_response(&json)?;
        check_batch("ollama", &self.model, self.dims, texts.len(), vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| SearchError::embedding("ollama", "response missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            json_vector(e)
                .ok_or_else(|| SearchError::embedding("ollama", "embedding is not an array"))
        })
        .collect()
}

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API. Reads `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    timeout_secs: u64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            SearchError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self {
            client: http_client(config.timeout_secs, "openai")?,
            model: required_model(config)?,
            dims: required_dims(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            "openai",
            self.timeout_secs,
            &format!("{}/v1/embeddings", self.url.trim_end_matches('/')),
            Some(&self.api_key),
            &body,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_batch("openai", &self.model, self.dims, texts.len(), vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| SearchError::embedding("openai", "response missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(json_vector)
            .ok_or_else(|| SearchError::embedding("openai", "response item missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Vector helpers ============

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero or mismatched vectors.
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
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_check_batch_count_and_dims() {
        let err = check_batch("t", "m", 2, 2, vec![vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(err, SearchError::EmbeddingUnavailable { .. }));

        let err = check_batch("t", "m", 2, 1, vec![vec![1.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(
            err,
            SearchError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama_missing_field() {
        let json = serde_json::json!({ "error": "model not found" });
        assert!(parse_ollama_response(&json).is_err());
    }

    #[test]
    fn test_create_embedder_hash_default() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.model_id(), "hash-v1");
        assert_eq!(embedder.dims(), hash::DEFAULT_DIMS);
    }

    #[tokio::test]
    async fn test_stalled_ollama_times_out() {
        // accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(8),
            url: Some(format!("http://{}", addr)),
            timeout_secs: 1,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        server.abort();

        assert!(matches!(
            err,
            SearchError::EmbeddingUnavailable {
                timed_out: true,
                ..
            }
        ));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unreachable_ollama_is_unavailable() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(8),
            url: Some("http://127.0.0.1:9".into()),
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        let err = embedder.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, SearchError::EmbeddingUnavailable { .. }));
        assert!(!err.is_systemic());
    }
}
