//! Embedding provider abstraction and implementations.
//!
//! [`EmbeddingProvider`] maps a batch of texts to fixed-dimension vectors.
//! Backends, keyed by `embedding.provider`:
//!
//! | Key | Type | Notes |
//! |-----|------|-------|
//! | `hash` | [`HashProvider`] | offline feature hashing, the default |
//! | `openai` | [`HttpProvider`] | `POST https://api.openai.com/v1/embeddings`, key from `OPENAI_API_KEY` |
//! | `ollama` | [`HttpProvider`] | `POST {url}/api/embed` |
//! | `local` | `LocalProvider` | fastembed, behind the `local-embeddings` feature |
//! | `disabled` | [`DisabledProvider`] | every call fails |
//!
//! [`create_provider`] resolves the key once at startup; an unknown key is a
//! configuration error:
//!
//! ```rust
//! # use document_portal::config::EmbeddingConfig;
//! # use document_portal::embedding::create_provider;
//! let provider = create_provider(&EmbeddingConfig::default()).unwrap();
//! assert_eq!(provider.model_name(), "feature-hash");
//! ```
//!
//! HTTP backends retry HTTP 429, 5xx and transport errors with exponential
//! backoff (1s, 2s, 4s, ... capped at 32s) up to `embedding.max_retries`
//! times. Other 4xx responses fail at once. The ingestion pipeline itself
//! never retries a failed batch.

mod hash;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::EmbeddingConfig;
use crate::error::Error;

pub use hash::HashProvider;

/// Maps text to fixed-dimension vectors.
///
/// Implementations return exactly one vector per input, in input order,
/// each with [`dims`](EmbeddingProvider::dims) components.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Vector dimension, or 0 when unknown.
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in consecutive batches of at most `batch_size`.
///
/// Any provider error, or a batch answered with the wrong number of
/// vectors, becomes [`Error::EmbeddingFailure`].
pub async fn embed_batched(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> crate::error::Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for (batch_no, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        tracing::debug!(batch = batch_no, size = batch.len(), "embedding batch");
        let answered = provider
            .embed(batch)
            .await
            .map_err(|e| Error::EmbeddingFailure(format!("{:#}", e)))?;
        if answered.len() != batch.len() {
            return Err(Error::EmbeddingFailure(format!(
                "provider returned {} vectors for {} texts",
                answered.len(),
                batch.len()
            )));
        }
        vectors.extend(answered);
    }
    Ok(vectors)
}

pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> crate::error::Result<Vec<f32>> {
    let mut vectors = embed_batched(provider, &[text.to_string()], 1).await?;
    vectors
        .pop()
        .ok_or_else(|| Error::EmbeddingFailure("empty embedding response".into()))
}

/// Rejects every call; selected with `provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding provider is disabled")
    }
}

// ============ HTTP backends ============

#[derive(Debug, Clone)]
enum Backend {
    OpenAi { api_key: String },
    Ollama { base_url: String },
}

impl Backend {
    fn label(&self) -> &'static str {
        match self {
            Backend::OpenAi { .. } => "OpenAI",
            Backend::Ollama { .. } => "Ollama",
        }
    }

    fn endpoint(&self) -> String {
        match self {
            Backend::OpenAi { .. } => "https://api.openai.com/v1/embeddings".to_string(),
            Backend::Ollama { base_url } => {
                format!("{}/api/embed", base_url.trim_end_matches('/'))
            }
        }
    }

    fn parse(&self, body: &Value) -> Result<Vec<Vec<f32>>> {
        match self {
            Backend::OpenAi { .. } => parse_openai_response(body),
            Backend::Ollama { .. } => parse_ollama_response(body),
        }
    }
}

/// Remote embedding service reached over HTTP (OpenAI or Ollama).
pub struct HttpProvider {
    backend: Backend,
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpProvider {
    /// OpenAI embeddings. Needs `model`, `dims` and `OPENAI_API_KEY`.
    pub fn openai(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::build(config, Backend::OpenAi { api_key })
    }

    /// Ollama embeddings. Needs `model` and `dims`; `url` defaults to the
    /// local daemon.
    pub fn ollama(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Self::build(config, Backend::Ollama { base_url })
    }

    fn build(config: &EmbeddingConfig, backend: Backend) -> Result<Self> {
        let label = backend.label();
        let model = config
            .model
            .clone()
            .with_context(|| format!("embedding.model required for the {} provider", label))?;
        let dims = config
            .dims
            .with_context(|| format!("embedding.dims required for the {} provider", label))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            backend,
            model,
            dims,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn post_once(&self, url: &str, body: &Value) -> Attempt {
        let mut request = self.client.post(url).json(body);
        if let Backend::OpenAi { api_key } = &self.backend {
            request = request.bearer_auth(api_key);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(anyhow!("connection error: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<Value>().await {
                Ok(json) => Attempt::Done(json),
                Err(e) => Attempt::Fatal(anyhow!("unreadable response body: {}", e)),
            };
        }
        let text = response.text().await.unwrap_or_default();
        let err = anyhow!("HTTP {}: {}", status, text);
        if status.as_u16() == 429 || status.is_server_error() {
            Attempt::Retry(err)
        } else {
            Attempt::Fatal(err)
        }
    }
}

enum Attempt {
    Done(Value),
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Delay before retry number `attempt` (1-based): 1s, 2s, 4s, ... 32s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt.max(1) - 1).min(5))
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let label = self.backend.label();
        let url = self.backend.endpoint();
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let mut attempt = 0;
        loop {
            match self.post_once(&url, &body).await {
                Attempt::Done(json) => return self.backend.parse(&json),
                Attempt::Fatal(e) => {
                    return Err(e.context(format!("{} embedding request failed", label)))
                }
                Attempt::Retry(e) if attempt >= self.max_retries => {
                    return Err(e.context(format!(
                        "{} embedding request failed after {} retries",
                        label, self.max_retries
                    )))
                }
                Attempt::Retry(e) => {
                    attempt += 1;
                    tracing::warn!(provider = label, attempt, error = %e, "retrying embedding request");
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

/// `None` unless `value` is an array of numbers.
fn float_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// `data[].embedding`, reordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .context("invalid OpenAI response: missing data array")?;

    let mut ordered: Vec<(usize, Vec<f32>)> = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let vector = item
                .get("embedding")
                .and_then(float_array)
                .context("invalid OpenAI response: missing or non-numeric embedding")?;
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .map_or(pos, |i| i as usize);
            Ok((index, vector))
        })
        .collect::<Result<_>>()?;
    ordered.sort_by_key(|(index, _)| *index);
    Ok(ordered.into_iter().map(|(_, v)| v).collect())
}

/// `embeddings[]`, already in input order.
fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .context("invalid Ollama response: missing embeddings array")?
        .iter()
        .map(|e| float_array(e).context("invalid Ollama response: embedding is not an array of numbers"))
        .collect()
}

// ============ Local (fastembed) ============

/// In-process inference via fastembed. The model is fetched from Hugging
/// Face on first use and cached afterwards.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (which, native_dims) = local_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(which))
            .map_err(|e| anyhow!("failed to initialise local embedding model: {}", e))?;
        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(native_dims),
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn local_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel::*;
    Ok(match name {
        "all-minilm-l6-v2" => (AllMiniLML6V2, 384),
        "bge-small-en-v1.5" => (BGESmallENV15, 384),
        "bge-base-en-v1.5" => (BGEBaseENV15, 768),
        "nomic-embed-text-v1.5" => (NomicEmbedTextV15, 768),
        other => bail!(
            "unknown local embedding model '{}' (expected all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5 or nomic-embed-text-v1.5)",
            other
        ),
    })
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("local embedding failed: {}", e))
        })
        .await?
    }
}

/// Resolve `embedding.provider` into a shared provider.
///
/// # Errors
///
/// Unknown keys, missing settings, a missing API key, or `local` without
/// the `local-embeddings` feature.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "hash" => Arc::new(HashProvider::new(
            config.dims.unwrap_or(hash::DEFAULT_DIMS),
        )),
        "openai" => Arc::new(HttpProvider::openai(config)?),
        "ollama" => Arc::new(HttpProvider::ollama(config)?),
        #[cfg(feature = "local-embeddings")]
        "local" => Arc::new(LocalProvider::new(config)?),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("the local embedding provider requires --features local-embeddings"),
        "disabled" => Arc::new(DisabledProvider),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(provider)
}
