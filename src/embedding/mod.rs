//! Embedding generation.
//!
//! Defines the [`EmbeddingProvider`] trait with OpenAI and Ollama
//! implementations, and the [`Embedder`] that batches chunk texts under
//! both a count cap and a total-character cap. When a provider rejects a
//! batch as too large the batch is split in half recursively; a single
//! over-long text is halved and its first half retried.
//!
//! Every vector is zero-padded to the fixed database dimension
//! (`embeddings.vectorDimension`). A model producing wider vectors is
//! rejected at startup. When no provider is configured or credentials are
//! missing, the store runs FTS-only: vector search is disabled with a
//! warning, nothing is fatal.
//!
//! Retry strategy (transient kinds only): 1s, 2s, 4s, 8s, 16s, 32s.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::{AppConfig, EmbeddingsConfig};
use crate::error::EmbedError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `text-embedding-3-small`.
    fn model_name(&self) -> &str;

    /// Embed a batch, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Parsed `provider:model` spec from `app.embeddingModel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, model) = raw.split_once(':')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

// ============ OpenAI ============

pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(model: &str, config: &EmbeddingsConfig) -> Result<Self, EmbedError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EmbedError::Auth("OPENAI_API_KEY not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| EmbedError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| EmbedError::Unreachable(err.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let payload = response.text().await.unwrap_or_default();
            return Err(classify_openai_error(status, &payload));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|err| EmbedError::Unreachable(err.to_string()))?;
        parse_openai_response(&json)
    }
}

/// Map the provider payload onto the error taxonomy once, here; retry logic
/// downstream branches only on the resulting kind.
fn classify_openai_error(status: u16, payload: &str) -> EmbedError {
    match status {
        401 | 403 => EmbedError::Auth(payload.to_string()),
        413 => EmbedError::SizeLimit,
        400 => {
            let code = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|v| {
                    v.get("error")?
                        .get("code")
                        .and_then(|c| c.as_str())
                        .map(str::to_string)
                });
            if code.as_deref() == Some("context_length_exceeded") {
                EmbedError::SizeLimit
            } else {
                EmbedError::Provider {
                    code: status,
                    message: payload.to_string(),
                }
            }
        }
        _ => EmbedError::Provider {
            code: status,
            message: payload.to_string(),
        },
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Provider {
            code: 200,
            message: "response lacks data array".to_string(),
        })?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Provider {
                code: 200,
                message: "response item lacks embedding".to_string(),
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vector);
    }
    Ok(embeddings)
}

// ============ Ollama ============

pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    url: String,
}

impl OllamaProvider {
    pub fn new(model: &str, config: &EmbeddingsConfig) -> Result<Self, EmbedError> {
        let url = std::env::var("OLLAMA_HOST")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| EmbedError::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            model: model.to_string(),
            url,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                EmbedError::Unreachable(format!("is Ollama running at {}? {}", self.url, err))
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let payload = response.text().await.unwrap_or_default();
            return Err(match status {
                413 => EmbedError::SizeLimit,
                _ => EmbedError::Provider {
                    code: status,
                    message: payload,
                },
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|err| EmbedError::Unreachable(err.to_string()))?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Provider {
                code: 200,
                message: "response lacks embeddings array".to_string(),
            })?;

        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let vector: Vec<f32> = embedding
                .as_array()
                .ok_or_else(|| EmbedError::Provider {
                    code: 200,
                    message: "embedding is not an array".to_string(),
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            result.push(vector);
        }
        Ok(result)
    }
}

pub fn create_provider(
    spec: &ModelSpec,
    config: &EmbeddingsConfig,
) -> Result<Box<dyn EmbeddingProvider>, EmbedError> {
    match spec.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(&spec.model, config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(&spec.model, config)?)),
        other => Err(EmbedError::Provider {
            code: 0,
            message: format!("unknown embedding provider: {}", other),
        }),
    }
}

// ============ Embedder ============

/// Batches, retries, splits, and pads on top of a provider.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    /// Database dimension D; every stored vector has exactly this length.
    dimension: usize,
    batch_size: usize,
    batch_chars: usize,
    max_retries: u32,
}

impl Embedder {
    /// Create and probe the configured provider. Returns `Ok(None)` (vector
    /// search disabled) when no model is configured or credentials are
    /// missing; fails only on a dimension overflow or an unusable spec.
    pub async fn init(app: &AppConfig, config: &EmbeddingsConfig) -> anyhow::Result<Option<Self>> {
        if app.embedding_model.is_empty() {
            tracing::warn!("no embedding model configured; vector search disabled");
            return Ok(None);
        }
        let spec = ModelSpec::parse(&app.embedding_model)
            .ok_or_else(|| anyhow::anyhow!("invalid embedding model spec: {}", app.embedding_model))?;

        let provider = match create_provider(&spec, config) {
            Ok(provider) => provider,
            Err(EmbedError::Auth(reason)) => {
                tracing::warn!(reason, "embedding credentials unavailable; vector search disabled");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let embedder = Self {
            provider,
            dimension: config.vector_dimension,
            batch_size: config.batch_size.max(1),
            batch_chars: config.batch_chars.max(1),
            max_retries: 5,
        };

        // probe the model dimension under its own timeout
        let probe = tokio::time::timeout(
            Duration::from_millis(config.init_timeout_ms),
            embedder.call_with_retry(std::slice::from_ref(&"dimension probe".to_string())),
        )
        .await;

        match probe {
            Ok(Ok(vectors)) => {
                let model_dims = vectors.first().map(Vec::len).unwrap_or(0);
                if model_dims > embedder.dimension {
                    return Err(EmbedError::Dimension {
                        model: model_dims,
                        database: embedder.dimension,
                    }
                    .into());
                }
                tracing::info!(
                    model = embedder.provider.model_name(),
                    dims = model_dims,
                    "embedding provider ready"
                );
                Ok(Some(embedder))
            }
            Ok(Err(EmbedError::Auth(reason))) => {
                tracing::warn!(reason, "embedding auth failed; vector search disabled");
                Ok(None)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                tracing::warn!("embedding provider init timed out; vector search disabled");
                Ok(None)
            }
        }
    }

    /// Test seam: wrap an arbitrary provider.
    pub fn with_provider(
        provider: Box<dyn EmbeddingProvider>,
        dimension: usize,
        batch_size: usize,
        batch_chars: usize,
    ) -> Self {
        Self {
            provider,
            dimension,
            batch_size: batch_size.max(1),
            batch_chars: batch_chars.max(1),
            max_retries: 2,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed chunk texts, preserving input order, each vector padded to the
    /// database dimension.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in self.partition(texts) {
            let embedded = self.embed_batch(batch).await?;
            for vector in embedded {
                vectors.push(self.pad(vector)?);
            }
        }
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let vectors = self
            .embed_batch(std::slice::from_ref(&text.to_string()))
            .await?;
        let vector = vectors.into_iter().next().ok_or(EmbedError::Provider {
            code: 200,
            message: "empty embedding response".to_string(),
        })?;
        self.pad(vector)
    }

    /// Split into batches capped by count and by total characters.
    fn partition<'a>(&self, texts: &'a [String]) -> Vec<&'a [String]> {
        let mut batches = Vec::new();
        let mut start = 0usize;
        let mut chars = 0usize;
        for (index, text) in texts.iter().enumerate() {
            let len = text.chars().count();
            let count = index - start;
            if count > 0 && (count >= self.batch_size || chars + len > self.batch_chars) {
                batches.push(&texts[start..index]);
                start = index;
                chars = 0;
            }
            chars += len;
        }
        if start < texts.len() {
            batches.push(&texts[start..]);
        }
        batches
    }

    /// Embed one batch, recursively halving on provider size-limit errors.
    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        match self.call_with_retry(batch).await {
            Ok(vectors) => Ok(vectors),
            Err(EmbedError::SizeLimit) if batch.len() > 1 => {
                let middle = batch.len() / 2;
                tracing::debug!(batch = batch.len(), "batch too large, splitting in half");
                let mut left = Box::pin(self.embed_batch(&batch[..middle])).await?;
                let right = Box::pin(self.embed_batch(&batch[middle..])).await?;
                left.extend(right);
                Ok(left)
            }
            Err(EmbedError::SizeLimit) => {
                // a single text the provider cannot take whole: halve the
                // text and retry the first half
                let text = &batch[0];
                let chars: Vec<char> = text.chars().collect();
                if chars.len() < 2 {
                    return Err(EmbedError::SizeLimit);
                }
                let half: String = chars[..chars.len() / 2].iter().collect();
                tracing::debug!(
                    original = chars.len(),
                    "single text exceeds provider limit, embedding first half"
                );
                Box::pin(self.embed_batch(std::slice::from_ref(&half))).await
            }
            Err(err) => Err(err),
        }
    }

    async fn call_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.provider.embed(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_retryable() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(EmbedError::Provider {
            code: 0,
            message: "embedding retries exhausted".to_string(),
        }))
    }

    /// Zero-pad to the database dimension; wider vectors are an error.
    fn pad(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
        if vector.len() > self.dimension {
            return Err(EmbedError::Dimension {
                model: vector.len(),
                database: self.dimension,
            });
        }
        vector.resize(self.dimension, 0.0);
        Ok(vector)
    }
}

/// The metadata header prepended to a chunk body for embedding. The stored
/// chunk content never includes it.
pub fn embedding_text(title: &str, url: &str, path: &[String], body: &str) -> String {
    format!(
        "<title>{}</title><url>{}</url><path>{}</path>\n{}",
        title,
        url,
        path.join(" / "),
        body
    )
}

// ============ Vector storage helpers ============

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
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

/// Cosine similarity in `[-1, 1]`; 0.0 for mismatched or empty inputs.
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider that rejects any call whose total characters exceed a limit.
    struct LimitedProvider {
        char_limit: usize,
        dims: usize,
        calls: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for LimitedProvider {
        fn model_name(&self) -> &str {
            "limited-test-model"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(texts.len());
            let total: usize = texts.iter().map(|t| t.chars().count()).sum();
            if total > self.char_limit {
                return Err(EmbedError::SizeLimit);
            }
            Ok(texts.iter().map(|_| vec![1.0; self.dims]).collect())
        }
    }

    fn embedder(char_limit: usize, dims: usize, database_dims: usize) -> Embedder {
        Embedder::with_provider(
            Box::new(LimitedProvider {
                char_limit,
                dims,
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }),
            database_dims,
            8,
            1_000_000,
        )
    }

    #[test]
    fn model_spec_parsing() {
        assert_eq!(
            ModelSpec::parse("openai:text-embedding-3-small"),
            Some(ModelSpec {
                provider: "openai".into(),
                model: "text-embedding-3-small".into()
            })
        );
        assert_eq!(ModelSpec::parse("no-colon"), None);
        assert_eq!(ModelSpec::parse(":model"), None);
    }

    #[test]
    fn blob_roundtrip() {
        let vector = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)), vector);
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn vectors_padded_to_database_dimension() {
        let embedder = embedder(10_000, 3, 8);
        let vectors = embedder
            .embed_documents(&["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0].len(), 8);
        assert_eq!(&vectors[0][..3], &[1.0, 1.0, 1.0]);
        assert_eq!(&vectors[0][3..], &[0.0; 5]);
    }

    #[tokio::test]
    async fn wider_model_rejected() {
        let embedder = embedder(10_000, 16, 8);
        let err = embedder
            .embed_documents(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::Dimension { model: 16, database: 8 }));
    }

    #[tokio::test]
    async fn oversized_batch_splits_in_half() {
        // four texts of 40 chars; provider takes at most 90 per call
        let texts: Vec<String> = (0..4).map(|i| format!("{:040}", i)).collect();
        let embedder = embedder(90, 2, 4);
        let vectors = embedder.embed_documents(&texts).await.unwrap();
        assert_eq!(vectors.len(), 4);
    }

    #[tokio::test]
    async fn single_long_text_halved() {
        let text = "x".repeat(300);
        let embedder = embedder(200, 2, 4);
        let vectors = embedder.embed_documents(&[text]).await.unwrap();
        // one vector still comes back, produced from the halved text
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 4);
    }

    #[test]
    fn partition_respects_both_caps() {
        let embedder = Embedder::with_provider(
            Box::new(LimitedProvider {
                char_limit: usize::MAX,
                dims: 2,
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }),
            4,
            2,   // batch_size
            100, // batch_chars
        );

        let texts: Vec<String> = vec![
            "a".repeat(60),
            "b".repeat(60), // splits here by chars
            "c".repeat(10),
            "d".repeat(10), // splits here by count
            "e".repeat(10),
        ];
        let batches = embedder.partition(&texts);
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert!(sizes.iter().all(|&s| s <= 2));
    }

    #[test]
    fn embedding_header_shape() {
        let text = embedding_text(
            "Guide",
            "https://x.test/guide",
            &["Guide".to_string(), "Install".to_string()],
            "body text",
        );
        assert!(text.starts_with(
            "<title>Guide</title><url>https://x.test/guide</url><path>Guide / Install</path>"
        ));
        assert!(text.ends_with("body text"));
    }
}
