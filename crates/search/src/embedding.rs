use std::env;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::error::{Result, SearchError};

/// Texts beyond this many characters are right-truncated before embedding.
pub const MAX_EMBED_CHARS: usize = 8000;

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

/// Capability mapping text to a fixed-dimension vector.
pub trait EmbeddingSink {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dim(&self) -> usize;
}

pub fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Retries retryable embed errors with exponential backoff before giving up.
pub fn embed_with_retry(sink: &dyn EmbeddingSink, text: &str, attempts: u32) -> Result<Vec<f32>> {
    let mut delay = Duration::from_millis(200);
    let mut last = None;
    for attempt in 0..attempts.max(1) {
        match sink.embed(text) {
            Ok(vector) => return Ok(vector),
            Err(e) if e.retryable() && attempt + 1 < attempts => {
                tracing::warn!("embed attempt {} failed, retrying: {e}", attempt + 1);
                std::thread::sleep(delay);
                delay *= 2;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(SearchError::Embed {
        message: "no attempts made".to_string(),
        retryable: false,
    }))
}

#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    /// Folded into the hash basis so distinct stores never share buckets.
    pub salt: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            salt: 0x9e37_79b9_7f4a_7c15,
        }
    }
}

/// Deterministic signed-feature-hashing embedder for offline builds and
/// tests. Each alphanumeric token lands in one bucket with a hash-derived
/// sign, so collisions tend to cancel instead of piling up. Not semantic;
/// the same text always maps to the same unit vector.
#[derive(Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    fn token_hash(&self, token: &str) -> u64 {
        let mut hash = FNV_OFFSET ^ self.config.salt;
        for byte in token.bytes() {
            hash ^= u64::from(byte.to_ascii_lowercase());
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
}

impl EmbeddingSink for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_for_embedding(text);
        let dims = self.config.dimensions.max(1);
        let mut vector = vec![0f32; dims];
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let hash = self.token_hash(token);
            let bucket = (hash % dims as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.config.dimensions
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    dim: usize,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| SearchError::Embed {
            message: "OPENAI_API_KEY is required for openai embeddings".to_string(),
            retryable: false,
        })?;
        let dim = if model.contains("3-large") {
            3072
        } else if model.contains("minilm") {
            384
        } else {
            1536
        };
        let http = Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| SearchError::Embed {
                message: format!("http client: {e}"),
                retryable: false,
            })?;
        Ok(Self {
            http,
            model: model.to_string(),
            api_key,
            dim,
        })
    }
}

impl EmbeddingSink for OpenAiEmbeddingClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_for_embedding(text);
        let payload = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        let response = self
            .http
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| SearchError::Embed {
                message: format!("request failed: {e}"),
                retryable: true,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Embed {
                message: format!("embeddings request failed: {status}"),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }
        let parsed: EmbeddingResponse = response.json().map_err(|e| SearchError::Embed {
            message: format!("bad response body: {e}"),
            retryable: false,
        })?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| SearchError::Embed {
                message: "no embedding returned".to_string(),
                retryable: false,
            })
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

/// Backend-selecting embedding client.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_env() -> Result<Self> {
        match env::var("PIXE_EMBEDDING_PROVIDER")
            .unwrap_or_else(|_| "hash".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => {
                let model = env::var("PIXE_EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string());
                Ok(Self {
                    backend: EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(&model)?),
                })
            }
            _ => {
                let mut config = HashEmbedderConfig::default();
                if let Some(dims) = env::var("PIXE_HASH_EMBED_DIMENSIONS")
                    .ok()
                    .and_then(|v| v.parse::<usize>().ok())
                {
                    config.dimensions = dims;
                }
                Ok(Self {
                    backend: EmbeddingBackend::Hash(HashEmbedder::new(config)),
                })
            }
        }
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
        }
    }
}

impl EmbeddingSink for EmbeddingClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => embedder.embed(text),
            EmbeddingBackend::OpenAi(client) => client.embed(text),
        }
    }

    fn dim(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => embedder.dim(),
            EmbeddingBackend::OpenAi(client) => client.dim(),
        }
    }
}
