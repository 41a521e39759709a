//! Text embedders and the content-addressed embedding cache.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::non_zero;
use crate::error::EmbeddingError;
use crate::settings::EmbeddingConfig;

/// Fixed-dimension text embedding model.
#[async_trait]
pub trait Embedder: Send + Sync + fmt::Debug {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Build the configured embedder, wrapped in a cache.
pub fn from_settings(
    config: &EmbeddingConfig,
    timeout_seconds: u64,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let inner: Arc<dyn Embedder> = match config.provider.as_str() {
        "http" => Arc::new(HttpEmbedder::new(
            &config.base_url,
            &config.model,
            config.api_key(),
            config.dimension,
            timeout_seconds,
        )?),
        _ => Arc::new(HashEmbedder::new(config.dimension)),
    };
    Ok(Arc::new(CachedEmbedder::new(inner, config.cache_capacity)))
}

/// Cosine similarity; 0.0 for mismatched, empty or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

/// Hash-based cache key for embeddings
pub fn cache_key(content: &str) -> String {
    let hash = blake3::hash(content.as_bytes());
    format!("embedding:{}", hash.to_hex())
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Offline embedder using signed feature hashing over words and word bigrams.
///
/// Captures lexical overlap only, which is enough for keyword-heavy
/// agricultural records and keeps the crate usable without an API key.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1) }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[..8]);
        let slot = (u64::from_le_bytes(index) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let words: Vec<String> = tokens(text).collect();
        if words.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0f32; self.dimension];
        for word in &words {
            let (slot, sign) = self.bucket(word);
            vector[slot] += sign;
        }
        for pair in words.windows(2) {
            let (slot, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[slot] += 0.5 * sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}

/// Embeddings endpoint of an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        dimension: usize,
        timeout_seconds: u64,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| EmbeddingError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            dimension,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest { model: &self.model, input: text });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!(
                "HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed = response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned".into()))?;

        if embedding.len() != self.dimension {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoizes embeddings by content hash, evicting the least recently used.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(non_zero(capacity))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl fmt::Debug for CachedEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedEmbedder")
            .field("inner", &self.inner)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = cache_key(text);
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(vector) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Computing new embedding");
        let vector = self.inner.embed(text).await?;
        self.cache.lock().put(key, vector.clone());
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Whitefly on Tomato").await.unwrap();
        let b = embedder.embed("whitefly on tomato").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn overlapping_text_scores_higher() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed("whitefly control on tomato").await.unwrap();
        let close = embedder.embed("tomato whitefly control with neem oil").await.unwrap();
        let far = embedder.embed("wheat minimum support price in punjab").await.unwrap();
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let embedder = HashEmbedder::new(8);
        assert!(matches!(embedder.embed("  ?! ").await, Err(EmbeddingError::EmptyInput)));
    }

    #[tokio::test]
    async fn cache_serves_repeats() {
        let cached = CachedEmbedder::new(Arc::new(HashEmbedder::new(16)), 8);
        let first = cached.embed("black soil").await.unwrap();
        let second = cached.embed("black soil").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            cached.stats(),
            EmbeddingCacheStats { hits: 1, misses: 1, entries: 1 }
        );
    }

    #[tokio::test]
    async fn cache_is_bounded() {
        let cached = CachedEmbedder::new(Arc::new(HashEmbedder::new(16)), 2);
        cached.embed("black soil").await.unwrap();
        cached.embed("red soil").await.unwrap();
        cached.embed("black soil").await.unwrap();
        cached.embed("laterite soil").await.unwrap();
        assert_eq!(cached.stats().entries, 2);

        // "red soil" was least recently used and is gone.
        cached.embed("red soil").await.unwrap();
        assert_eq!(cached.stats().misses, 4);
        cached.embed("laterite soil").await.unwrap();
        assert_eq!(cached.stats().hits, 2);
    }
}
