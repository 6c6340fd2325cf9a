//! Embedding-based novelty checks for ideation.
//!
//! A single-vector endpoint (Ollama's `/api/embed` by default) turns
//! candidate descriptions into vectors; cosine similarity against the
//! existing corpus gates near-duplicate proposals.  The check is advisory,
//! not a correctness gate: every failure path degrades to "novel" so a
//! network blip cannot stall evolution.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Embedding model name override.
pub const EMBEDDING_MODEL_ENV: &str = "EMBEDDING_MODEL";
/// Embedding service base URL override.
pub const OLLAMA_URL_ENV: &str = "OLLAMA_URL";

const DEFAULT_MODEL: &str = "nomic-embed-text";
const DEFAULT_URL: &str = "http://localhost:11434";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    cache_path: Option<PathBuf>,
}

impl EmbeddingClient {
    /// Client with an on-disk cache at `cache_path` (keyed by text hash,
    /// persisted across runs).  Model and endpoint come from the
    /// environment with the usual defaults.
    pub fn new(cache_path: Option<PathBuf>) -> Self {
        let base_url = std::env::var(OLLAMA_URL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let model = std::env::var(EMBEDDING_MODEL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let cache = cache_path
            .as_deref()
            .and_then(|path| {
                let raw = fs::read_to_string(path).ok()?;
                serde_json::from_str::<HashMap<String, Vec<f32>>>(&raw).ok()
            })
            .unwrap_or_default();

        Self {
            http: reqwest::Client::new(),
            base_url,
            model,
            cache: Mutex::new(cache),
            cache_path,
        }
    }

    fn cache_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Fetch the embedding vector for `text`, or `None` when the service is
    /// unreachable or answers garbage.  Never raises.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::cache_key(text);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Some(hit.clone());
            }
        }

        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({ "model": self.model, "input": text });

        let response = match self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("embedding request failed: {err}");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "embedding service error");
            return None;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!("embedding response was not JSON: {err}");
                return None;
            }
        };

        let vector: Option<Vec<f32>> = body
            .get("embeddings")
            .and_then(|e| e.get(0))
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|x| x.as_f64())
                    .map(|x| x as f32)
                    .collect()
            });

        match vector {
            Some(vector) if !vector.is_empty() => {
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(key, vector.clone());
                }
                Some(vector)
            }
            _ => {
                warn!("embedding response missing vector");
                None
            }
        }
    }

    /// `(is_novel, max_similarity)` of `text` against `corpus`.  Novel iff
    /// the maximum cosine similarity is strictly below `threshold`; an
    /// unreachable endpoint reports novel so evolution keeps moving.
    pub async fn is_novel(&self, text: &str, corpus: &[String], threshold: f32) -> (bool, f32) {
        if corpus.is_empty() {
            return (true, 0.0);
        }
        let Some(candidate) = self.embed(text).await else {
            return (true, 0.0);
        };

        let mut max_similarity = 0.0f32;
        for existing in corpus {
            if let Some(other) = self.embed(existing).await {
                max_similarity = max_similarity.max(cosine(&candidate, &other));
            }
        }

        debug!(max_similarity, threshold, "novelty check");
        (max_similarity < threshold, max_similarity)
    }

    /// Persist the cache.  Called once per ideation pass rather than per
    /// lookup.
    pub fn save_cache(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let Ok(cache) = self.cache.lock() else {
            return;
        };
        match serde_json::to_string(&*cache) {
            Ok(body) => {
                if let Err(err) = fs::write(path, body) {
                    warn!(path = %path.display(), "failed to save embedding cache: {err}");
                }
            }
            Err(err) => warn!("failed to serialize embedding cache: {err}"),
        }
    }

    #[cfg(test)]
    fn seed_cache(&self, text: &str, vector: Vec<f32>) {
        self.cache
            .lock()
            .unwrap()
            .insert(Self::cache_key(text), vector);
    }
}

/// Cosine similarity in `[-1, 1]`; zero or mismatched vectors yield 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_negative_one() {
        assert!((cosine(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_and_mismatched_vectors_yield_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn cached_vectors_bypass_the_network() {
        // Point at a port nothing listens on; only cache hits can answer.
        let client = EmbeddingClient {
            http: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1".to_string(),
            model: "test".to_string(),
            cache: Mutex::new(HashMap::new()),
            cache_path: None,
        };
        client.seed_cache("hello", vec![1.0, 0.0]);

        assert_eq!(client.embed("hello").await, Some(vec![1.0, 0.0]));
        assert_eq!(client.embed("uncached").await, None);
    }

    #[tokio::test]
    async fn novelty_rejects_similar_and_accepts_distinct() {
        let client = EmbeddingClient {
            http: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1".to_string(),
            model: "test".to_string(),
            cache: Mutex::new(HashMap::new()),
            cache_path: None,
        };
        client.seed_cache("new idea", vec![1.0, 0.1]);
        client.seed_cache("old idea", vec![1.0, 0.0]);
        client.seed_cache("different idea", vec![0.0, 1.0]);

        // Similarity above the threshold rejects.
        let (novel, sim) = client
            .is_novel("new idea", &["old idea".to_string()], 0.92)
            .await;
        assert!(!novel);
        assert!(sim > 0.92);

        let (novel, _) = client
            .is_novel("new idea", &["different idea".to_string()], 0.92)
            .await;
        assert!(novel);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let client = EmbeddingClient {
            http: reqwest::Client::new(),
            base_url: "http://127.0.0.1:1".to_string(),
            model: "test".to_string(),
            cache: Mutex::new(HashMap::new()),
            cache_path: None,
        };
        let (novel, sim) = client
            .is_novel("anything", &["existing".to_string()], 0.92)
            .await;
        assert!(novel);
        assert_eq!(sim, 0.0);
    }

    #[tokio::test]
    async fn empty_corpus_is_always_novel() {
        let client = EmbeddingClient::new(None);
        let (novel, sim) = client.is_novel("anything", &[], 0.92).await;
        assert!(novel);
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings_cache.json");

        {
            let client = EmbeddingClient::new(Some(path.clone()));
            client.seed_cache("hello", vec![0.5, 0.5]);
            client.save_cache();
        }

        let client = EmbeddingClient::new(Some(path));
        let cached = client.cache.lock().unwrap();
        assert_eq!(
            cached.get(&EmbeddingClient::cache_key("hello")),
            Some(&vec![0.5, 0.5])
        );
    }
}
