//! Embedding provider trait, the built-in hashed embedder, and vector utilities.
//!
//! Network-backed providers (OpenAI, Ollama) live in the application crate
//! and implement the async `Embedder` trait there. The [`HashedEmbedder`]
//! is pure and deterministic, so it can run anywhere this crate compiles.

use crate::lexical::{is_stopword, tokenize};

/// Trait for embedding providers.
///
/// Exposes the metadata that index snapshots record in their config
/// signature, so a model change invalidates persisted vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
}

/// Feature-hashing embedder over stemmed, stopword-free tokens.
///
/// Each token is hashed (FNV-1a) into one of `dims` buckets with a sign
/// taken from the hash, then the vector is L2-normalised. Texts sharing
/// vocabulary land close together; unrelated texts are near-orthogonal.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dims: usize,
}

impl HashedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            if is_stopword(&token) {
                continue;
            }
            let h = fnv1a(stem(&token).as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl EmbeddingProvider for HashedEmbedder {
    fn model_name(&self) -> &str {
        "hashed-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Strip common English inflections so "applying" and "applied" share a bucket.
fn stem(token: &str) -> &str {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(base) = token.strip_suffix(suffix) {
            if base.len() >= 3 {
                return base;
            }
        }
    }
    token
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Scale a vector to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
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

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_hashed_embedder_is_deterministic_and_normalised() {
        let e = HashedEmbedder::new(64);
        let a = e.embed("Annual leave entitlement");
        let b = e.embed("Annual leave entitlement");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashed_embedder_similarity() {
        let e = HashedEmbedder::new(384);
        let q = e.embed("applying for annual leave");
        let related = e.embed("Employees apply for leave through the HR portal");
        let unrelated = e.embed("Travel expenses are reimbursed monthly");
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
    }

    #[test]
    fn test_stopword_only_text_embeds_to_zero() {
        let e = HashedEmbedder::new(16);
        assert!(e.embed("how do I").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_stem() {
        assert_eq!(stem("applying"), "apply");
        assert_eq!(stem("policies"), "polici");
        assert_eq!(stem("is"), "is");
    }
}
