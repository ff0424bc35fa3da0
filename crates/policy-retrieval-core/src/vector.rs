//! Dense vector index with exact nearest-neighbor search.
//!
//! Per-role corpora are small (hundreds to low thousands of chunks), so a
//! brute-force cosine scan is both exact and fast enough.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorIndex {
    dims: usize,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    /// Build from one vector per chunk ordinal. All vectors must share `dims`.
    pub fn build(dims: usize, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
            bail!(
                "embedding {} has dimension {}, expected {}",
                i,
                v.len(),
                dims
            );
        }
        Ok(Self { dims, vectors })
    }

    pub fn empty(dims: usize) -> Self {
        Self {
            dims,
            vectors: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Cosine similarity of the query against chunk `ordinal`.
    pub fn similarity(&self, query: &[f32], ordinal: usize) -> f64 {
        self.vectors
            .get(ordinal)
            .map(|v| cosine_similarity(query, v) as f64)
            .unwrap_or(0.0)
    }

    /// The `k` most similar chunks with positive similarity, best first.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v) as f64))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}
