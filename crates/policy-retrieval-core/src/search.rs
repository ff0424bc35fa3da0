//! Hybrid lexical + vector search over one role scope's chunks.
//!
//! A [`HybridIndex`] owns the chunks of exactly one role together with a
//! BM25 index and a dense vector index built from them. The calling
//! application embeds the query and passes the vector in, so this module
//! stays free of I/O.
//!
//! # Scoring Algorithm
//!
//! 1. Fetch `candidate_k` BM25 candidates (over the expanded query terms)
//!    and `candidate_k` nearest vector candidates.
//! 2. Lexical score: BM25 divided by the best BM25 among candidates, times
//!    the IDF-weighted coverage of the original query terms. A chunk that
//!    contains every query term keeps at least `exact_match_floor`.
//! 3. Vector score: cosine similarity clamped to `[0, 1]`.
//! 4. Fuse: `score = (wl × lexical + wv × vector) / (wl + wv)`.
//! 5. Drop results below `confidence_threshold`.
//! 6. Deduplicate by document key (case-insensitive), keeping the best chunk.
//! 7. Sort by score (desc), document key (asc), chunk index (asc).
//! 8. Truncate to `top_k`. An empty vector is the explicit "no result".

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::lexical::{query_terms, LexicalIndex};
use crate::models::{Chunk, RoleScope, ScoredChunk};
use crate::vector::VectorIndex;

/// Fusion and thresholding policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionParams {
    pub lexical_weight: f64,
    pub vector_weight: f64,
    pub confidence_threshold: f64,
    pub exact_match_floor: f64,
    /// Number of candidates fetched from each engine.
    pub candidate_k: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            lexical_weight: 0.4,
            vector_weight: 0.6,
            confidence_threshold: 0.3,
            exact_match_floor: 0.5,
            candidate_k: 40,
        }
    }
}

/// Keyword → synonyms appended to the lexical side of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExpansion {
    synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for QueryExpansion {
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            ("apply", &["request", "submit", "file"]),
            ("attendance", &["punch", "check in", "clock"]),
            ("balance", &["remaining", "available", "quota"]),
            ("download", &["access", "view", "fetch"]),
            ("expense", &["reimbursement", "claim", "travel claim"]),
            ("form-16", &["tax form", "income tax", "tds"]),
            ("holiday", &["calendar", "public holiday", "company holiday"]),
            ("leave", &["vacation", "time off", "absence", "pto"]),
            ("payslip", &["salary slip", "pay stub", "salary statement"]),
            ("profile", &["personal details", "employee info"]),
            ("training", &["learning", "course", "certification", "skill"]),
        ];
        Self::new(
            table
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
        )
    }
}

impl QueryExpansion {
    pub fn new(synonyms: BTreeMap<String, Vec<String>>) -> Self {
        let synonyms = synonyms
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { synonyms }
    }

    pub fn none() -> Self {
        Self {
            synonyms: BTreeMap::new(),
        }
    }

    /// Extra terms for a normalised query. A keyword matches anywhere in the
    /// query text, so "leaves" also triggers the "leave" synonyms.
    pub fn expand(&self, normalized: &str, existing: &[String]) -> Vec<String> {
        let mut extra: Vec<String> = Vec::new();
        for (keyword, synonyms) in &self.synonyms {
            if !normalized.contains(keyword.as_str()) {
                continue;
            }
            for synonym in synonyms {
                for term in query_terms(synonym) {
                    if !existing.contains(&term) && !extra.contains(&term) {
                        extra.push(term);
                    }
                }
            }
        }
        extra
    }
}

/// A validated, normalised query ready for both engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    /// Trimmed, whitespace-collapsed, lowercased text. Also the cache key input.
    pub normalized: String,
    /// Non-stopword terms of the query itself.
    pub terms: Vec<String>,
    /// `terms` plus synonym expansions; used for BM25 only.
    pub expanded_terms: Vec<String>,
}

/// Trim, collapse internal whitespace, and lowercase.
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn prepare_query(text: &str, expansion: &QueryExpansion) -> PreparedQuery {
    let normalized = normalize_query(text);
    let terms = query_terms(&normalized);
    let mut expanded_terms = terms.clone();
    expanded_terms.extend(expansion.expand(&normalized, &terms));
    PreparedQuery {
        normalized,
        terms,
        expanded_terms,
    }
}

/// Lexical and vector indexes over one role scope's chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridIndex {
    role: RoleScope,
    chunks: Vec<Chunk>,
    lexical: LexicalIndex,
    vector: VectorIndex,
}

impl HybridIndex {
    /// Build from chunks and their embeddings (same order, same length).
    ///
    /// Fails if any chunk belongs to another role: an index never mixes scopes.
    pub fn build(
        role: RoleScope,
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
        dims: usize,
    ) -> Result<Self> {
        if chunks.len() != embeddings.len() {
            bail!(
                "{} chunks but {} embeddings",
                chunks.len(),
                embeddings.len()
            );
        }
        if let Some(foreign) = chunks.iter().find(|c| c.role != role) {
            bail!(
                "chunk {} of '{}' belongs to role {}, not {}",
                foreign.chunk_index,
                foreign.document_key,
                foreign.role,
                role
            );
        }

        let lexical = LexicalIndex::build(chunks.iter().map(|c| c.text.as_str()));
        let vector = VectorIndex::build(dims, embeddings)?;
        Ok(Self {
            role,
            chunks,
            lexical,
            vector,
        })
    }

    pub fn empty(role: RoleScope, dims: usize) -> Self {
        Self {
            role,
            chunks: Vec::new(),
            lexical: LexicalIndex::default(),
            vector: VectorIndex::empty(dims),
        }
    }

    pub fn role(&self) -> RoleScope {
        self.role
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.vector.dims()
    }

    pub fn document_count(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.document_key.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Run a hybrid search. Returns at most `top_k` results, one per document.
    pub fn search(
        &self,
        query: &PreparedQuery,
        query_vec: &[f32],
        params: &FusionParams,
        top_k: usize,
    ) -> Vec<ScoredChunk> {
        if top_k == 0 || self.chunks.is_empty() {
            return Vec::new();
        }

        let lexical_hits: Vec<(usize, f64)> = self
            .lexical
            .score(&query.expanded_terms)
            .into_iter()
            .take(params.candidate_k)
            .collect();
        let vector_hits = self.vector.nearest(query_vec, params.candidate_k);

        let max_bm25 = lexical_hits.first().map(|(_, s)| *s).unwrap_or(0.0);
        let bm25: HashMap<usize, f64> = lexical_hits.iter().copied().collect();

        let mut candidates: Vec<usize> = lexical_hits
            .iter()
            .chain(vector_hits.iter())
            .map(|(o, _)| *o)
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let weight_sum = params.lexical_weight + params.vector_weight;
        if weight_sum <= 0.0 {
            return Vec::new();
        }

        let mut best: HashMap<String, ScoredChunk> = HashMap::new();
        for ordinal in candidates {
            let chunk = &self.chunks[ordinal];
            if chunk.role != self.role {
                continue;
            }

            let lexical_score = self.lexical_score(query, ordinal, &bm25, max_bm25, params);
            let vector_score = self.vector.similarity(query_vec, ordinal).clamp(0.0, 1.0);
            let score = ((params.lexical_weight * lexical_score
                + params.vector_weight * vector_score)
                / weight_sum)
                .clamp(0.0, 1.0);

            if score < params.confidence_threshold {
                continue;
            }

            let scored = ScoredChunk {
                chunk_id: chunk.id.clone(),
                role: chunk.role,
                document_key: chunk.document_key.clone(),
                title: chunk.title().to_string(),
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                score,
                lexical_score,
                vector_score,
            };

            let dedup_key = chunk.document_key.to_lowercase();
            match best.get(&dedup_key) {
                Some(current) if !outranks(&scored, current) => {}
                _ => {
                    best.insert(dedup_key, scored);
                }
            }
        }

        let mut results: Vec<ScoredChunk> = best.into_values().collect();
        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_key.cmp(&b.document_key))
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        results.truncate(top_k);
        results
    }

    fn lexical_score(
        &self,
        query: &PreparedQuery,
        ordinal: usize,
        bm25: &HashMap<usize, f64>,
        max_bm25: f64,
        params: &FusionParams,
    ) -> f64 {
        if query.terms.is_empty() {
            return 0.0;
        }
        let raw = bm25.get(&ordinal).copied().unwrap_or(0.0);
        let relative = if max_bm25 > 0.0 { raw / max_bm25 } else { 0.0 };
        let coverage = self.lexical.coverage(&query.terms, ordinal);

        let score = relative * coverage;
        if coverage >= 1.0 - 1e-9 {
            score.max(params.exact_match_floor)
        } else {
            score
        }
    }
}

fn outranks(a: &ScoredChunk, b: &ScoredChunk) -> bool {
    a.score > b.score || (a.score == b.score && a.chunk_index < b.chunk_index)
}
