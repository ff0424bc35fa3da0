//! Hybrid query engine over a role scope.
//!
//! A query passes through these steps:
//!
//! 1. **Validate** the trimmed length against `retrieval.min_query_len` and
//!    `retrieval.max_query_len`. A rejected query never reaches the scope.
//! 2. **Sync.** When `sync.sync_on_query` is set, or the scope has never
//!    been synced, the scope syncs first. Concurrent queries share that sync,
//!    except that a query arriving while a sync is already running is served
//!    from the current index as long as that index is still fresh.
//! 3. **Resolve the index.** A stale index is rebuilt before use. If the
//!    sync or the rebuild fails and a previous index exists, that index is
//!    served and the response is marked [`ServiceStatus::Degraded`].
//! 4. **Search** via [`HybridIndex::search`](policy_retrieval_core::search::HybridIndex::search).
//!    An empty passage list is the explicit "no result" outcome.

use serde::Serialize;
use std::sync::Arc;

use policy_retrieval_core::models::{Citation, RoleScope, ScoredChunk};
use policy_retrieval_core::search::{prepare_query, FusionParams, PreparedQuery, QueryExpansion};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Result, RetrievalError};
use crate::index::IndexSnapshot;
use crate::scope::ScopeHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceStatus {
    Fresh,
    /// Served from the last good index because the store or a rebuild failed.
    Degraded { reason: String },
}

impl ServiceStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ServiceStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub role: RoleScope,
    /// The normalised query text.
    pub query: String,
    pub passages: Vec<ScoredChunk>,
    /// Corpus fingerprint of the index that answered.
    pub fingerprint: String,
    pub status: ServiceStatus,
}

impl QueryResponse {
    /// True when no passage cleared the confidence threshold.
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// One citation per passage; passages are already one per document.
    pub fn citations(&self) -> Vec<Citation> {
        self.passages.iter().map(Citation::from).collect()
    }
}

pub struct QueryEngine {
    fusion: FusionParams,
    expansion: QueryExpansion,
    min_len: usize,
    max_len: usize,
    default_top_k: usize,
    sync_on_query: bool,
    embedder: Arc<dyn Embedder>,
}

impl QueryEngine {
    pub fn from_config(config: &Config, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            fusion: config.fusion_params(),
            expansion: config.query_expansion(),
            min_len: config.retrieval.min_query_len,
            max_len: config.retrieval.max_query_len,
            default_top_k: config.retrieval.default_top_k,
            sync_on_query: config.sync.sync_on_query,
            embedder,
        }
    }

    /// Validate and normalise query text.
    pub fn prepare(&self, text: &str) -> Result<PreparedQuery> {
        validate_query(text, self.min_len, self.max_len)?;
        Ok(prepare_query(text, &self.expansion))
    }

    /// Bring the scope up to date and return the index to search.
    pub async fn resolve(&self, scope: &ScopeHandle) -> Result<(Arc<IndexSnapshot>, ServiceStatus)> {
        let role = scope.role();

        // The manifest is swapped only once a sync has fetched everything, so
        // until then the current index still matches it.
        if self.sync_on_query && scope.sync_in_flight() {
            if let Ok(snapshot) = scope.fresh_index() {
                tracing::debug!(%role, "sync in flight, serving current index");
                return Ok((snapshot, ServiceStatus::Fresh));
            }
        }

        let sync_error = if self.sync_on_query || !scope.has_synced() {
            match scope.sync().await {
                Ok(_) => None,
                Err(e) if !scope.has_synced() => return Err(e),
                Err(e) => {
                    tracing::warn!(%role, error = %e, "sync failed, serving last good index");
                    Some(e)
                }
            }
        } else {
            None
        };

        match scope.ensure_index().await {
            Ok(snapshot) => {
                let status = match sync_error {
                    Some(e) => ServiceStatus::Degraded { reason: e.to_string() },
                    None => ServiceStatus::Fresh,
                };
                Ok((snapshot, status))
            }
            Err(e) => match scope.last_index() {
                Some(snapshot) => {
                    tracing::warn!(%role, error = %e, "rebuild failed, serving last good index");
                    Ok((snapshot, ServiceStatus::Degraded { reason: e.to_string() }))
                }
                None => Err(sync_error.unwrap_or(e)),
            },
        }
    }

    /// Search a resolved index.
    pub async fn search(
        &self,
        snapshot: &IndexSnapshot,
        query: &PreparedQuery,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.embedder.embed_one(&query.normalized).await?;
        let top_k = top_k.unwrap_or(self.default_top_k);
        Ok(snapshot.index.search(query, &query_vec, &self.fusion, top_k))
    }

    pub async fn run(&self, scope: &ScopeHandle, text: &str, top_k: Option<usize>) -> Result<QueryResponse> {
        let prepared = self.prepare(text)?;
        let (snapshot, status) = self.resolve(scope).await?;
        let passages = self.search(&snapshot, &prepared, top_k).await?;

        tracing::debug!(
            role = %scope.role(),
            results = passages.len(),
            degraded = status.is_degraded(),
            "query complete"
        );
        Ok(QueryResponse {
            role: scope.role(),
            query: prepared.normalized,
            passages,
            fingerprint: snapshot.corpus_fingerprint.clone(),
            status,
        })
    }
}

/// Reject empty, too short, or too long queries with user-facing guidance.
///
/// Length is counted in characters of the trimmed text.
pub fn validate_query(text: &str, min_len: usize, max_len: usize) -> Result<()> {
    let len = text.trim().chars().count();
    if len == 0 {
        return Err(RetrievalError::Validation(
            "Please enter a question about an HR policy.".to_string(),
        ));
    }
    if len < min_len {
        return Err(RetrievalError::Validation(format!(
            "Your question is too short ({} characters). Please use at least {} characters.",
            len, min_len
        )));
    }
    if len > max_len {
        return Err(RetrievalError::Validation(format!(
            "Your question is too long ({} characters). Please keep it under {} characters.",
            len, max_len
        )));
    }
    Ok(())
}
