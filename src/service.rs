//! The retriever facade used by the CLI, the HTTP server, and embedding
//! applications.
//!
//! [`Retriever`] owns one [`ScopeHandle`] per role, the query engine, and
//! the response cache. It is the upstream boundary: `query`, `refresh`,
//! `clear_response_cache`, and `answer`, plus the admin operations
//! `refresh_with(role, SyncMode::Full)` and `rebuild`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use policy_retrieval_core::models::{Citation, RoleScope};

use crate::answer::{Answer, AnswerGenerator, NO_POLICY_FOUND};
use crate::cache::{cache_key, CacheEntry, CacheStats, ResponseCache};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Result, RetrievalError};
use crate::index::IndexBuilder;
use crate::query::{QueryEngine, QueryResponse, ServiceStatus};
use crate::scope::{ScopeHandle, ScopePaths, ScopeStats, SyncMode, SyncResult};
use crate::store::{create_store, DocumentStore};

/// Outcome of a forced index rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildResult {
    pub role: RoleScope,
    pub fingerprint: String,
    pub chunks: usize,
    pub documents: usize,
    pub skipped: Vec<String>,
    pub cleared_responses: usize,
}

pub struct Retriever {
    scopes: BTreeMap<RoleScope, ScopeHandle>,
    engine: QueryEngine,
    cache: ResponseCache,
    cache_path: Option<PathBuf>,
    /// Last fingerprint each role's cache entries were checked against.
    cache_fingerprints: Mutex<HashMap<RoleScope, String>>,
}

impl Retriever {
    /// Open every role scope from `config.storage.data_dir`.
    pub async fn open(
        config: Config,
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let builder = Arc::new(IndexBuilder::from_config(&config, Arc::clone(&embedder)));
        let max_age = config
            .sync
            .max_index_age_hours
            .map(|h| Duration::from_secs(h * 3600));

        let mut scopes = BTreeMap::new();
        for role in RoleScope::ALL {
            let scope = ScopeHandle::open(
                role,
                ScopePaths::new(config.role_dir(role)),
                Arc::clone(&store),
                Arc::clone(&builder),
                max_age,
            )
            .await?;
            scopes.insert(role, scope);
        }

        let cache_path = config.cache.persist.then(|| config.response_cache_path());
        let cache = match &cache_path {
            Some(path) => match ResponseCache::load(path, config.cache.capacity).await {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable response cache");
                    ResponseCache::new(config.cache.capacity)
                }
            },
            None => ResponseCache::new(config.cache.capacity),
        };

        tracing::info!(
            store = %store.describe(),
            embedder = embedder.model_name(),
            cached_responses = cache.len(),
            "retriever ready"
        );

        Ok(Self {
            scopes,
            engine: QueryEngine::from_config(&config, embedder),
            cache,
            cache_path,
            cache_fingerprints: Mutex::new(HashMap::new()),
        })
    }

    /// Open with the store and embedder named in `config`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = create_store(&config)?;
        let embedder = create_embedder(&config.embedding)?;
        Self::open(config, store, embedder).await
    }

    pub fn scope(&self, role: RoleScope) -> Result<&ScopeHandle> {
        self.scopes
            .get(&role)
            .ok_or_else(|| RetrievalError::Config(format!("no scope for role {}", role)))
    }

    /// Ranked, deduplicated passages for `text` within `role`'s corpus.
    pub async fn query(&self, text: &str, role: RoleScope, top_k: Option<usize>) -> Result<QueryResponse> {
        let response = self.engine.run(self.scope(role)?, text, top_k).await?;
        if response.status == ServiceStatus::Fresh {
            self.purge_superseded(role, &response.fingerprint);
        }
        Ok(response)
    }

    /// Force a sync of `role` now, rebuilding its index if anything changed.
    pub async fn refresh(&self, role: RoleScope) -> Result<SyncResult> {
        self.refresh_with(role, SyncMode::Incremental).await
    }

    /// Sync `role` in the given mode. A full sync refetches every document,
    /// rebuilds the index, and drops the role's cached answers.
    pub async fn refresh_with(&self, role: RoleScope, mode: SyncMode) -> Result<SyncResult> {
        let result = self.scope(role)?.sync_with(mode).await?;
        if mode == SyncMode::Full {
            let cleared = self.cache.clear(Some(role));
            tracing::info!(%role, cleared, "full resync cleared cached answers");
        }
        self.purge_superseded(role, &result.new_fingerprint);
        Ok(result)
    }

    /// Rebuild `role`'s index from the local mirror and drop its cached answers.
    pub async fn rebuild(&self, role: RoleScope) -> Result<RebuildResult> {
        let snapshot = self.scope(role)?.rebuild().await?;
        let cleared = self.cache.clear(Some(role));
        self.purge_superseded(role, &snapshot.corpus_fingerprint);
        Ok(RebuildResult {
            role,
            fingerprint: snapshot.corpus_fingerprint.clone(),
            chunks: snapshot.index.len(),
            documents: snapshot.index.document_count(),
            skipped: snapshot.skipped.clone(),
            cleared_responses: cleared,
        })
    }

    /// Refresh every role. Roles are independent; one failure does not stop the others.
    pub async fn refresh_all(&self) -> Vec<(RoleScope, Result<SyncResult>)> {
        let futures = RoleScope::ALL.map(|role| async move { (role, self.refresh(role).await) });
        futures::future::join_all(futures).await
    }

    /// Drop cached answers for `role`, or for every role.
    pub fn clear_response_cache(&self, role: Option<RoleScope>) -> usize {
        self.cache.clear(role)
    }

    /// Answer a question: cache lookup, retrieval, generation, cache insert.
    pub async fn answer(
        &self,
        text: &str,
        role: RoleScope,
        generator: &dyn AnswerGenerator,
    ) -> Result<Answer> {
        let prepared = self.engine.prepare(text)?;
        let (snapshot, status) = self.engine.resolve(self.scope(role)?).await?;
        let fingerprint = snapshot.corpus_fingerprint.clone();
        if status == ServiceStatus::Fresh {
            self.purge_superseded(role, &fingerprint);
        }

        let key = cache_key(&prepared.normalized, role, &fingerprint);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(%role, hits = hit.hit_count, "response cache hit");
            return Ok(Answer {
                role,
                answer: hit.answer,
                citations: hit.citations,
                cached: true,
                fingerprint,
                status,
            });
        }

        let passages = self.engine.search(&snapshot, &prepared, None).await?;
        let citations: Vec<Citation> = passages.iter().map(Citation::from).collect();
        let answer = if passages.is_empty() {
            NO_POLICY_FOUND.to_string()
        } else {
            generator.generate(&prepared.normalized, &passages).await?
        };

        // Degraded answers come from an index that may be about to change.
        if status == ServiceStatus::Fresh {
            self.cache.put(CacheEntry {
                key,
                role,
                fingerprint: fingerprint.clone(),
                query: prepared.normalized.clone(),
                answer: answer.clone(),
                citations: citations.clone(),
                created_at: chrono::Utc::now().timestamp(),
                hit_count: 0,
            });
        }

        Ok(Answer {
            role,
            answer,
            citations,
            cached: false,
            fingerprint,
            status,
        })
    }

    pub fn stats(&self, role: RoleScope) -> Result<ScopeStats> {
        Ok(self.scope(role)?.stats())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_entries(&self, limit: usize, offset: usize) -> Vec<CacheEntry> {
        self.cache.entries(limit, offset)
    }

    pub fn remove_cached(&self, key: &str) -> bool {
        self.cache.remove(key)
    }

    /// Write the response cache snapshot, if persistence is enabled.
    pub async fn persist_cache(&self) -> Result<()> {
        match &self.cache_path {
            Some(path) => self.cache.save(path).await,
            None => Ok(()),
        }
    }

    /// Refresh every role every `interval` until the task is aborted.
    pub fn spawn_background_sync(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let retriever = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (role, result) in retriever.refresh_all().await {
                    match result {
                        Ok(r) if r.has_changes() => tracing::info!(
                            %role,
                            added = r.added.len(),
                            changed = r.changed.len(),
                            removed = r.removed.len(),
                            "background sync applied changes"
                        ),
                        Ok(_) => tracing::debug!(%role, "background sync: no changes"),
                        Err(e) => tracing::warn!(%role, error = %e, "background sync failed"),
                    }
                }
                if let Err(e) = retriever.persist_cache().await {
                    tracing::warn!(error = %e, "failed to persist response cache");
                }
            }
        })
    }

    /// Persist the cache and close every scope's ledger.
    pub async fn close(&self) -> Result<()> {
        let saved = self.persist_cache().await;
        for scope in self.scopes.values() {
            scope.close().await;
        }
        saved
    }

    fn purge_superseded(&self, role: RoleScope, fingerprint: &str) {
        let mut seen = self
            .cache_fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if seen.get(&role).map(String::as_str) != Some(fingerprint) {
            self.cache.retain_fingerprint(role, fingerprint);
            seen.insert(role, fingerprint.to_string());
        }
    }
}
