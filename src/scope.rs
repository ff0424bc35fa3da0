//! Per-role scope state: manifest, mirror, ledger, and the active index.
//!
//! One [`ScopeHandle`] exists per [`RoleScope`]. Nothing is shared between
//! handles, so a bug in the query layer cannot surface another role's
//! chunks: the data simply is not reachable from this handle.
//!
//! # Concurrency
//!
//! - The manifest and the active index are `Arc`s behind `RwLock`s. Readers
//!   clone the `Arc` and release the lock immediately; writers replace the
//!   whole `Arc`. A query therefore sees either the old index or the new
//!   one, never a partial build.
//! - At most one sync runs per scope. A sync requested while another is in
//!   flight awaits the same shared future and receives the same result. A
//!   [`SyncMode::Full`] request never settles for an incremental sync.
//! - Rebuilds are serialised by a mutex and tagged with a generation. A
//!   sync that changes the fingerprint bumps the generation, and a rebuild
//!   started for an older generation stops without swapping.
//!
//! # Recovery
//!
//! - `NotFound` during fetch (object vanished after listing) triggers a
//!   re-list, up to [`MAX_RELISTS`] times.
//! - `Storage`/`Corrupt` failures discard local state and run one full
//!   resync from the store.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use policy_retrieval_core::delta::{compute_delta, SyncDelta};
use policy_retrieval_core::fingerprint::short;
use policy_retrieval_core::models::{DocumentRef, MirrorEntry, RoleScope, SyncManifest};

use crate::error::{Result, RetrievalError};
use crate::index::{IndexBuilder, IndexSnapshot};
use crate::ledger::Ledger;
use crate::mirror::Mirror;
use crate::store::DocumentStore;

/// Re-lists allowed per sync when fetched objects keep vanishing.
pub const MAX_RELISTS: usize = 3;

/// Rebuild attempts per call before giving up on a moving manifest.
const MAX_REBUILD_ATTEMPTS: usize = 3;

/// Outcome of one sync of a role scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub role: RoleScope,
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub previous_fingerprint: String,
    pub new_fingerprint: String,
    /// Whether this sync swapped in a new index.
    pub index_rebuilt: bool,
}

impl SyncResult {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty())
    }
}

/// Document and index statistics for one scope.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStats {
    pub role: RoleScope,
    pub documents: usize,
    pub total_bytes: u64,
    pub last_sync: Option<i64>,
    pub fingerprint: String,
    pub index_chunks: usize,
    pub index_documents: usize,
    pub index_built_at: Option<i64>,
    pub index_fresh: bool,
    pub skipped_documents: Vec<String>,
}

/// Filesystem locations owned by one scope.
#[derive(Debug, Clone)]
pub struct ScopePaths {
    pub root: PathBuf,
}

impl ScopePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }
    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.sqlite")
    }
    pub fn index(&self) -> PathBuf {
        self.root.join("index.json")
    }
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncResult>>>;

/// How much local state a sync trusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch only what the listing shows as added or changed.
    Incremental,
    /// Discard the ledger and mirror, refetch every document, and rebuild
    /// the index even if the fingerprint is unchanged.
    Full,
}

#[derive(Clone)]
pub struct ScopeHandle {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    role: RoleScope,
    store: Arc<dyn DocumentStore>,
    builder: Arc<IndexBuilder>,
    mirror: Mirror,
    ledger: Ledger,
    index_path: PathBuf,
    max_index_age: Option<Duration>,
    manifest: RwLock<Arc<SyncManifest>>,
    index: RwLock<Option<Arc<IndexSnapshot>>>,
    in_flight: Mutex<Option<(SyncMode, SharedSync)>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl ScopeHandle {
    /// Open a scope from its on-disk state.
    ///
    /// A corrupt ledger is reset (the next sync refetches everything); a
    /// corrupt or foreign index snapshot is discarded.
    pub async fn open(
        role: RoleScope,
        paths: ScopePaths,
        store: Arc<dyn DocumentStore>,
        builder: Arc<IndexBuilder>,
        max_index_age: Option<Duration>,
    ) -> Result<Self> {
        let mirror = Mirror::new(paths.files());
        let ledger = Ledger::open(&paths.ledger(), role).await?;

        let manifest = match ledger.load().await {
            Ok(m) => m,
            Err(e) if e.requires_full_rebuild() => {
                tracing::error!(%role, error = %e, "ledger unreadable, discarding local state");
                ledger.reset().await?;
                mirror.clear().await?;
                SyncManifest::default()
            }
            Err(e) => return Err(e),
        };

        let index_path = paths.index();
        let index = match IndexSnapshot::load(&index_path, role).await {
            Ok(snapshot) => snapshot.map(Arc::new),
            Err(e) => {
                tracing::warn!(%role, error = %e, "discarding unreadable index snapshot");
                let _ = tokio::fs::remove_file(&index_path).await;
                None
            }
        };

        let keep: HashSet<PathBuf> = manifest
            .entries
            .values()
            .map(|e| e.local_path.clone())
            .collect();
        let swept = mirror.sweep(&keep).await?;
        if swept > 0 {
            tracing::debug!(%role, swept, "removed orphaned mirror files");
        }

        tracing::info!(
            %role,
            documents = manifest.len(),
            fingerprint = short(&manifest.fingerprint),
            index = index.is_some(),
            "opened scope"
        );

        Ok(Self {
            inner: Arc::new(ScopeInner {
                role,
                store,
                builder,
                mirror,
                ledger,
                index_path,
                max_index_age,
                manifest: RwLock::new(Arc::new(manifest)),
                index: RwLock::new(index),
                in_flight: Mutex::new(None),
                rebuild_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn role(&self) -> RoleScope {
        self.inner.role
    }

    pub fn manifest(&self) -> Arc<SyncManifest> {
        self.inner.manifest()
    }

    /// The last index that was swapped in, fresh or not.
    pub fn last_index(&self) -> Option<Arc<IndexSnapshot>> {
        self.inner.current_index()
    }

    /// Whether this scope has ever completed a sync (in this or an earlier process).
    pub fn has_synced(&self) -> bool {
        self.inner.manifest().last_sync.is_some()
    }

    /// Whether a sync of this scope is running right now.
    pub fn sync_in_flight(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Sync with the store and rebuild the index if anything changed.
    ///
    /// Concurrent callers share one in-flight sync.
    pub async fn sync(&self) -> Result<SyncResult> {
        self.sync_with(SyncMode::Incremental).await
    }

    /// Sync in the given mode.
    ///
    /// An in-flight sync is joined when it does at least as much as asked
    /// for. A full sync requested while an incremental one runs waits for
    /// it to finish and then starts its own.
    pub async fn sync_with(&self, mode: SyncMode) -> Result<SyncResult> {
        loop {
            let (joined, shared) = {
                let mut slot = self
                    .inner
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    Some((running_mode, running)) => {
                        (mode == SyncMode::Incremental || *running_mode == SyncMode::Full, running.clone())
                    }
                    None => {
                        let shared = self.spawn_sync(mode);
                        *slot = Some((mode, shared.clone()));
                        (true, shared)
                    }
                }
            };
            if joined {
                return shared.await;
            }
            tracing::debug!(role = %self.inner.role, "waiting for incremental sync before full sync");
            let _ = shared.await;
        }
    }

    fn spawn_sync(&self, mode: SyncMode) -> SharedSync {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run_sync(mode).await;
            *inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            result
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(RetrievalError::Storage(format!("sync task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Rebuild the index from the mirror without contacting the store.
    ///
    /// The previous index keeps serving until the new one is swapped in.
    pub async fn rebuild(&self) -> Result<Arc<IndexSnapshot>> {
        tracing::info!(role = %self.inner.role, "forced index rebuild");
        self.inner.ensure_index(true).await.map(|(snapshot, _)| snapshot)
    }

    /// The index for the current manifest, rebuilding first if it is stale.
    pub async fn ensure_index(&self) -> Result<Arc<IndexSnapshot>> {
        self.inner.ensure_index(false).await.map(|(snapshot, _)| snapshot)
    }

    /// The current index if it is fresh, or [`RetrievalError::StaleIndex`].
    pub fn fresh_index(&self) -> Result<Arc<IndexSnapshot>> {
        self.inner.fresh_index()
    }

    pub fn stats(&self) -> ScopeStats {
        let manifest = self.inner.manifest();
        let index = self.inner.current_index();
        let index_fresh = self.inner.fresh_index().is_ok();
        ScopeStats {
            role: self.inner.role,
            documents: manifest.len(),
            total_bytes: manifest.total_bytes(),
            last_sync: manifest.last_sync,
            fingerprint: manifest.fingerprint.clone(),
            index_chunks: index.as_ref().map_or(0, |s| s.index.len()),
            index_documents: index.as_ref().map_or(0, |s| s.index.document_count()),
            index_built_at: index.as_ref().map(|s| s.built_at),
            index_fresh,
            skipped_documents: index.map(|s| s.skipped.clone()).unwrap_or_default(),
        }
    }

    pub async fn close(&self) {
        self.inner.ledger.close().await;
    }
}

impl ScopeInner {
    fn manifest(&self) -> Arc<SyncManifest> {
        Arc::clone(&self.manifest.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn current_index(&self) -> Option<Arc<IndexSnapshot>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fresh_index(&self) -> Result<Arc<IndexSnapshot>> {
        let manifest = self.manifest();
        match self.current_index() {
            Some(snapshot) => {
                snapshot.check_fresh(
                    &manifest.fingerprint,
                    self.builder.signature(),
                    self.max_index_age,
                    chrono::Utc::now().timestamp(),
                )?;
                Ok(snapshot)
            }
            None => Err(RetrievalError::StaleIndex {
                role: self.role,
                index: "none".to_string(),
                manifest: short(&manifest.fingerprint).to_string(),
            }),
        }
    }

    async fn run_sync(&self, mode: SyncMode) -> Result<SyncResult> {
        if mode == SyncMode::Full {
            tracing::info!(role = %self.role, "full resync requested, discarding local mirror");
            self.reset_local().await?;
            return self.sync_and_index(true).await;
        }
        match self.sync_and_index(false).await {
            Err(e) if e.requires_full_rebuild() => {
                tracing::error!(role = %self.role, error = %e, "local state failure, running full resync");
                self.reset_local().await?;
                self.sync_and_index(false).await
            }
            other => other,
        }
    }

    async fn sync_and_index(&self, force_rebuild: bool) -> Result<SyncResult> {
        let result = self.sync_once().await?;
        let (_, rebuilt) = self.ensure_index(force_rebuild).await?;
        Ok(SyncResult {
            index_rebuilt: rebuilt,
            ..result
        })
    }

    async fn reset_local(&self) -> Result<()> {
        let _guard = self.rebuild_lock.lock().await;
        self.ledger.reset().await?;
        self.mirror.clear().await?;
        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(SyncManifest::default());
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// List, diff, fetch, and commit. Re-lists when an object vanishes mid-sync.
    async fn sync_once(&self) -> Result<SyncResult> {
        let mut relists = 0;
        loop {
            let listing = self.list_own().await?;
            let manifest = self.manifest();
            let delta = compute_delta(&listing, &manifest);

            match self.apply_delta(&manifest, &delta).await {
                Err(RetrievalError::NotFound { key }) if relists < MAX_RELISTS => {
                    relists += 1;
                    tracing::info!(role = %self.role, %key, relists, "object vanished during sync, re-listing");
                }
                Err(RetrievalError::NotFound { key }) => {
                    return Err(RetrievalError::rejected(format!(
                        "listing for {} kept changing ({} vanished after {} re-lists)",
                        self.role, key, relists
                    )));
                }
                other => return other,
            }
        }
    }

    /// List the store and keep only documents owned by this role.
    async fn list_own(&self) -> Result<Vec<DocumentRef>> {
        let mut listing = self.store.list(self.role).await?;
        let before = listing.len();
        listing.retain(|d| d.role == self.role);
        if listing.len() != before {
            tracing::warn!(role = %self.role, dropped = before - listing.len(), "listing returned foreign-role documents");
        }
        Ok(listing)
    }

    async fn apply_delta(&self, manifest: &SyncManifest, delta: &SyncDelta) -> Result<SyncResult> {
        let now = chrono::Utc::now().timestamp();
        let mut upserts: Vec<MirrorEntry> = Vec::new();

        for doc in delta.to_fetch() {
            let written = match self.store.fetch(doc).await {
                Ok(bytes) => self.mirror.write(doc, &bytes).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(local_path) => {
                    tracing::debug!(role = %self.role, key = %doc.key, version = %doc.version, "fetched");
                    upserts.push(MirrorEntry {
                        doc: doc.clone(),
                        local_path,
                        fetched_at: now,
                    });
                }
                Err(e) => {
                    for entry in &upserts {
                        let _ = self.mirror.remove(&entry.local_path).await;
                    }
                    return Err(e);
                }
            }
        }

        let mut entries = manifest.entries.clone();
        let mut replaced: Vec<PathBuf> = Vec::new();
        for key in &delta.removed {
            if let Some(old) = entries.remove(key) {
                replaced.push(old.local_path);
            }
        }
        for entry in &upserts {
            if let Some(old) = entries.insert(entry.doc.key.clone(), entry.clone()) {
                if old.local_path != entry.local_path {
                    replaced.push(old.local_path);
                }
            }
        }
        let next = SyncManifest::from_entries(entries.into_values(), Some(now));

        self.ledger
            .commit(&upserts, &delta.removed, &next.fingerprint, now)
            .await?;

        let changed = next.fingerprint != manifest.fingerprint;
        let result = SyncResult {
            role: self.role,
            added: delta.added.iter().map(|d| d.key.clone()).collect(),
            changed: delta.changed.iter().map(|d| d.key.clone()).collect(),
            removed: delta.removed.clone(),
            unchanged: delta.unchanged,
            previous_fingerprint: manifest.fingerprint.clone(),
            new_fingerprint: next.fingerprint.clone(),
            index_rebuilt: false,
        };

        *self.manifest.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        if changed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        for path in replaced {
            self.mirror.remove(&path).await?;
        }

        tracing::info!(
            role = %self.role,
            added = result.added.len(),
            changed = result.changed.len(),
            removed = result.removed.len(),
            unchanged = result.unchanged,
            fingerprint = short(&result.new_fingerprint),
            "sync complete"
        );
        Ok(result)
    }

    /// Return a fresh index, building and swapping one in if needed.
    /// With `force`, the first attempt rebuilds even a fresh index.
    /// The flag reports whether this call swapped.
    async fn ensure_index(&self, force: bool) -> Result<(Arc<IndexSnapshot>, bool)> {
        if !force {
            if let Ok(snapshot) = self.fresh_index() {
                return Ok((snapshot, false));
            }
        }

        let _guard = self.rebuild_lock.lock().await;
        for attempt in 0..MAX_REBUILD_ATTEMPTS {
            // Another caller may have rebuilt while we waited for the lock.
            if !(force && attempt == 0) {
                if let Ok(snapshot) = self.fresh_index() {
                    return Ok((snapshot, false));
                }
            }

            let generation = self.generation.load(Ordering::SeqCst);
            let manifest = self.manifest();
            let superseded = || self.generation.load(Ordering::SeqCst) != generation;

            tracing::info!(
                role = %self.role,
                documents = manifest.len(),
                fingerprint = short(&manifest.fingerprint),
                "rebuilding index"
            );
            let Some(snapshot) = self
                .builder
                .build(self.role, &manifest, &self.mirror, &superseded)
                .await?
            else {
                tracing::debug!(role = %self.role, "rebuild superseded by newer sync");
                continue;
            };
            if superseded() {
                continue;
            }

            let snapshot = Arc::new(snapshot);
            *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
            tracing::info!(
                role = %self.role,
                chunks = snapshot.index.len(),
                fingerprint = short(&snapshot.corpus_fingerprint),
                "swapped in new index"
            );

            if let Err(e) = snapshot.save(&self.index_path).await {
                tracing::warn!(role = %self.role, error = %e, "failed to persist index snapshot");
            }
            return Ok((snapshot, true));
        }

        Err(self
            .fresh_index()
            .err()
            .unwrap_or_else(|| RetrievalError::Storage("index rebuild did not converge".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedProvider;
    use crate::store::MemoryStore;
    use policy_retrieval_core::chunk::ChunkParams;
    use policy_retrieval_core::sanitize::Sanitizer;
    use tempfile::TempDir;

    fn builder() -> Arc<IndexBuilder> {
        Arc::new(IndexBuilder::new(
            ChunkParams::default(),
            Sanitizer::default(),
            Arc::new(HashedProvider::new(64)),
            16,
        ))
    }

    async fn open(tmp: &TempDir, store: &Arc<MemoryStore>) -> ScopeHandle {
        ScopeHandle::open(
            RoleScope::Employee,
            ScopePaths::new(tmp.path().join("employee")),
            store.clone(),
            builder(),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_sync_fetches_and_indexes() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/leave.md", "Apply for leave in the portal.");
        store.put("employee/travel.md", "Book travel through the travel desk.");

        let scope = open(&tmp, &store).await;
        assert!(!scope.has_synced());

        let result = scope.sync().await.unwrap();
        assert_eq!(result.added.len(), 2);
        assert!(result.index_rebuilt);
        assert!(scope.has_synced());
        assert_eq!(scope.fresh_index().unwrap().index.document_count(), 2);
        assert!(tmp.path().join("employee/index.json").exists());
    }

    #[tokio::test]
    async fn test_removed_document_deletes_mirror_file() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/a.md", "alpha");
        store.put("employee/b.md", "beta");
        let scope = open(&tmp, &store).await;
        scope.sync().await.unwrap();
        let b_path = scope.manifest().entries["employee/b.md"].local_path.clone();
        assert!(b_path.exists());

        store.remove("employee/b.md");
        let result = scope.sync().await.unwrap();
        assert_eq!(result.removed, vec!["employee/b.md".to_string()]);
        assert!(!b_path.exists());
        assert_eq!(scope.fresh_index().unwrap().index.document_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/a.md", "alpha policy text");
        {
            let scope = open(&tmp, &store).await;
            scope.sync().await.unwrap();
            scope.close().await;
        }
        tokio::fs::write(tmp.path().join("employee/index.json"), b"garbage")
            .await
            .unwrap();

        let scope = open(&tmp, &store).await;
        assert!(scope.last_index().is_none());
        assert!(scope.has_synced());
        let snapshot = scope.ensure_index().await.unwrap();
        assert_eq!(snapshot.index.document_count(), 1);
        assert_eq!(store.total_fetches(), 1);
    }

    #[tokio::test]
    async fn test_full_sync_does_not_join_incremental_sync() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/a.md", "alpha policy text");
        let scope = open(&tmp, &store).await;
        scope.sync().await.unwrap();
        store.reset_counters();
        store.set_list_delay(Some(Duration::from_millis(100)));

        let (incremental, full) = tokio::join!(scope.sync(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            scope.sync_with(SyncMode::Full).await
        });
        assert!(incremental.unwrap().added.is_empty());
        let full = full.unwrap();
        assert_eq!(full.added, vec!["employee/a.md".to_string()]);
        assert!(full.index_rebuilt);
        assert_eq!(store.list_calls(RoleScope::Employee), 2);
        assert_eq!(store.total_fetches(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_swaps_new_index_without_store_traffic() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/a.md", "alpha policy text");
        let scope = open(&tmp, &store).await;
        scope.sync().await.unwrap();
        let before = scope.last_index().unwrap();
        store.reset_counters();

        let after = scope.rebuild().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.corpus_fingerprint, before.corpus_fingerprint);
        assert!(Arc::ptr_eq(&after, &scope.fresh_index().unwrap()));
        assert_eq!(store.list_calls(RoleScope::Employee), 0);
        assert_eq!(store.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_stats_report_documents_and_index() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("employee/a.md", "alpha");
        let scope = open(&tmp, &store).await;
        let before = scope.stats();
        assert_eq!(before.documents, 0);
        assert!(!before.index_fresh);

        scope.sync().await.unwrap();
        let stats = scope.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.total_bytes, 5);
        assert!(stats.index_fresh);
        assert_eq!(stats.index_chunks, 1);
        assert!(stats.last_sync.is_some());
    }
}
