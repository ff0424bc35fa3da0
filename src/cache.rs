//! Response cache: memoised answers keyed by normalised query, role, and
//! corpus fingerprint.
//!
//! Because the fingerprint is part of the key, a corpus change makes old
//! entries unreachable immediately; [`ResponseCache::retain_fingerprint`]
//! then reclaims their space. Capacity is enforced by least-recently-used
//! eviction ([`lru::LruCache`]): every `get` hit and every `put` marks the
//! entry most recently used.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use policy_retrieval_core::models::{Citation, RoleScope};

use crate::error::{Result, RetrievalError};

/// Cache key for a normalised query within one role's corpus version.
pub fn cache_key(normalized_query: &str, role: RoleScope, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update([0]);
    hasher.update(role.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub role: RoleScope,
    pub fingerprint: String,
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    /// Unix seconds.
    pub created_at: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct State {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl State {
    fn remove_where(&mut self, pred: impl Fn(&CacheEntry) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.entries.pop(key);
        }
        doomed.len()
    }
}

/// On-disk form: entries from least to most recently used.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<CacheEntry>,
}

pub struct ResponseCache {
    capacity: NonZeroUsize,
    state: Mutex<State>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an entry, counting the hit and marking it most recently used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let hit = state.entries.get_mut(key).map(|entry| {
            entry.hit_count += 1;
            entry.clone()
        });
        match hit {
            Some(_) => state.hits += 1,
            None => state.misses += 1,
        }
        hit
    }

    /// Insert or replace (last write wins), evicting the least recently used
    /// entry when full.
    pub fn put(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        let displaced = self.state().entries.push(key.clone(), entry);
        if let Some((evicted_key, evicted)) = displaced {
            if evicted_key != key {
                tracing::debug!(role = %evicted.role, key = %evicted_key, "evicted least recently used response");
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state().entries.pop(key).is_some()
    }

    /// Drop one role's entries, or every entry when `role` is `None`.
    pub fn clear(&self, role: Option<RoleScope>) -> usize {
        let mut state = self.state();
        let removed = match role {
            Some(role) => state.remove_where(|e| e.role == role),
            None => {
                let n = state.entries.len();
                state.entries.clear();
                n
            }
        };
        tracing::info!(role = ?role, removed, "cleared response cache");
        removed
    }

    /// Drop `role`'s entries recorded against any other fingerprint.
    pub fn retain_fingerprint(&self, role: RoleScope, fingerprint: &str) -> usize {
        let removed = self
            .state()
            .remove_where(|e| e.role == role && e.fingerprint != fingerprint);
        if removed > 0 {
            tracing::debug!(%role, removed, "purged responses for superseded corpus");
        }
        removed
    }

    /// Entries, most recently used first.
    pub fn entries(&self, limit: usize, offset: usize) -> Vec<CacheEntry> {
        self.state()
            .entries
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            capacity: self.capacity.get(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state();
            let snapshot = Snapshot {
                entries: state.entries.iter().rev().map(|(_, e)| e.clone()).collect(),
            };
            serde_json::to_vec_pretty(&snapshot)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a saved cache. A missing file yields an empty cache.
    pub async fn load(path: &Path, capacity: usize) -> Result<Self> {
        let cache = Self::new(capacity);
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| RetrievalError::corrupt("response cache", e))?;
        for entry in snapshot.entries {
            cache.put(entry);
        }
        Ok(cache)
    }
}
