//! In-process document store.
//!
//! Used by tests and by embedders that already hold documents in memory.
//! Counts `list` and `fetch` calls and supports injected failures and
//! delays so sync behaviour can be observed precisely.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use policy_retrieval_core::models::{DocumentRef, RoleScope};

use super::{owning_role, DocumentStore};
use crate::config::PrefixConfig;
use crate::error::{Result, RetrievalError};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, (String, Vec<u8>)>,
    list_calls: HashMap<RoleScope, usize>,
    fetch_calls: HashMap<String, usize>,
    /// Remaining `list` calls that fail with a transient error.
    failing_lists: usize,
    /// Remaining `fetch` calls that fail with a transient error.
    failing_fetches: usize,
    unavailable: bool,
    /// Keys deleted at the moment they are next fetched.
    vanish_on_fetch: HashSet<String>,
    list_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    prefixes: PrefixConfig,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefixes(prefixes: PrefixConfig) -> Self {
        Self {
            prefixes,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves only counters inconsistent.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or replace an object. The version is a digest of the content.
    pub fn put(&self, key: &str, body: impl Into<Vec<u8>>) -> String {
        let body = body.into();
        let version = hex::encode(&Sha256::digest(&body)[..8]);
        self.put_versioned(key, &version, body);
        version
    }

    pub fn put_versioned(&self, key: &str, version: &str, body: impl Into<Vec<u8>>) {
        self.state()
            .objects
            .insert(key.to_string(), (version.to_string(), body.into()));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state().objects.remove(key).is_some()
    }

    pub fn list_calls(&self, role: RoleScope) -> usize {
        self.state().list_calls.get(&role).copied().unwrap_or(0)
    }

    pub fn fetch_calls(&self, key: &str) -> usize {
        self.state().fetch_calls.get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.state().fetch_calls.values().sum()
    }

    /// Keys fetched at least once since the last reset, sorted.
    pub fn fetched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().fetch_calls.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn reset_counters(&self) {
        let mut s = self.state();
        s.list_calls.clear();
        s.fetch_calls.clear();
    }

    pub fn fail_next_lists(&self, n: usize) {
        self.state().failing_lists = n;
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.state().failing_fetches = n;
    }

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Simulate a key disappearing between `list` and `fetch`.
    pub fn vanish_on_fetch(&self, key: &str) {
        self.state().vanish_on_fetch.insert(key.to_string());
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state().list_delay = delay;
    }

    /// Delay every `fetch` by `delay`, applied before the object is read.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state().fetch_delay = delay;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>> {
        let delay = {
            let mut s = self.state();
            *s.list_calls.entry(role).or_insert(0) += 1;
            s.list_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.state();
        if s.unavailable {
            return Err(RetrievalError::unavailable("memory store offline"));
        }
        if s.failing_lists > 0 {
            s.failing_lists -= 1;
            return Err(RetrievalError::unavailable("injected list failure"));
        }

        let prefix = self.prefixes.for_role(role);
        Ok(s.objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| owning_role(&self.prefixes, k) == Some(role))
            .map(|(k, (version, body))| DocumentRef::new(k.clone(), role, version.clone(), body.len() as u64))
            .collect())
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        let delay = {
            let mut s = self.state();
            *s.fetch_calls.entry(doc.key.clone()).or_insert(0) += 1;
            s.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.state();

        if s.unavailable {
            return Err(RetrievalError::unavailable("memory store offline"));
        }
        if s.failing_fetches > 0 {
            s.failing_fetches -= 1;
            return Err(RetrievalError::unavailable("injected fetch failure"));
        }
        if s.vanish_on_fetch.remove(&doc.key) {
            s.objects.remove(&doc.key);
        }

        s.objects
            .get(&doc.key)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| RetrievalError::NotFound {
                key: doc.key.clone(),
            })
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_and_fetch_counts() {
        let store = MemoryStore::new();
        store.put("employee/a.md", "alpha");
        store.put("executive/b.md", "beta");

        let docs = store.list(RoleScope::Employee).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].role, RoleScope::Employee);
        assert_eq!(store.fetch(&docs[0]).await.unwrap(), b"alpha");
        assert_eq!(store.list_calls(RoleScope::Employee), 1);
        assert_eq!(store.fetch_calls("employee/a.md"), 1);
        assert_eq!(store.list_calls(RoleScope::Executive), 0);
    }

    #[tokio::test]
    async fn test_put_same_content_same_version() {
        let store = MemoryStore::new();
        let v1 = store.put("employee/a.md", "alpha");
        let v2 = store.put("employee/a.md", "alpha");
        let v3 = store.put("employee/a.md", "alpha v2");
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.put("employee/a.md", "alpha");
        store.fail_next_lists(1);
        assert!(store.list(RoleScope::Employee).await.unwrap_err().is_transient());
        assert!(store.list(RoleScope::Employee).await.is_ok());

        store.vanish_on_fetch("employee/a.md");
        let doc = DocumentRef::new("employee/a.md", RoleScope::Employee, "x", 5);
        assert!(matches!(
            store.fetch(&doc).await,
            Err(RetrievalError::NotFound { .. })
        ));
        assert!(store.list(RoleScope::Employee).await.unwrap().is_empty());
    }
}
