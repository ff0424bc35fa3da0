//! Document store clients.
//!
//! A [`DocumentStore`] lists the objects under a role's key prefix with
//! their version identifiers (metadata only, no content transfer) and
//! fetches object bytes on demand.
//!
//! | Store | Version identifier |
//! |-------|--------------------|
//! | [`S3Store`] | object ETag |
//! | [`FsStore`] | file size + modification time |
//! | [`MemoryStore`] | caller-supplied or content digest |
//!
//! [`RetryingStore`] wraps any store with bounded exponential backoff for
//! transient failures.

mod fs;
mod memory;
mod retry;
mod s3;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use retry::RetryingStore;
pub use s3::S3Store;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;
use std::time::Duration;

use policy_retrieval_core::models::{DocumentRef, RoleScope};

use crate::config::{Config, PrefixConfig, StoreKind};
use crate::error::{Result, RetrievalError};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All objects under `role`'s prefix, sorted by key.
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>>;

    /// Object bytes. Fails with [`RetrievalError::NotFound`] if the key vanished.
    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>>;

    /// Short human-readable description (`s3://bucket`, `file:///path`).
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>> {
        (**self).list(role).await
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        (**self).fetch(doc).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Include/exclude glob filter applied to keys relative to the role prefix.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl KeyFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string(), "**/.DS_Store".to_string()];
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn allow_all() -> Self {
        Self {
            include: build_globset(&["**/*".to_string()]).unwrap_or_else(|_| GlobSet::empty()),
            exclude: GlobSet::empty(),
        }
    }

    pub fn matches(&self, relative_key: &str) -> bool {
        !self.exclude.is_match(relative_key) && self.include.is_match(relative_key)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RetrievalError::Config(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RetrievalError::Config(e.to_string()))
}

/// Strip `prefix` from `key`, returning the part used for glob matching.
///
/// Returns `None` for keys outside the prefix; those never belong to the role.
pub(crate) fn relative_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty())
}

/// Which role, if any, owns `key`. The longest matching prefix wins so that
/// nested prefixes (`hr/` and `hr/exec/`) never assign a key to both roles.
pub(crate) fn owning_role(prefixes: &PrefixConfig, key: &str) -> Option<RoleScope> {
    RoleScope::ALL
        .iter()
        .copied()
        .filter(|role| key.starts_with(prefixes.for_role(*role)))
        .max_by_key(|role| prefixes.for_role(*role).len())
}

/// Build the configured store, wrapped with retries.
pub fn create_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    let store = &config.store;
    let filter = KeyFilter::new(&store.include_globs, &store.exclude_globs)?;
    let base_delay = Duration::from_millis(store.retry_base_ms);

    let inner: Arc<dyn DocumentStore> = match store.kind {
        StoreKind::S3 => Arc::new(S3Store::from_config(store, filter)?),
        StoreKind::Filesystem => {
            let root = store
                .root
                .clone()
                .ok_or_else(|| RetrievalError::Config("store.root is not set".into()))?;
            Arc::new(FsStore::new(root, store.prefixes.clone(), filter))
        }
    };

    Ok(Arc::new(RetryingStore::new(inner, store.max_retries, base_delay)))
}
