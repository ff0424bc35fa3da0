//! Bounded retry with exponential backoff for transient store failures.
//!
//! Only errors classified by [`RetrievalError::is_transient`] are retried.
//! `NotFound` is returned immediately: the sync loop recovers from it by
//! re-listing, which a blind retry of the same key cannot do.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use policy_retrieval_core::models::{DocumentRef, RoleScope};

use super::DocumentStore;
use crate::error::{Result, RetrievalError};

/// Upper bound on the backoff exponent (base × 2^6).
const MAX_BACKOFF_SHIFT: u32 = 6;

pub struct RetryingStore<S> {
    inner: S,
    max_retries: u32,
    base_delay: Duration,
}

impl<S: DocumentStore> RetryingStore<S> {
    pub fn new(inner: S, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    // Backoff: base, 2×base, 4×base, ...
                    let delay = self.base_delay * (1u32 << attempt.min(MAX_BACKOFF_SHIFT));
                    tracing::warn!(
                        op,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(RetrievalError::StoreUnavailable { reason, .. }) if attempt > 0 => {
                    return Err(RetrievalError::rejected(format!(
                        "{} (gave up after {} attempts)",
                        reason,
                        attempt + 1
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RetryingStore<S> {
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>> {
        self.with_retries("list", || self.inner.list(role)).await
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        self.with_retries("fetch", || self.inner.fetch(doc)).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
