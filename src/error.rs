//! Error taxonomy for the retrieval subsystem.
//!
//! Library code returns [`RetrievalError`]; the CLI and config loading use
//! `anyhow` at the edges. The error is `Clone` so a coalesced sync result
//! can be handed to every caller that joined it.

use policy_retrieval_core::models::RoleScope;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetrievalError {
    /// The query was rejected before any retrieval work. The message is user-facing.
    #[error("{0}")]
    Validation(String),

    /// An object vanished between `list` and `fetch`.
    #[error("object not found in store: {key}")]
    NotFound { key: String },

    /// The index fingerprint no longer matches the manifest.
    #[error("index for {role} is stale (index {index}, manifest {manifest})")]
    StaleIndex {
        role: RoleScope,
        index: String,
        manifest: String,
    },

    /// Listing or fetching failed. `retryable` marks network, 5xx and 429 failures.
    #[error("document store unavailable: {reason}")]
    StoreUnavailable { reason: String, retryable: bool },

    /// Local persistence failed (ledger, mirror files, snapshots).
    #[error("local storage failure: {0}")]
    Storage(String),

    /// A persisted artifact could not be decoded.
    #[error("corrupt {what}: {detail}")]
    Corrupt { what: String, detail: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RetrievalError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn corrupt(what: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether retrying the same store call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RetrievalError::StoreUnavailable {
                retryable: true,
                ..
            }
        )
    }

    /// Whether the scope's local state must be discarded and rebuilt from the store.
    pub fn requires_full_rebuild(&self) -> bool {
        matches!(
            self,
            RetrievalError::Storage(_) | RetrievalError::Corrupt { .. }
        )
    }

    /// Stable machine-readable code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::Validation(_) => "validation_error",
            RetrievalError::NotFound { .. } => "not_found",
            RetrievalError::StaleIndex { .. } => "stale_index",
            RetrievalError::StoreUnavailable { .. } => "store_unavailable",
            RetrievalError::Storage(_) => "storage_error",
            RetrievalError::Corrupt { .. } => "corrupt",
            RetrievalError::Embedding(_) => "embedding_error",
            RetrievalError::Config(_) => "config_error",
        }
    }
}

impl From<std::io::Error> for RetrievalError {
    fn from(e: std::io::Error) -> Self {
        RetrievalError::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for RetrievalError {
    fn from(e: sqlx::Error) -> Self {
        RetrievalError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RetrievalError {
    fn from(e: serde_json::Error) -> Self {
        RetrievalError::corrupt("json", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RetrievalError::unavailable("503").is_transient());
        assert!(!RetrievalError::rejected("403").is_transient());
        assert!(!RetrievalError::NotFound { key: "k".into() }.is_transient());
        assert!(!RetrievalError::Validation("short".into()).is_transient());
    }

    #[test]
    fn test_full_rebuild_classification() {
        assert!(RetrievalError::Storage("disk".into()).requires_full_rebuild());
        assert!(RetrievalError::corrupt("index", "eof").requires_full_rebuild());
        assert!(!RetrievalError::unavailable("net").requires_full_rebuild());
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let e: RetrievalError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(e.code(), "storage_error");
    }
}
