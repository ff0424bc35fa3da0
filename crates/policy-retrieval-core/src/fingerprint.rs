//! Aggregate corpus fingerprints.
//!
//! A role scope's fingerprint is a SHA-256 over its sorted
//! `(key, version)` pairs. It changes exactly when an entry is added,
//! replaced with a new version, or removed, and is independent of the
//! order in which entries are supplied.

use sha2::{Digest, Sha256};

/// Compute the aggregate fingerprint of a set of `(key, version)` pairs.
///
/// Each field is length-prefixed so that no two distinct sets can
/// produce the same byte stream.
///
/// ```rust
/// use policy_retrieval_core::fingerprint::aggregate_fingerprint;
///
/// let a = aggregate_fingerprint([("k1", "v1"), ("k2", "v2")]);
/// let b = aggregate_fingerprint([("k2", "v2"), ("k1", "v1")]);
/// assert_eq!(a, b);
/// ```
pub fn aggregate_fingerprint<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = entries.into_iter().collect();
    pairs.sort_unstable();
    pairs.dedup();

    let mut hasher = Sha256::new();
    hasher.update((pairs.len() as u64).to_le_bytes());
    for (key, version) in pairs {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((version.len() as u64).to_le_bytes());
        hasher.update(version.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Short, human-readable prefix of a fingerprint for logs and stats.
pub fn short(fingerprint: &str) -> &str {
    let end = fingerprint.len().min(12);
    &fingerprint[..end]
}
