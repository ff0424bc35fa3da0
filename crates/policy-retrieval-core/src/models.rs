//! Core data models shared by the sync, indexing, and query layers.
//!
//! These types describe remote documents, their local mirror entries, the
//! per-role manifest, chunks, and scored retrieval results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::fingerprint::aggregate_fingerprint;

/// An access tier. Every document, chunk, and index belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleScope {
    Executive,
    Employee,
    Master,
}

impl RoleScope {
    /// All role scopes, in a stable order.
    pub const ALL: [RoleScope; 3] = [RoleScope::Executive, RoleScope::Employee, RoleScope::Master];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleScope::Executive => "executive",
            RoleScope::Employee => "employee",
            RoleScope::Master => "master",
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "executive" => Ok(RoleScope::Executive),
            "employee" => Ok(RoleScope::Employee),
            "master" => Ok(RoleScope::Master),
            other => Err(format!(
                "unknown role '{}': expected executive, employee, or master",
                other
            )),
        }
    }
}

/// A remote object as reported by a store listing.
///
/// Immutable once observed. A new version identifier for the same key
/// produces a new `DocumentRef` rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Full object key, including the role prefix.
    pub key: String,
    pub role: RoleScope,
    /// Opaque store-supplied version token (e.g. an ETag). Compared by equality only.
    pub version: String,
    pub size: u64,
}

impl DocumentRef {
    pub fn new(
        key: impl Into<String>,
        role: RoleScope,
        version: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            key: key.into(),
            role,
            version: version.into(),
            size,
        }
    }

    /// Last path segment of the key, used as the citation title.
    pub fn title(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// A document that has been fetched into the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub doc: DocumentRef,
    pub local_path: PathBuf,
    /// Unix seconds at which the bytes were fetched.
    pub fetched_at: i64,
}

/// The version ledger for one role scope: key → mirrored entry, plus the
/// aggregate fingerprint over all entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncManifest {
    pub entries: BTreeMap<String, MirrorEntry>,
    pub fingerprint: String,
    /// Unix seconds of the last completed sync, if any.
    pub last_sync: Option<i64>,
}

impl SyncManifest {
    /// Build a manifest from entries, computing the fingerprint.
    pub fn from_entries(entries: impl IntoIterator<Item = MirrorEntry>, last_sync: Option<i64>) -> Self {
        let entries: BTreeMap<String, MirrorEntry> = entries
            .into_iter()
            .map(|e| (e.doc.key.clone(), e))
            .collect();
        let fingerprint = fingerprint_of(&entries);
        Self {
            entries,
            fingerprint,
            last_sync,
        }
    }

    /// Recompute the aggregate fingerprint from the current entries.
    pub fn compute_fingerprint(&self) -> String {
        fingerprint_of(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.doc.size).sum()
    }
}

fn fingerprint_of(entries: &BTreeMap<String, MirrorEntry>) -> String {
    aggregate_fingerprint(
        entries
            .values()
            .map(|e| (e.doc.key.as_str(), e.doc.version.as_str())),
    )
}

/// An ordered span of document text used as the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from role, document key, and index.
    pub id: String,
    pub role: RoleScope,
    pub document_key: String,
    pub chunk_index: usize,
    pub text: String,
    /// Byte offset of `text` within the (sanitised) document text.
    pub start: usize,
    /// Byte offset one past the end of `text`.
    pub end: usize,
    /// Leading bytes of `text` that repeat the tail of the previous chunk.
    pub overlap_prev: usize,
    /// Trailing bytes of `text` that are repeated at the head of the next chunk.
    pub overlap_next: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    pub fn title(&self) -> &str {
        self.document_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.document_key)
    }
}

/// A chunk surviving fusion, thresholding, and deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub role: RoleScope,
    pub document_key: String,
    pub title: String,
    pub chunk_index: usize,
    pub text: String,
    /// Fused score in `[0.0, 1.0]`.
    pub score: f64,
    pub lexical_score: f64,
    pub vector_score: f64,
}

/// A source citation attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub document_key: String,
    pub title: String,
}

impl From<&ScoredChunk> for Citation {
    fn from(sc: &ScoredChunk) -> Self {
        Self {
            document_key: sc.document_key.clone(),
            title: sc.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, version: &str) -> MirrorEntry {
        MirrorEntry {
            doc: DocumentRef::new(key, RoleScope::Employee, version, 10),
            local_path: PathBuf::from(format!("/tmp/{}", key)),
            fetched_at: 0,
        }
    }

    #[test]
    fn test_role_parse_case_insensitive() {
        assert_eq!("Employee".parse::<RoleScope>().unwrap(), RoleScope::Employee);
        assert_eq!(" EXECUTIVE ".parse::<RoleScope>().unwrap(), RoleScope::Executive);
        assert!("contractor".parse::<RoleScope>().is_err());
    }

    #[test]
    fn test_title_is_last_segment() {
        let d = DocumentRef::new("employee/policies/Leave-Policy.pdf", RoleScope::Employee, "v1", 1);
        assert_eq!(d.title(), "Leave-Policy.pdf");
    }

    #[test]
    fn test_manifest_fingerprint_tracks_entries() {
        let m1 = SyncManifest::from_entries(vec![entry("a", "1"), entry("b", "1")], None);
        let m2 = SyncManifest::from_entries(vec![entry("b", "1"), entry("a", "1")], None);
        assert_eq!(m1.fingerprint, m2.fingerprint);

        let m3 = SyncManifest::from_entries(vec![entry("a", "2"), entry("b", "1")], None);
        assert_ne!(m1.fingerprint, m3.fingerprint);

        let m4 = SyncManifest::from_entries(vec![entry("a", "1")], None);
        assert_ne!(m1.fingerprint, m4.fingerprint);
        assert_eq!(m4.compute_fingerprint(), m4.fingerprint);
    }
}
