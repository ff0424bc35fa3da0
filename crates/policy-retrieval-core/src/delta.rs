//! Delta computation between a store listing and a [`SyncManifest`].
//!
//! Classification is by key:
//!
//! | Listing | Manifest | Result |
//! |---------|----------|--------|
//! | present | absent | added |
//! | present | present, version differs | changed |
//! | present | present, same version | unchanged |
//! | absent | present | removed |
//!
//! Only `added` and `changed` require fetching content.

use std::collections::BTreeSet;

use crate::models::{DocumentRef, SyncManifest};

/// The minimal set of changes needed to bring a manifest in line with a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDelta {
    pub added: Vec<DocumentRef>,
    pub changed: Vec<DocumentRef>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Documents whose content must be fetched.
    pub fn to_fetch(&self) -> impl Iterator<Item = &DocumentRef> {
        self.added.iter().chain(self.changed.iter())
    }
}

/// Compare a listing against the manifest.
///
/// If the listing reports the same key more than once, the last occurrence
/// wins. Output vectors are sorted by key.
pub fn compute_delta(listing: &[DocumentRef], manifest: &SyncManifest) -> SyncDelta {
    let mut delta = SyncDelta::default();
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    let mut latest: Vec<&DocumentRef> = Vec::with_capacity(listing.len());
    for doc in listing.iter().rev() {
        if seen.insert(doc.key.as_str()) {
            latest.push(doc);
        }
    }
    latest.sort_by(|a, b| a.key.cmp(&b.key));

    for doc in latest {
        match manifest.entries.get(&doc.key) {
            None => delta.added.push(doc.clone()),
            Some(entry) if entry.doc.version != doc.version => delta.changed.push(doc.clone()),
            Some(_) => delta.unchanged += 1,
        }
    }

    delta.removed = manifest
        .entries
        .keys()
        .filter(|k| !seen.contains(k.as_str()))
        .cloned()
        .collect();

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MirrorEntry, RoleScope};
    use std::path::PathBuf;

    fn doc(key: &str, version: &str) -> DocumentRef {
        DocumentRef::new(key, RoleScope::Employee, version, 100)
    }

    fn manifest(docs: &[DocumentRef]) -> SyncManifest {
        SyncManifest::from_entries(
            docs.iter().map(|d| MirrorEntry {
                doc: d.clone(),
                local_path: PathBuf::from(&d.key),
                fetched_at: 1,
            }),
            Some(1),
        )
    }

    #[test]
    fn test_empty_manifest_everything_added() {
        let listing = vec![doc("b", "1"), doc("a", "1")];
        let delta = compute_delta(&listing, &SyncManifest::default());
        let keys: Vec<&str> = delta.added.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(delta.changed.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn test_no_changes_is_empty() {
        let listing = vec![doc("a", "1"), doc("b", "2")];
        let delta = compute_delta(&listing, &manifest(&listing));
        assert!(delta.is_empty());
        assert_eq!(delta.unchanged, 2);
        assert_eq!(delta.to_fetch().count(), 0);
    }

    #[test]
    fn test_mixed_delta() {
        let old = vec![doc("a", "1"), doc("b", "1"), doc("c", "1")];
        let listing = vec![doc("a", "1"), doc("b", "2"), doc("d", "1")];
        let delta = compute_delta(&listing, &manifest(&old));

        assert_eq!(delta.added, vec![doc("d", "1")]);
        assert_eq!(delta.changed, vec![doc("b", "2")]);
        assert_eq!(delta.removed, vec!["c".to_string()]);
        assert_eq!(delta.unchanged, 1);

        let fetch: Vec<&str> = delta.to_fetch().map(|d| d.key.as_str()).collect();
        assert_eq!(fetch, vec!["d", "b"]);
    }

    #[test]
    fn test_duplicate_listing_last_wins() {
        let old = vec![doc("a", "1")];
        let listing = vec![doc("a", "1"), doc("a", "2")];
        let delta = compute_delta(&listing, &manifest(&old));
        assert_eq!(delta.changed, vec![doc("a", "2")]);
        assert_eq!(delta.unchanged, 0);
    }
}
