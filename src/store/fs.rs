//! Local directory document store.
//!
//! Objects live at `<root>/<key>`, so role prefixes are subdirectories
//! (`<root>/employee/...`). The version identifier is derived from file
//! metadata (size and modification time); file content is never read
//! during a listing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use policy_retrieval_core::models::{DocumentRef, RoleScope};

use super::{owning_role, relative_key, DocumentStore, KeyFilter};
use crate::config::PrefixConfig;
use crate::error::{Result, RetrievalError};

pub struct FsStore {
    root: PathBuf,
    prefixes: PrefixConfig,
    filter: KeyFilter,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>, prefixes: PrefixConfig, filter: KeyFilter) -> Self {
        Self {
            root: root.into(),
            prefixes,
            filter,
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(RetrievalError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(key))
    }
}

fn metadata_version(meta: &std::fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", meta.len(), mtime)
}

fn key_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Walk `<root>/<prefix>` and describe every file owned by `role`.
fn walk_role(
    root: &Path,
    prefixes: &PrefixConfig,
    filter: &KeyFilter,
    role: RoleScope,
) -> Result<Vec<DocumentRef>> {
    let prefix = prefixes.for_role(role);
    let dir = root.join(prefix.trim_end_matches('/'));
    if !root.exists() {
        return Err(RetrievalError::rejected(format!(
            "store root does not exist: {}",
            root.display()
        )));
    }
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut docs = Vec::new();
    for entry in WalkDir::new(&dir).follow_links(false) {
        let entry = entry.map_err(|e| RetrievalError::unavailable(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = key_of(root, entry.path()) else {
            continue;
        };
        let Some(rel) = relative_key(prefix, &key) else {
            continue;
        };
        if owning_role(prefixes, &key) != Some(role) || !filter.matches(rel) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| RetrievalError::unavailable(e.to_string()))?;
        docs.push(DocumentRef::new(
            key,
            role,
            metadata_version(&meta),
            meta.len(),
        ));
    }

    docs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(docs)
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn list(&self, role: RoleScope) -> Result<Vec<DocumentRef>> {
        let root = self.root.clone();
        let prefixes = self.prefixes.clone();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || walk_role(&root, &prefixes, &filter, role))
            .await
            .map_err(|e| RetrievalError::unavailable(format!("listing task failed: {}", e)))?
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Vec<u8>> {
        let path = self.path_for(&doc.key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RetrievalError::NotFound {
                key: doc.key.clone(),
            }),
            Err(e) => Err(RetrievalError::unavailable(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(root: &Path) -> FsStore {
        FsStore::new(root, PrefixConfig::default(), KeyFilter::allow_all())
    }

    fn write(root: &Path, key: &str, body: &str) {
        let path = root.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_role_prefix() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "employee/leave.md", "leave");
        write(tmp.path(), "employee/sub/expenses.md", "expenses");
        write(tmp.path(), "executive/comp.md", "comp");

        let s = store(tmp.path());
        let keys: Vec<String> = s
            .list(RoleScope::Employee)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["employee/leave.md", "employee/sub/expenses.md"]);
        assert!(s.list(RoleScope::Master).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_changes_with_size() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "employee/leave.md", "v1");
        let s = store(tmp.path());
        let before = s.list(RoleScope::Employee).await.unwrap();
        write(tmp.path(), "employee/leave.md", "version two");
        let after = s.list(RoleScope::Employee).await.unwrap();
        assert_ne!(before[0].version, after[0].version);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let s = store(tmp.path());
        let doc = DocumentRef::new("employee/gone.md", RoleScope::Employee, "1", 1);
        let err = s.fetch(&doc).await.unwrap_err();
        assert!(matches!(err, RetrievalError::NotFound { .. }));

        let sneaky = DocumentRef::new("employee/../../etc/passwd", RoleScope::Employee, "1", 1);
        assert!(s.fetch(&sneaky).await.is_err());
    }
}
