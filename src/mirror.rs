//! On-disk mirror of fetched document bytes for one role scope.
//!
//! Files are named from the key's last segment plus short digests of the
//! key and the version, so distinct keys never collide and a new version
//! never overwrites the bytes an in-progress rebuild may still be reading.
//! Writes go to a temp file that is then renamed into place.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use policy_retrieval_core::models::DocumentRef;

use crate::error::Result;

const MAX_STEM_LEN: usize = 60;

#[derive(Debug, Clone)]
pub struct Mirror {
    dir: PathBuf,
}

impl Mirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, doc: &DocumentRef) -> PathBuf {
        let name = doc.title();
        let (stem, ext) = match name.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s, Some(e)),
            _ => (name, None),
        };
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(MAX_STEM_LEN)
            .collect();

        let mut file = format!("{}-{}-{}", stem, digest8(&doc.key), digest8(&doc.version));
        if let Some(ext) = ext {
            let ext: String = ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if !ext.is_empty() {
                file.push('.');
                file.push_str(&ext.to_ascii_lowercase());
            }
        }
        self.dir.join(file)
    }

    /// Write `bytes` for `doc` atomically and return the final path.
    pub async fn write(&self, doc: &DocumentRef, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(doc);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    /// Remove a file; a missing file is not an error.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete files not referenced by `keep` (leftovers from crashes or
    /// replaced versions). Returns how many were removed.
    pub async fn sweep(&self, keep: &HashSet<PathBuf>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && !keep.contains(&path) {
                self.remove(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every mirrored file.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn digest8(s: &str) -> String {
    hex::encode(&Sha256::digest(s.as_bytes())[..4])
}
