//! Index building and snapshot persistence for one role scope.
//!
//! An [`IndexSnapshot`] is a [`HybridIndex`] plus the metadata needed to
//! decide whether it may still be queried:
//!
//! - `corpus_fingerprint` must equal the manifest's aggregate fingerprint;
//! - `config_signature` must equal the running configuration's signature
//!   (chunking parameters, embedding model and dimensions, sanitiser rules,
//!   snapshot format);
//! - `built_at` must be within `sync.max_index_age_hours`, when set.
//!
//! Any mismatch yields [`RetrievalError::StaleIndex`] and the scope rebuilds.
//!
//! # Build pipeline
//!
//! ```text
//! mirror bytes → extract_text → Sanitizer → chunk_document → embed_all → HybridIndex
//! ```
//!
//! Extraction failures skip the document with a warning. A mirrored file
//! that cannot be read is a local-storage failure and fails the build.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use policy_retrieval_core::chunk::{chunk_document, ChunkParams};
use policy_retrieval_core::fingerprint::short;
use policy_retrieval_core::models::{Chunk, RoleScope, SyncManifest};
use policy_retrieval_core::sanitize::Sanitizer;
use policy_retrieval_core::search::HybridIndex;

use crate::config::Config;
use crate::embedding::{embed_all, Embedder};
use crate::error::{Result, RetrievalError};
use crate::extract::extract_text;
use crate::mirror::Mirror;

pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub format_version: u32,
    pub role: RoleScope,
    pub corpus_fingerprint: String,
    pub config_signature: String,
    /// Unix seconds.
    pub built_at: i64,
    /// Keys whose text could not be extracted.
    #[serde(default)]
    pub skipped: Vec<String>,
    pub index: HybridIndex,
}

impl IndexSnapshot {
    /// `Ok(())` when this snapshot may serve queries for `manifest_fingerprint`.
    pub fn check_fresh(
        &self,
        manifest_fingerprint: &str,
        signature: &str,
        max_age: Option<Duration>,
        now: i64,
    ) -> Result<()> {
        let stale = self.corpus_fingerprint != manifest_fingerprint
            || self.config_signature != signature
            || max_age.is_some_and(|age| now.saturating_sub(self.built_at) > age.as_secs() as i64);

        if stale {
            return Err(RetrievalError::StaleIndex {
                role: self.role,
                index: short(&self.corpus_fingerprint).to_string(),
                manifest: short(manifest_fingerprint).to_string(),
            });
        }
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(self)?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a snapshot for `role`. A missing file is `Ok(None)`.
    pub async fn load(path: &Path, role: RoleScope) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: IndexSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| RetrievalError::corrupt("index snapshot", e))?;

        if snapshot.format_version != INDEX_FORMAT_VERSION {
            return Err(RetrievalError::corrupt(
                "index snapshot",
                format!("format version {} (expected {})", snapshot.format_version, INDEX_FORMAT_VERSION),
            ));
        }
        if snapshot.role != role || snapshot.index.role() != role {
            return Err(RetrievalError::corrupt(
                "index snapshot",
                format!("snapshot belongs to {}, not {}", snapshot.role, role),
            ));
        }
        Ok(Some(snapshot))
    }
}

/// Builds index snapshots from a role's mirror.
pub struct IndexBuilder {
    chunk_params: ChunkParams,
    sanitizer: Sanitizer,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    signature: String,
}

impl IndexBuilder {
    pub fn new(
        chunk_params: ChunkParams,
        sanitizer: Sanitizer,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Self {
        let signature = config_signature(&chunk_params, &sanitizer, embedder.as_ref());
        Self {
            chunk_params,
            sanitizer,
            embedder,
            batch_size,
            signature,
        }
    }

    pub fn from_config(config: &Config, embedder: Arc<dyn Embedder>) -> Self {
        Self::new(
            config.chunk_params(),
            config.sanitizer(),
            embedder,
            config.embedding.batch_size,
        )
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Build a snapshot of `manifest`.
    ///
    /// `superseded` is polled between documents; once it returns true the
    /// build stops and returns `Ok(None)`.
    pub async fn build(
        &self,
        role: RoleScope,
        manifest: &SyncManifest,
        mirror: &Mirror,
        superseded: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Option<IndexSnapshot>> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut skipped = Vec::new();

        for entry in manifest.entries.values() {
            if superseded() {
                return Ok(None);
            }
            if entry.doc.role != role {
                tracing::warn!(%role, key = %entry.doc.key, "skipping entry owned by another role");
                continue;
            }

            let bytes = match mirror.read(&entry.local_path).await {
                Ok(b) => b,
                // A newer sync may have replaced the file under us.
                Err(_) if superseded() => return Ok(None),
                Err(e) => return Err(e),
            };

            let key = entry.doc.key.clone();
            let sanitizer = self.sanitizer.clone();
            let params = self.chunk_params;
            let task = tokio::task::spawn_blocking(move || {
                extract_text(&key, &bytes)
                    .map(|text| chunk_document(role, &key, &sanitizer.apply(&text), &params))
            });
            // Malformed PDFs can panic inside the parser; treat that like any other extraction failure.
            let extracted = match task.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) if e.is_panic() => Err("extractor panicked".to_string()),
                Err(e) => {
                    return Err(RetrievalError::Storage(format!("chunking task failed: {}", e)))
                }
            };

            match extracted {
                Ok(doc_chunks) => chunks.extend(doc_chunks),
                Err(e) => {
                    tracing::warn!(%role, key = %entry.doc.key, error = %e, "extraction failed, skipping document");
                    skipped.push(entry.doc.key.clone());
                }
            }
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embed_all(self.embedder.as_ref(), &texts, self.batch_size).await?;
        if superseded() {
            return Ok(None);
        }

        let dims = self.embedder.dims();
        let index = tokio::task::spawn_blocking(move || HybridIndex::build(role, chunks, embeddings, dims))
            .await
            .map_err(|e| RetrievalError::Storage(format!("index task failed: {}", e)))?
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        Ok(Some(IndexSnapshot {
            format_version: INDEX_FORMAT_VERSION,
            role,
            corpus_fingerprint: manifest.fingerprint.clone(),
            config_signature: self.signature.clone(),
            built_at: chrono::Utc::now().timestamp(),
            skipped,
            index,
        }))
    }
}

fn config_signature(params: &ChunkParams, sanitizer: &Sanitizer, embedder: &dyn Embedder) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "v{}|chunk={}/{}|model={}|dims={}|sanitize={}",
            INDEX_FORMAT_VERSION,
            params.chunk_size,
            params.chunk_overlap,
            embedder.model_name(),
            embedder.dims(),
            sanitizer.signature()
        )
        .as_bytes(),
    );
    hex::encode(&hasher.finalize()[..8])
}
