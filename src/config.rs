//! TOML configuration: loading, defaults, and validation.
//!
//! Every tunable the retrieval pipeline consumes (query length limits,
//! fusion weights, confidence threshold, chunk size/overlap, cache
//! capacity) comes from here rather than from constants in code.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use policy_retrieval_core::chunk::ChunkParams;
use policy_retrieval_core::models::RoleScope;
use policy_retrieval_core::sanitize::Sanitizer;
use policy_retrieval_core::search::{FusionParams, QueryExpansion};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Replaces the built-in synonym table when present.
    #[serde(default)]
    pub query_expansion: Option<BTreeMap<String, Vec<String>>>,
    /// Extra placeholder rules layered over the built-in ones.
    #[serde(default)]
    pub sanitize: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    S3,
    Filesystem,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub prefixes: PrefixConfig,
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_store_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_timeout_secs() -> u64 {
    30
}

/// Object key prefix for each role scope.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PrefixConfig {
    #[serde(default = "default_employee_prefix")]
    pub employee: String,
    #[serde(default = "default_executive_prefix")]
    pub executive: String,
    #[serde(default = "default_master_prefix")]
    pub master: String,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            employee: default_employee_prefix(),
            executive: default_executive_prefix(),
            master: default_master_prefix(),
        }
    }
}

fn default_employee_prefix() -> String {
    "employee/".to_string()
}
fn default_executive_prefix() -> String {
    "executive/".to_string()
}
fn default_master_prefix() -> String {
    "master/".to_string()
}

impl PrefixConfig {
    pub fn for_role(&self, role: RoleScope) -> &str {
        match role {
            RoleScope::Employee => &self.employee,
            RoleScope::Executive => &self.executive,
            RoleScope::Master => &self.master,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_min_query_len")]
    pub min_query_len: usize,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_exact_match_floor")]
    pub exact_match_floor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            min_query_len: default_min_query_len(),
            max_query_len: default_max_query_len(),
            lexical_weight: default_lexical_weight(),
            vector_weight: default_vector_weight(),
            confidence_threshold: default_confidence_threshold(),
            candidate_k: default_candidate_k(),
            default_top_k: default_top_k(),
            exact_match_floor: default_exact_match_floor(),
        }
    }
}

fn default_min_query_len() -> usize {
    3
}
fn default_max_query_len() -> usize {
    2500
}
fn default_lexical_weight() -> f64 {
    0.4
}
fn default_vector_weight() -> f64 {
    0.6
}
fn default_confidence_threshold() -> f64 {
    0.3
}
fn default_candidate_k() -> usize {
    40
}
fn default_top_k() -> usize {
    5
}
fn default_exact_match_floor() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            persist: true,
        }
    }
}

fn default_cache_capacity() -> usize {
    512
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub max_index_age_hours: Option<u64>,
    #[serde(default = "default_true")]
    pub sync_on_query: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: None,
            max_index_age_hours: None,
            sync_on_query: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// A filesystem-store configuration with every other section defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>, store_root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
            },
            store: StoreConfig {
                kind: StoreKind::Filesystem,
                bucket: None,
                region: default_region(),
                endpoint_url: None,
                root: Some(store_root.into()),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                prefixes: PrefixConfig::default(),
                max_retries: default_store_retries(),
                retry_base_ms: default_retry_base_ms(),
                timeout_secs: default_timeout_secs(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            server: ServerConfig::default(),
            query_expansion: None,
            sanitize: BTreeMap::new(),
        }
    }

    pub fn role_dir(&self, role: RoleScope) -> PathBuf {
        self.storage.data_dir.join(role.as_str())
    }

    pub fn response_cache_path(&self) -> PathBuf {
        self.storage.data_dir.join("response_cache.json")
    }

    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            chunk_size: self.chunking.chunk_size,
            chunk_overlap: self.chunking.chunk_overlap,
        }
    }

    pub fn fusion_params(&self) -> FusionParams {
        FusionParams {
            lexical_weight: self.retrieval.lexical_weight,
            vector_weight: self.retrieval.vector_weight,
            confidence_threshold: self.retrieval.confidence_threshold,
            exact_match_floor: self.retrieval.exact_match_floor,
            candidate_k: self.retrieval.candidate_k,
        }
    }

    pub fn query_expansion(&self) -> QueryExpansion {
        match &self.query_expansion {
            Some(table) => QueryExpansion::new(table.clone()),
            None => QueryExpansion::default(),
        }
    }

    pub fn sanitizer(&self) -> Sanitizer {
        Sanitizer::with_overrides(&self.sanitize)
    }

    pub fn validate(&self) -> Result<()> {
        // Chunking
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!("chunking.chunk_overlap must be < chunking.chunk_size");
        }

        // Retrieval
        let r = &self.retrieval;
        if r.min_query_len == 0 {
            bail!("retrieval.min_query_len must be >= 1");
        }
        if r.min_query_len > r.max_query_len {
            bail!("retrieval.min_query_len must be <= retrieval.max_query_len");
        }
        if r.lexical_weight < 0.0 || r.vector_weight < 0.0 {
            bail!("retrieval weights must be >= 0");
        }
        if r.lexical_weight + r.vector_weight <= 0.0 {
            bail!("retrieval.lexical_weight and retrieval.vector_weight cannot both be 0");
        }
        if !(0.0..=1.0).contains(&r.confidence_threshold) {
            bail!("retrieval.confidence_threshold must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&r.exact_match_floor) {
            bail!("retrieval.exact_match_floor must be in [0.0, 1.0]");
        }
        if r.candidate_k == 0 || r.default_top_k == 0 {
            bail!("retrieval.candidate_k and retrieval.default_top_k must be >= 1");
        }

        // Embedding
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hashed" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hashed, openai, or ollama.",
                other
            ),
        }

        // Cache
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be > 0");
        }

        // Store
        match self.store.kind {
            StoreKind::S3 => {
                if self.store.bucket.as_deref().map_or(true, str::is_empty) {
                    bail!("store.bucket is required when store.kind = \"s3\"");
                }
            }
            StoreKind::Filesystem => {
                if self.store.root.is_none() {
                    bail!("store.root is required when store.kind = \"filesystem\"");
                }
            }
        }
        let p = &self.store.prefixes;
        if p.employee == p.executive || p.employee == p.master || p.executive == p.master {
            bail!("store.prefixes must be distinct for each role");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
