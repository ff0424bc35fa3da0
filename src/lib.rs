//! # Policy Retrieval
//!
//! Role-partitioned retrieval and caching for HR policy question answering.
//!
//! Documents live in an object store under one key prefix per role
//! (executive, employee, master). This crate keeps a local, versioned
//! mirror of each role's documents in sync using metadata-only listings,
//! builds a hybrid lexical + vector index per role, answers role-scoped
//! queries with fused, thresholded, deduplicated passages, and memoises
//! final answers in a response cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  list/fetch  ┌────────────────────────────┐
//! │ DocumentStore│─────────────▶│ ScopeHandle (one per role) │
//! │ S3 / FS / Mem│              │ ledger · mirror · index    │
//! └──────────────┘              └─────────────┬──────────────┘
//!                                             │
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                   ┌───────────┐      ┌─────────────┐
//!                   │QueryEngine│      │ResponseCache│
//!                   └─────┬─────┘      └──────┬──────┘
//!                         └────────┬──────────┘
//!                                  ▼
//!                            ┌───────────┐
//!                            │ Retriever │──▶ CLI (hrq) / HTTP
//!                            └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`store`] | Document store clients (S3, filesystem, in-memory) |
//! | [`ledger`] | Per-role version ledger (SQLite) |
//! | [`mirror`] | Per-role mirrored document bytes |
//! | [`extract`] | Text extraction (PDF, DOCX, HTML, text) |
//! | [`embedding`] | Embedding backends |
//! | [`index`] | Index building and snapshots |
//! | [`scope`] | Per-role sync, rebuild, and atomic index swap |
//! | [`query`] | Query validation and hybrid search |
//! | [`cache`] | LRU response cache |
//! | [`answer`] | Answer generation boundary |
//! | [`service`] | The [`Retriever`](service::Retriever) facade |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ledger;
pub mod mirror;
pub mod query;
pub mod scope;
pub mod server;
pub mod service;
pub mod store;

pub use error::{Result, RetrievalError};
pub use policy_retrieval_core::models::{Citation, RoleScope, ScoredChunk};
