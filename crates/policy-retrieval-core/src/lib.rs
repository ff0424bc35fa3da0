//! # Policy Retrieval Core
//!
//! Runtime-free building blocks of the policy retrieval subsystem: data
//! models, change detection, the structure-aware chunker, placeholder
//! sanitisation, and the hybrid lexical + vector index.
//!
//! This crate contains no tokio, filesystem, or network code. Everything
//! here is deterministic given its inputs, which is what makes fingerprints
//! and index snapshots reproducible across restarts.

pub mod chunk;
pub mod delta;
pub mod embedding;
pub mod fingerprint;
pub mod lexical;
pub mod models;
pub mod sanitize;
pub mod search;
pub mod vector;
