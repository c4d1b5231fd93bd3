//! # Brain
//!
//! A local-first knowledge-memory server over a markdown note store.
//! Brain embeds notes through a local model server, keeps the vectors in
//! SQLite, and layers hybrid (semantic + keyword) search, signed session
//! state, a session-protocol workflow, and managed configuration on top.
//!
//! The major pieces:
//!
//! - [`model_client`]: HTTP client for the embedding model server,
//!   with task prefixes and retry/backoff.
//! - [`chunk`]: deterministic text chunking with overlap.
//! - [`index`]: SQLite-backed vector index with exact cosine ANN.
//! - [`pipeline`]: the embedding pipeline: per-note embed, batch
//!   settle-all, and project catch-up.
//! - [`search`]: hybrid search with relation expansion and enrichment.
//! - [`session`]: HMAC-signed session state with optimistic locking
//!   and history compaction.
//! - [`workflow`]: the session-protocol event coordinator.
//! - [`config`], [`reconfigure`], [`manifest`], [`rollback`],
//!   [`watcher`]: configuration management: validation, diffing,
//!   locked migrations with copy manifests, rollback, file watching.
//! - [`bootstrap`]: the session-initialization context document.
//! - [`hooks`]: the contract surface for external hook binaries.
//! - [`server`]: the JSON HTTP API.

pub mod bootstrap;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod hooks;
pub mod index;
pub mod manifest;
pub mod migrate;
pub mod model_client;
pub mod notes;
pub mod paths;
pub mod pipeline;
pub mod protocol;
pub mod reconfigure;
pub mod rollback;
pub mod search;
pub mod server;
pub mod session;
pub mod store;
pub mod translate;
pub mod watcher;
pub mod workflow;
