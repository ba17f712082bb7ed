//! Encrypted, multi-tenant memory store.
//!
//! strongroom persists user-submitted text chunks and their embeddings and
//! serves similarity queries over them, with tenant isolation enforced at two
//! independent layers:
//!
//! | Layer | Mechanism | Fails as |
//! |-------|-----------|----------|
//! | **Row visibility** | SQLite views and triggers keyed on a per-connection tenant context | [`Error::IsolationViolation`] |
//! | **Encryption** | AES-256-GCM with the tenant token, chunk id and column bound as AAD | [`Error::DecryptionFailure`] |
//!
//! Tenant identifiers never reach the database: rows carry an HMAC-derived
//! tenant token instead.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL, r2d2 pool), hash-partitioned chunk tables,
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for exact cosine scans
//! - **ANN**: one HNSW graph per partition, post-filtered through the tenant's
//!   visible rows
//! - **Rerank**: optional ONNX cross-encoder behind a timeout and circuit breaker,
//!   falling back to ANN order
//!
//! # Modules
//!
//! - [`vault`]: the public operations: index, query, summarize, entities, delete
//! - [`crypto`]: tenant tokens and sealed envelopes
//! - [`access`]: per-request tenant sessions on pooled connections
//! - [`db`]: schema, migrations, row policies, health checks
//! - [`storage`]: partitioned chunk records and the isolation backends
//! - [`index`], [`search`]: HNSW graphs, tenant-scoped search and the query cache
//! - [`rerank`]: fail-open reranking
//! - [`audit`]: the append-only access log
//! - [`models`]: local ONNX embedding and cross-encoder models

pub mod access;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod db;
pub mod entities;
pub mod error;
pub mod index;
pub mod models;
pub mod rerank;
pub mod search;
pub mod storage;
pub mod vault;

pub use error::{DecryptFault, Error, ErrorCode, Rejection, Result};
pub use vault::MemoryVault;
