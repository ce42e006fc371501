//! Lodestone: a persistent, single-node vector database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │          POST /upsert, POST /search, GET /query/{id}        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  VectorDatabase facade                      │
//! │        write path: WAL → indexes → filter → scalar          │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  Flat index  │  HNSW graph  │ Filter index │  Scalar store  │
//! │ (exact scan) │  (ANN)       │ (bitmaps)    │  (redb)        │
//! └──────────────┴──────────────┴──────────────┴────────────────┘
//!                              │
//!                              ▼
//!            WAL + snapshots (crash recovery on startup)
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod flat;
pub mod hnsw;
pub mod registry;
pub mod simd;
pub mod storage;
pub mod wal;

pub use config::{DbConfig, Metric};
pub use db::{SearchRequest, VectorDatabase};
pub use error::{DbError, Result};
pub use registry::IndexKind;
