//! Durable, version-ordered operation storage.
//!
//! ```text
//! ┌──────────────┐   append (locked)   ┌───────────────────────────────┐
//! │ SyncServer   │ ──────────────────► │ OperationLog (RocksDB)        │
//! └──────┬───────┘                     │                               │
//!        │ catch-up / rebase           │ CF "operations" — committed   │
//!        ▼                             │   ops, keyed doc_id:version   │
//! ┌──────────────┐                     │ CF "versions"   — authority   │
//! │ operations_  │                     │   counter per document        │
//! │ since(v)     │                     │ CF "metadata"   — per-doc     │
//! └──────────────┘                     │   bookkeeping                 │
//!                                      └───────────────────────────────┘
//! ```
//!
//! The version counter and the operation row advance in one atomic write
//! batch: a torn append cannot leave the counter ahead of the log or the
//! log ahead of the counter.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod oplog;

pub use oplog::{DocumentLogMetadata, OperationLog, StoreConfig, StoreError};
