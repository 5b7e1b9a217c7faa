//! # chorus-collab — Real-time collaborative editing core for Chorus
//!
//! Operational-transformation based multiplayer editing: many clients
//! submit edits against a shared text document and every replica converges
//! to the same content, in the same order, across any number of server
//! processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    WebSocket     ┌──────────────┐
//! │  Client    │ ◄──────────────► │  SyncServer  │
//! │ (per user) │   Binary Proto   │ (per process)│
//! └────────────┘                  └──────┬───────┘
//!                                        │
//!                  ┌─────────────────────┼──────────────────────┐
//!                  ▼                     ▼                      ▼
//!          ┌──────────────┐      ┌──────────────┐       ┌──────────────┐
//!          │ LockManager  │      │ OperationLog │       │ Presence +   │
//!          │ (TTL leases) │      │ (RocksDB,    │       │ Broadcast    │
//!          │              │      │  version     │       │ (fan-out)    │
//!          └──────────────┘      │  authority)  │       └──────────────┘
//!                                └──────────────┘
//! ```
//!
//! A submit holds the document lock across read-version → rebase → append;
//! the transform engine itself is pure and rebases a stale operation
//! against every committed operation it missed. Presence signals (cursors,
//! typing) never touch the lock.
//!
//! ## Modules
//!
//! - [`transform`] — OT engine: component-level rebase rules
//! - [`storage`]   — operation log + version authority (RocksDB)
//! - [`lock`]      — cross-process document locks with TTL leases
//! - [`presence`]  — connection/document/presence indexes
//! - [`broadcast`] — per-document fan-out channels
//! - [`protocol`]  — bincode wire messages and validation
//! - [`server`]    — WebSocket protocol handler
//! - [`sweeper`]   — background log reclamation
//! - [`external`]  — authorization & content-store seams
//! - [`config`]    — centralized timing/capacity knobs

pub mod broadcast;
pub mod config;
pub mod external;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod sweeper;
pub mod transform;

// Re-exports for convenience
pub use broadcast::{ChannelRegistry, ChannelStats, DocumentChannel, Frame};
pub use config::CollabConfig;
pub use external::{
    AccessControl, AllowAll, ContentError, ContentSnapshot, ContentStore, MemoryContentStore,
};
pub use lock::{
    document_resource_key, LeaseStore, LockError, LockHandle, LockManager, MemoryLeaseStore,
};
pub use presence::{ConnectionEntry, PresenceColor, PresenceTracker};
pub use protocol::{
    ClientMessage, CommittedOp, ComponentDto, ComponentKind, CursorPositionDto, ErrorCode,
    ParticipantDto, ProtocolError, ServerMessage, SubmitDto, ValidationError,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentLogMetadata, OperationLog, StoreConfig, StoreError};
pub use sweeper::{SweepReport, Sweeper};
pub use transform::{transform, transform_components, Operation, OperationComponent};
