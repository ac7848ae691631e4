//! LedgerMirror - Peer-to-peer replication for self-hosted ledgers
//!
//! Each instance owns a private ledger of accounts and transactions.
//! LedgerMirror keeps ledgers on registered mirror instances consistent
//! without a central coordinator.
//!
//! # Architecture
//!
//! Every round with a mirror pushes the local delta, then pulls the
//! mirror's delta. Payloads are signed with the instance's Ed25519 key and
//! verified against the key registered for the mirror before anything is
//! parsed. Entities that collide are settled per entity kind by a conflict
//! policy, and every decision lands in an append-only sync log.
//!
//! # Features
//!
//! - Signed push/pull over HTTP with bounded timeouts
//! - Last-write-wins, primary-wins and manual conflict strategies
//! - Per-entity application in its own SQLite transaction
//! - Concurrent sync-all with per-mirror round guards and a scheduler
//! - Management API for mirrors, policies and sync logs

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod replication;
pub mod signing;
pub mod store;

pub use config::LedgerMirrorConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LedgerMirrorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::model::{Account, EntityKind, MirrorInstance, Strategy, Transaction};
    pub use crate::replication::{ReplicationConfig, ReplicationService, SyncOrchestrator};
    pub use crate::signing::InstanceKey;
    pub use crate::store::Store;
}
