//! Replication Module
//!
//! Moves ledger changes between this instance and its registered mirrors:
//! extraction, signed payloads, transport, conflict resolution and the
//! per-mirror sync rounds that drive them.

mod apply;
mod extractor;
mod orchestrator;
pub mod payload;
mod resolver;
mod service;
pub mod transport;

use std::time::Duration;

pub use apply::{ApplyStats, ChangeApplier};
pub use extractor::ChangeExtractor;
pub use orchestrator::{RoundReport, RoundState, SyncAllReport, SyncOrchestrator};
pub use payload::{ChangeSet, RawChangeSet, ReceiveResponse, SignedPayload};
pub use resolver::{ConflictResolver, Decision, ResolutionContext};
pub use service::{Identity, ReplicationService};
pub use transport::{HttpTransport, Transport};

use crate::config::LedgerMirrorConfig;
use crate::model::Strategy;

/// Header carrying the base64 signature over the exact body bytes
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// Header carrying the sender's instance id
pub const INSTANCE_HEADER: &str = "X-Instance";

/// Runtime settings shared by the replication components
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// This instance's public identifier
    pub instance_id: String,
    /// This instance's rank under primary-wins, when configured
    pub local_priority: Option<i32>,
    /// Bound on every transport call
    pub request_timeout: Duration,
    /// Cutoff distance for mirrors never synced before
    pub first_sync_lookback: chrono::Duration,
    /// Strategy for entity kinds without a stored policy
    pub default_strategy: Strategy,
    /// Serve pulls only to registered mirrors
    pub require_known_peer: bool,
}

impl ReplicationConfig {
    pub fn from_config(config: &LedgerMirrorConfig) -> Self {
        Self {
            instance_id: config.instance.id.clone(),
            local_priority: config.instance.priority,
            request_timeout: config.request_timeout(),
            first_sync_lookback: config.first_sync_lookback(),
            default_strategy: config.replication.default_strategy.clone(),
            require_known_peer: config.replication.require_known_peer,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_instance(instance_id: &str, local_priority: i32) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            local_priority: Some(local_priority),
            request_timeout: Duration::from_secs(5),
            first_sync_lookback: chrono::Duration::days(7),
            default_strategy: Strategy::LastWriteWins,
            require_known_peer: true,
        }
    }
}
