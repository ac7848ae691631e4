//! Change Applier
//!
//! Applies a received change set entity by entity. Each entity is read,
//! decided, written and logged inside its own store transaction, so one
//! bad record never undoes or blocks the others.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{
    Account, ConflictSnapshot, EntityKind, LogDirection, MirrorInstance, NewLogEntry, Operation,
    Resolution, Strategy, Transaction,
};
use crate::replication::payload::RawChangeSet;
use crate::replication::resolver::{ConflictResolver, Decision, ResolutionContext};
use crate::replication::ReplicationConfig;
use crate::store::{append_log, pending_conflict_exists, LedgerRecord, Store};

/// Counts for one applied change set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub created: u64,
    pub updated: u64,
    pub took_remote: u64,
    pub kept_local: u64,
    /// Newly deferred to an operator
    pub conflicts: u64,
    pub failed: u64,
}

impl ApplyStats {
    /// Entities whose remote version is now stored locally
    pub fn synced(&self) -> u64 {
        self.created + self.updated + self.took_remote
    }

    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Created => self.created += 1,
            Applied::Updated => self.updated += 1,
            Applied::TookRemote => self.took_remote += 1,
            Applied::KeptLocal => self.kept_local += 1,
            Applied::Deferred => self.conflicts += 1,
            Applied::AlreadyPending => {}
        }
    }
}

enum Applied {
    Created,
    Updated,
    TookRemote,
    KeptLocal,
    Deferred,
    AlreadyPending,
}

pub struct ChangeApplier {
    store: Arc<Store>,
    config: ReplicationConfig,
    resolver: ConflictResolver,
}

impl ChangeApplier {
    pub fn new(store: Arc<Store>, config: ReplicationConfig) -> Self {
        Self {
            store,
            config,
            resolver: ConflictResolver,
        }
    }

    /// Apply everything `mirror` sent. Accounts go first so transactions
    /// never reference an account that has not arrived yet.
    pub async fn apply(&self, mirror: &MirrorInstance, changes: RawChangeSet) -> Result<ApplyStats> {
        let default = &self.config.default_strategy;
        let account_strategy = self.store.conflict_policy(EntityKind::Account, default).await?.strategy;
        let transaction_strategy = self
            .store
            .conflict_policy(EntityKind::Transaction, default)
            .await?
            .strategy;

        let mut stats = ApplyStats::default();
        for value in changes.accounts {
            self.apply_value::<Account>(mirror, &account_strategy, value, &mut stats)
                .await;
        }
        for value in changes.transactions {
            self.apply_value::<Transaction>(mirror, &transaction_strategy, value, &mut stats)
                .await;
        }

        debug!(
            "Applied changes from {}: {} synced, {} kept local, {} conflicts, {} failed",
            mirror.instance_id,
            stats.synced(),
            stats.kept_local,
            stats.conflicts,
            stats.failed
        );
        Ok(stats)
    }

    async fn apply_value<R: LedgerRecord>(
        &self,
        mirror: &MirrorInstance,
        strategy: &Strategy,
        value: serde_json::Value,
        stats: &mut ApplyStats,
    ) {
        let entity_id = value.get("id").and_then(|id| id.as_i64()).unwrap_or(0);
        let result = match serde_json::from_value::<R>(value) {
            Ok(record) => self.apply_record(mirror, strategy, &record).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(applied) => stats.record(applied),
            Err(e) => {
                warn!(
                    "Failed to apply {} {} from {}: {}",
                    R::KIND,
                    entity_id,
                    mirror.instance_id,
                    e
                );
                stats.failed += 1;
                let entry = NewLogEntry::failed(
                    mirror.id,
                    LogDirection::Pull,
                    R::KIND,
                    entity_id,
                    Operation::Update,
                    e.to_string(),
                );
                if let Err(log_err) = self.store.append_log(entry).await {
                    warn!("Could not record failure in sync log: {}", log_err);
                }
            }
        }
    }

    async fn apply_record<R: LedgerRecord>(
        &self,
        mirror: &MirrorInstance,
        strategy: &Strategy,
        remote: &R,
    ) -> Result<Applied> {
        let ctx = ResolutionContext {
            local_instance: &self.config.instance_id,
            local_priority: self.config.local_priority,
            mirror,
        };

        self.store
            .transaction(|tx| {
                let local = R::load(tx, remote.id())?;
                let decision = self.resolver.decide(
                    strategy,
                    local.as_ref().map(|l| l.updated_at()),
                    remote.updated_at(),
                    &ctx,
                );
                let entry = |operation| {
                    NewLogEntry::success(mirror.id, LogDirection::Pull, R::KIND, remote.id(), operation)
                };

                match (decision, local) {
                    (Decision::Insert, _) | (_, None) => {
                        remote.insert(tx)?;
                        append_log(tx, &entry(Operation::Create))?;
                        Ok(Applied::Created)
                    }
                    (Decision::Overwrite, Some(_)) => {
                        remote.overwrite(tx)?;
                        append_log(tx, &entry(Operation::Update))?;
                        Ok(Applied::Updated)
                    }
                    (Decision::Conflict(resolution), Some(local)) => {
                        let snapshot = ConflictSnapshot {
                            local: serde_json::to_value(&local)?,
                            remote: serde_json::to_value(remote)?,
                        };
                        let applied = match resolution {
                            Resolution::TookRemote => {
                                remote.overwrite(tx)?;
                                Applied::TookRemote
                            }
                            Resolution::KeptLocal => Applied::KeptLocal,
                            Resolution::Deferred => {
                                if pending_conflict_exists(
                                    tx,
                                    mirror.id,
                                    R::KIND,
                                    remote.id(),
                                    &snapshot.remote,
                                )? {
                                    return Ok(Applied::AlreadyPending);
                                }
                                Applied::Deferred
                            }
                        };
                        append_log(
                            tx,
                            &entry(Operation::Update).with_conflict(resolution, snapshot),
                        )?;
                        Ok(applied)
                    }
                }
            })
            .await
    }
}
