//! Sync Orchestrator
//!
//! Drives sync rounds. A round with one mirror moves
//! `Idle -> Pushing -> Pulling -> Done`, dropping to `Failed` at the first
//! error. Only a completed round advances the mirror's `last_sync`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::apply::ApplyStats;
use super::payload::ReceiveResponse;
use super::service::ReplicationService;
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::model::{EntityKind, LogDirection, MirrorInstance, NewLogEntry, Operation};
use crate::store::{append_log, LedgerRecord};

/// Where a mirror's current or last round stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Idle,
    Pushing,
    Pulling,
    Done,
    Failed,
}

/// Result of one round with one mirror
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub mirror_id: i64,
    pub instance_id: String,
    pub state: RoundState,
    pub started_at: DateTime<Utc>,
    /// Entities sent in the push phase
    pub pushed: u64,
    /// What the mirror reported for our push
    pub push_response: Option<ReceiveResponse>,
    /// What we applied from the pull phase
    pub pulled: Option<ApplyStats>,
    pub error: Option<String>,
}

impl RoundReport {
    fn new(mirror: &MirrorInstance, started_at: DateTime<Utc>) -> Self {
        Self {
            mirror_id: mirror.id,
            instance_id: mirror.instance_id.clone(),
            state: RoundState::Idle,
            started_at,
            pushed: 0,
            push_response: None,
            pulled: None,
            error: None,
        }
    }
}

/// Result of a fan-out over every enabled mirror
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncAllReport {
    pub synced_count: usize,
    pub failed_count: usize,
    /// Mirrors whose previous round was still running
    pub skipped: Vec<String>,
    pub results: Vec<RoundReport>,
}

pub struct SyncOrchestrator {
    service: Arc<ReplicationService>,
    transport: Arc<dyn Transport>,
    states: RwLock<HashMap<i64, RoundState>>,
    /// One guard per mirror; a held guard means a round is running
    guards: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SyncOrchestrator {
    pub fn new(service: Arc<ReplicationService>, transport: Arc<dyn Transport>) -> Self {
        Self {
            service,
            transport,
            states: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a mirror's round (`Idle` if none ran yet)
    pub async fn state(&self, mirror_id: i64) -> RoundState {
        self.states
            .read()
            .await
            .get(&mirror_id)
            .copied()
            .unwrap_or(RoundState::Idle)
    }

    pub async fn states(&self) -> HashMap<i64, RoundState> {
        self.states.read().await.clone()
    }

    /// Drop bookkeeping for a deleted mirror
    pub async fn forget(&self, mirror_id: i64) {
        self.states.write().await.remove(&mirror_id);
        self.guards.lock().await.remove(&mirror_id);
    }

    async fn guard(&self, mirror_id: i64) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .await
            .entry(mirror_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_state(&self, mirror_id: i64, state: RoundState) {
        self.states.write().await.insert(mirror_id, state);
    }

    /// Run one round with one mirror, refusing if a round is already running
    pub async fn sync_mirror(&self, mirror_id: i64) -> Result<RoundReport> {
        let mirror = self.service.store().get_mirror(mirror_id).await?;
        self.claim_and_run(mirror_id, false)
            .await?
            .ok_or(Error::RoundInProgress(mirror.instance_id))
    }

    /// Take the mirror's guard, then run a round against its current row.
    /// `None` when a round is already running, or when `only_enabled` is set
    /// and the mirror has been disabled meanwhile.
    async fn claim_and_run(&self, mirror_id: i64, only_enabled: bool) -> Result<Option<RoundReport>> {
        let Ok(_running) = self.guard(mirror_id).await.try_lock_owned() else {
            return Ok(None);
        };
        // a round that just released the guard may have moved last_sync
        let mirror = self.service.store().get_mirror(mirror_id).await?;
        if only_enabled && !mirror.sync_enabled {
            return Ok(None);
        }
        Ok(Some(self.run_round(mirror).await))
    }

    /// Run rounds with every enabled mirror concurrently
    pub async fn sync_all(&self) -> Result<SyncAllReport> {
        let mirrors = self.service.store().list_enabled_mirrors().await?;
        if mirrors.is_empty() {
            debug!("No enabled mirrors to sync");
            return Ok(SyncAllReport::default());
        }

        let rounds = mirrors.into_iter().map(|mirror| async move {
            (mirror.instance_id, self.claim_and_run(mirror.id, true).await)
        });

        let mut report = SyncAllReport::default();
        for (instance_id, outcome) in join_all(rounds).await {
            match outcome {
                Ok(Some(round)) => {
                    match round.state {
                        RoundState::Done => report.synced_count += 1,
                        _ => report.failed_count += 1,
                    }
                    report.results.push(round);
                }
                Ok(None) => {
                    info!("Skipping {}: round already running or mirror disabled", instance_id);
                    report.skipped.push(instance_id);
                }
                Err(e) => {
                    info!("Skipping {}: {}", instance_id, e);
                    report.skipped.push(instance_id);
                }
            }
        }

        info!(
            "Sync-all finished: {} synced, {} failed, {} skipped",
            report.synced_count,
            report.failed_count,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Trigger `sync_all` every `period` until the handle is aborted
    pub fn spawn_scheduler(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sync scheduler running every {:?}", period);
            let mut ticker = interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sync_all().await {
                    error!("Scheduled sync-all failed: {}", e);
                }
            }
        })
    }

    async fn run_round(&self, mirror: MirrorInstance) -> RoundReport {
        let started_at = Utc::now();
        let mut report = RoundReport::new(&mirror, started_at);
        info!(
            "Starting sync round with {} (mirror {}, {})",
            mirror.instance_id, mirror.id, mirror.sync_direction
        );

        match self.run_phases(&mirror, started_at, &mut report).await {
            Ok(()) => {
                report.state = RoundState::Done;
                info!(
                    "Sync round with {} done: pushed {}, pulled {}",
                    mirror.instance_id,
                    report.pushed,
                    report.pulled.map(|s| s.synced()).unwrap_or(0)
                );
            }
            Err(e) => {
                report.state = RoundState::Failed;
                report.error = Some(e.to_string());
                if e.is_retryable() {
                    warn!("Sync round with {} failed, will retry: {}", mirror.instance_id, e);
                } else {
                    error!("Sync round with {} failed: {}", mirror.instance_id, e);
                }
                let entry = NewLogEntry::round_failed(mirror.id, e.to_string());
                if let Err(log_err) = self.service.store().append_log(entry).await {
                    error!("Could not record failed round in sync log: {}", log_err);
                }
            }
        }
        self.set_state(mirror.id, report.state).await;
        report
    }

    async fn run_phases(
        &self,
        mirror: &MirrorInstance,
        started_at: DateTime<Utc>,
        report: &mut RoundReport,
    ) -> Result<()> {
        let service = &self.service;
        let local_instance = &service.config().instance_id;
        let cutoff = service.extractor().cutoff(mirror.last_sync, started_at);

        if mirror.sync_direction.includes_push() {
            self.set_state(mirror.id, RoundState::Pushing).await;
            let changes = service.extractor().extract(cutoff, local_instance).await?;
            if changes.is_empty() {
                debug!("Nothing to push to {}", mirror.instance_id);
            } else {
                let payload = changes.seal(service.key())?;
                let response = self.transport.push(mirror, &payload).await?;
                if response.failed > 0 {
                    warn!(
                        "{} could not apply {} of {} pushed entities",
                        mirror.instance_id,
                        response.failed,
                        changes.len()
                    );
                }
                service
                    .store()
                    .transaction(|tx| {
                        for account in &changes.accounts {
                            append_log(tx, &pushed(mirror, account))?;
                        }
                        for transaction in &changes.transactions {
                            append_log(tx, &pushed(mirror, transaction))?;
                        }
                        if response.failed > 0 {
                            append_log(tx, &rejected_by_mirror(mirror, &response, changes.len()))?;
                        }
                        Ok(())
                    })
                    .await?;
                report.pushed = changes.len() as u64;
                report.push_response = Some(response);
            }
        }

        if mirror.sync_direction.includes_pull() {
            self.set_state(mirror.id, RoundState::Pulling).await;
            let payload = self.transport.pull(mirror, cutoff, local_instance).await?;
            let changes = payload.open(&mirror.public_key)?;
            report.pulled = Some(service.applier().apply(mirror, changes).await?);
        }

        service.store().set_last_sync(mirror.id, started_at).await
    }
}

fn pushed<R: LedgerRecord>(mirror: &MirrorInstance, record: &R) -> NewLogEntry {
    NewLogEntry::success(mirror.id, LogDirection::Push, R::KIND, record.id(), Operation::Create)
}

/// Mirror-level entry carrying the counts the mirror reported for a push
fn rejected_by_mirror(mirror: &MirrorInstance, response: &ReceiveResponse, sent: usize) -> NewLogEntry {
    NewLogEntry::failed(
        mirror.id,
        LogDirection::Push,
        EntityKind::General,
        0,
        Operation::Sync,
        format!(
            "{} rejected {} of {} pushed entities ({} synced, {} conflicts)",
            mirror.instance_id, response.failed, sent, response.entities_synced, response.conflicts
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, MirrorUpdate, NewMirror, Outcome, Strategy, SyncDirection, Transaction};
    use crate::replication::payload::SignedPayload;
    use crate::replication::ReplicationConfig;
    use crate::signing::InstanceKey;
    use crate::store::fixtures::{account, transaction};
    use crate::store::{format_ts, new_mirror, Store};
    use async_trait::async_trait;

    /// Delivers calls straight to in-process peer services
    struct LoopbackTransport {
        peers: HashMap<String, Arc<ReplicationService>>,
    }

    impl LoopbackTransport {
        fn peer(&self, mirror: &MirrorInstance) -> Result<&Arc<ReplicationService>> {
            self.peers
                .get(&mirror.instance_id)
                .ok_or_else(|| Error::Network(format!("no route to {}", mirror.instance_url)))
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn push(&self, mirror: &MirrorInstance, payload: &SignedPayload) -> Result<ReceiveResponse> {
            let stats = self.peer(mirror)?.receive(payload.clone()).await?;
            Ok(ReceiveResponse {
                status: "success".into(),
                entities_synced: stats.synced(),
                conflicts: stats.conflicts,
                failed: stats.failed,
            })
        }

        async fn pull(
            &self,
            mirror: &MirrorInstance,
            since: DateTime<Utc>,
            requester: &str,
        ) -> Result<SignedPayload> {
            self.peer(mirror)?.changes_since(since, Some(requester)).await
        }
    }

    /// Every call fails as if the mirror were down
    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn push(&self, mirror: &MirrorInstance, _: &SignedPayload) -> Result<ReceiveResponse> {
            Err(Error::ConnectionTimeout(mirror.instance_url.clone()))
        }

        async fn pull(&self, mirror: &MirrorInstance, _: DateTime<Utc>, _: &str) -> Result<SignedPayload> {
            Err(Error::Network(format!("connection refused: {}", mirror.instance_url)))
        }
    }

    /// Accepts pushes but reports a fixed number of them as failed
    struct PartialTransport {
        failed: u64,
    }

    #[async_trait]
    impl Transport for PartialTransport {
        async fn push(&self, _: &MirrorInstance, payload: &SignedPayload) -> Result<ReceiveResponse> {
            let sent: crate::replication::RawChangeSet = serde_json::from_slice(&payload.body)?;
            Ok(ReceiveResponse {
                status: "success".into(),
                entities_synced: sent.len() as u64 - self.failed,
                conflicts: 0,
                failed: self.failed,
            })
        }

        async fn pull(&self, mirror: &MirrorInstance, _: DateTime<Utc>, _: &str) -> Result<SignedPayload> {
            Err(Error::Network(format!("pull not served by {}", mirror.instance_url)))
        }
    }

    fn recent(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes_ago)
    }

    fn instance(id: &str, priority: i32) -> (Arc<ReplicationService>, Arc<InstanceKey>) {
        let key = Arc::new(InstanceKey::generate());
        let service = ReplicationService::new(
            ReplicationConfig::for_instance(id, priority),
            Arc::new(Store::open_in_memory().unwrap()),
            key.clone(),
        );
        (Arc::new(service), key)
    }

    /// Instance `a.example` with `b.example` registered as a mirror and
    /// vice versa; returns a's orchestrator, b's service and a's mirror row
    async fn linked_pair(
        local_priority: i32,
        mirror_priority: i32,
        direction: SyncDirection,
    ) -> (SyncOrchestrator, Arc<ReplicationService>, MirrorInstance) {
        let (a, a_key) = instance("a.example", local_priority);
        let (b, b_key) = instance("b.example", mirror_priority);

        let mirror = a
            .store()
            .create_mirror(NewMirror {
                sync_direction: direction,
                priority: mirror_priority,
                ..new_mirror("b.example", &b_key.public_key_base64())
            })
            .await
            .unwrap();
        b.store()
            .create_mirror(NewMirror {
                priority: local_priority,
                ..new_mirror("a.example", &a_key.public_key_base64())
            })
            .await
            .unwrap();

        let transport = LoopbackTransport {
            peers: HashMap::from([("b.example".to_string(), b.clone())]),
        };
        (SyncOrchestrator::new(a, Arc::new(transport)), b, mirror)
    }

    #[tokio::test]
    async fn test_push_reaches_mirror() {
        let (orchestrator, b, mirror) = linked_pair(1, 2, SyncDirection::Bidirectional).await;
        let a_store = orchestrator.service.store().clone();
        for id in 1..=5 {
            a_store.put_record(&transaction(id, "10.00", recent(30))).await.unwrap();
        }
        for id in 1..=2 {
            a_store.put_record(&account(id, "500.00", recent(30))).await.unwrap();
        }

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();

        assert_eq!(report.state, RoundState::Done);
        assert_eq!(report.pushed, 7);
        let response = report.push_response.unwrap();
        assert_eq!((response.entities_synced, response.conflicts), (7, 0));

        let logs = a_store.logs_for_mirror(mirror.id, 100).await.unwrap();
        let pushes: Vec<_> = logs.iter().filter(|l| l.direction == LogDirection::Push).collect();
        assert_eq!(pushes.len(), 7);
        assert!(pushes.iter().all(|l| l.status == Outcome::Success));

        assert_eq!(b.store().changed_since::<Transaction>(recent(60)).await.unwrap().len(), 5);
        assert_eq!(orchestrator.state(mirror.id).await, RoundState::Done);
    }

    #[tokio::test]
    async fn test_last_sync_is_round_start() {
        let (orchestrator, _b, mirror) = linked_pair(1, 2, SyncDirection::Bidirectional).await;
        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();

        let reloaded = orchestrator.service.store().get_mirror(mirror.id).await.unwrap();
        assert_eq!(
            reloaded.last_sync.map(|t| format_ts(&t)),
            Some(format_ts(&report.started_at))
        );
    }

    #[tokio::test]
    async fn test_pull_primary_wins_keeps_local_primary() {
        let (orchestrator, b, mirror) = linked_pair(1, 2, SyncDirection::Pull).await;
        let a_store = orchestrator.service.store().clone();
        a_store
            .set_conflict_policy(EntityKind::Account, Strategy::PrimaryWins { primary_instance_id: None })
            .await
            .unwrap();
        a_store.put_record(&account(1, "100.00", recent(1))).await.unwrap();
        b.store().put_record(&account(1, "1.00", recent(5))).await.unwrap();

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();
        assert_eq!(report.pulled.unwrap().kept_local, 1);
        let local: Account = a_store.get_record(1).await.unwrap().unwrap();
        assert_eq!(local.balance, "100.00");
    }

    #[tokio::test]
    async fn test_pull_primary_wins_yields_to_primary_mirror() {
        let (orchestrator, b, mirror) = linked_pair(2, 1, SyncDirection::Pull).await;
        let a_store = orchestrator.service.store().clone();
        a_store
            .set_conflict_policy(EntityKind::Account, Strategy::PrimaryWins { primary_instance_id: None })
            .await
            .unwrap();
        a_store.put_record(&account(1, "100.00", recent(1))).await.unwrap();
        b.store().put_record(&account(1, "1.00", recent(5))).await.unwrap();

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();
        assert_eq!(report.pulled.unwrap().took_remote, 1);
        let local: Account = a_store.get_record(1).await.unwrap().unwrap();
        assert_eq!(local.balance, "1.00");
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_last_sync() {
        let (a, _) = instance("a.example", 1);
        let key = InstanceKey::generate().public_key_base64();
        let mirror = a.store().create_mirror(new_mirror("b.example", &key)).await.unwrap();
        a.store().put_record(&transaction(1, "1.00", recent(10))).await.unwrap();
        let orchestrator = SyncOrchestrator::new(a.clone(), Arc::new(FailingTransport));

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();

        assert_eq!(report.state, RoundState::Failed);
        assert!(report.error.is_some());
        assert!(a.store().get_mirror(mirror.id).await.unwrap().last_sync.is_none());
        let summary = a.store().log_summary(mirror.id).await.unwrap();
        assert_eq!((summary.success, summary.failed), (0, 1));
        let logs = a.store().logs_for_mirror(mirror.id, 10).await.unwrap();
        assert_eq!(logs[0].entity_type, EntityKind::General);
        assert_eq!(logs[0].operation, Operation::Sync);
    }

    #[tokio::test]
    async fn test_unverifiable_pull_applies_nothing() {
        let (orchestrator, b, mirror) = linked_pair(1, 2, SyncDirection::Pull).await;
        let a_store = orchestrator.service.store().clone();
        a_store
            .update_mirror(
                mirror.id,
                MirrorUpdate {
                    public_key: Some(InstanceKey::generate().public_key_base64()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        b.store().put_record(&transaction(9, "9.00", recent(5))).await.unwrap();

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();

        assert_eq!(report.state, RoundState::Failed);
        assert!(a_store.get_record::<Transaction>(9).await.unwrap().is_none());
        assert!(a_store.get_mirror(mirror.id).await.unwrap().last_sync.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_round_rejected() {
        let (orchestrator, _b, mirror) = linked_pair(1, 2, SyncDirection::Bidirectional).await;
        let guard = orchestrator.guard(mirror.id).await;
        let _held = guard.lock().await;

        assert!(matches!(
            orchestrator.sync_mirror(mirror.id).await,
            Err(Error::RoundInProgress(_))
        ));
        let all = orchestrator.sync_all().await.unwrap();
        assert_eq!(all.skipped, vec!["b.example".to_string()]);
        assert!(all.results.is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let (a, _) = instance("a.example", 1);
        let (b, b_key) = instance("b.example", 2);
        let a_key_pub = a.identity().public_key;
        b.store().create_mirror(new_mirror("a.example", &a_key_pub)).await.unwrap();

        a.store()
            .create_mirror(new_mirror("b.example", &b_key.public_key_base64()))
            .await
            .unwrap();
        let dead = a
            .store()
            .create_mirror(new_mirror("down.example", &InstanceKey::generate().public_key_base64()))
            .await
            .unwrap();
        let transport = LoopbackTransport {
            peers: HashMap::from([("b.example".to_string(), b)]),
        };
        let orchestrator = SyncOrchestrator::new(a, Arc::new(transport));

        let report = orchestrator.sync_all().await.unwrap();
        assert_eq!((report.synced_count, report.failed_count), (1, 1));
        assert_eq!(orchestrator.state(dead.id).await, RoundState::Failed);
    }

    #[tokio::test]
    async fn test_push_failures_reported_by_mirror_are_logged() {
        let (a, _) = instance("a.example", 1);
        let key = InstanceKey::generate().public_key_base64();
        let mirror = a
            .store()
            .create_mirror(NewMirror {
                sync_direction: SyncDirection::Push,
                ..new_mirror("b.example", &key)
            })
            .await
            .unwrap();
        for id in 1..=3 {
            a.store().put_record(&transaction(id, "1.00", recent(10))).await.unwrap();
        }
        let orchestrator = SyncOrchestrator::new(a.clone(), Arc::new(PartialTransport { failed: 2 }));

        let report = orchestrator.sync_mirror(mirror.id).await.unwrap();

        assert_eq!(report.state, RoundState::Done);
        assert_eq!(report.push_response.unwrap().failed, 2);
        let logs = a.store().logs_for_mirror(mirror.id, 10).await.unwrap();
        let rejected: Vec<_> = logs.iter().filter(|l| l.status == Outcome::Failed).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].entity_type, EntityKind::General);
        assert_eq!(rejected[0].direction, LogDirection::Push);
        assert!(rejected[0].error_message.as_deref().unwrap().contains("rejected 2 of 3"));
    }

    #[tokio::test]
    async fn test_round_reads_mirror_row_after_guard() {
        let (orchestrator, b, stale) = linked_pair(1, 2, SyncDirection::Push).await;
        let a_store = orchestrator.service.store().clone();
        a_store.put_record(&transaction(1, "1.00", recent(30))).await.unwrap();
        // another round finished after `stale` was read
        a_store.set_last_sync(stale.id, recent(5)).await.unwrap();
        assert!(stale.last_sync.is_none());

        let report = orchestrator.claim_and_run(stale.id, true).await.unwrap().unwrap();
        assert_eq!(report.state, RoundState::Done);
        assert_eq!(report.pushed, 0);
        assert!(b.store().get_record::<Transaction>(1).await.unwrap().is_none());

        a_store
            .update_mirror(stale.id, MirrorUpdate { sync_enabled: Some(false), ..Default::default() })
            .await
            .unwrap();
        assert!(orchestrator.claim_and_run(stale.id, true).await.unwrap().is_none());
    }
}
