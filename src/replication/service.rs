//! Replication Service
//!
//! The server side of an instance: accepts changes pushed by mirrors and
//! serves signed change sets to mirrors that pull.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::apply::{ApplyStats, ChangeApplier};
use super::extractor::ChangeExtractor;
use super::payload::SignedPayload;
use super::ReplicationConfig;
use crate::error::{Error, Result};
use crate::signing::InstanceKey;
use crate::store::Store;

/// What peers need to register this instance
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub instance_id: String,
    pub public_key: String,
}

pub struct ReplicationService {
    config: ReplicationConfig,
    store: Arc<Store>,
    key: Arc<InstanceKey>,
    extractor: ChangeExtractor,
    applier: ChangeApplier,
}

impl ReplicationService {
    pub fn new(config: ReplicationConfig, store: Arc<Store>, key: Arc<InstanceKey>) -> Self {
        let extractor = ChangeExtractor::new(store.clone(), config.first_sync_lookback);
        let applier = ChangeApplier::new(store.clone(), config.clone());
        Self {
            config,
            store,
            key,
            extractor,
            applier,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn extractor(&self) -> &ChangeExtractor {
        &self.extractor
    }

    pub fn applier(&self) -> &ChangeApplier {
        &self.applier
    }

    pub fn identity(&self) -> Identity {
        Identity {
            instance_id: self.config.instance_id.clone(),
            public_key: self.key.public_key_base64(),
        }
    }

    /// Accept a push. The signature is checked against the sender's
    /// registered key before the body is parsed.
    pub async fn receive(&self, payload: SignedPayload) -> Result<ApplyStats> {
        let mirror = self
            .store
            .get_mirror_by_instance(&payload.instance)
            .await?
            .ok_or_else(|| Error::UnknownInstance(payload.instance.clone()))?;

        let changes = match payload.open(&mirror.public_key) {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Rejected push from {}: {}", mirror.instance_id, e);
                return Err(e);
            }
        };

        let received = changes.len();
        let stats = self.applier.apply(&mirror, changes).await?;
        info!(
            "Received {} entities from {}: {} synced, {} conflicts, {} failed",
            received,
            mirror.instance_id,
            stats.synced(),
            stats.conflicts,
            stats.failed
        );
        Ok(stats)
    }

    /// Signed change set for a pulling mirror
    pub async fn changes_since(&self, since: DateTime<Utc>, requester: Option<&str>) -> Result<SignedPayload> {
        if self.config.require_known_peer {
            let requester = requester
                .ok_or_else(|| Error::UnknownInstance("<anonymous>".to_string()))?;
            if self.store.get_mirror_by_instance(requester).await?.is_none() {
                return Err(Error::UnknownInstance(requester.to_string()));
            }
        }

        let changes = self.extractor.extract(since, &self.config.instance_id).await?;
        info!(
            "Serving {} changed entities since {} to {}",
            changes.len(),
            since,
            requester.unwrap_or("<anonymous>")
        );
        changes.seal(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transaction;
    use crate::replication::payload::ChangeSet;
    use crate::store::fixtures::{at, transaction};
    use crate::store::new_mirror;

    struct Pair {
        local: ReplicationService,
        peer_key: InstanceKey,
    }

    async fn pair() -> Pair {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let peer_key = InstanceKey::generate();
        store
            .create_mirror(new_mirror("b.example", &peer_key.public_key_base64()))
            .await
            .unwrap();
        let local = ReplicationService::new(
            ReplicationConfig::for_instance("a.example", 1),
            store,
            Arc::new(InstanceKey::generate()),
        );
        Pair { local, peer_key }
    }

    fn push_from(key: &InstanceKey, source: &str) -> SignedPayload {
        ChangeSet {
            transactions: vec![transaction(1, "4.20", at(9, 0))],
            accounts: vec![],
            timestamp: at(12, 0),
            source_instance: source.into(),
        }
        .seal(key)
        .unwrap()
    }

    #[tokio::test]
    async fn test_receive_applies_signed_push() {
        let p = pair().await;
        let stats = p.local.receive(push_from(&p.peer_key, "b.example")).await.unwrap();

        assert_eq!(stats.synced(), 1);
        let stored: Option<Transaction> = p.local.store().get_record(1).await.unwrap();
        assert_eq!(stored.map(|t| t.amount), Some("4.20".to_string()));
    }

    #[tokio::test]
    async fn test_receive_rejects_unknown_and_forged() {
        let p = pair().await;

        let unknown = p.local.receive(push_from(&p.peer_key, "stranger.example")).await;
        assert!(matches!(unknown, Err(Error::UnknownInstance(_))));

        let forged = p.local.receive(push_from(&InstanceKey::generate(), "b.example")).await;
        assert!(matches!(forged, Err(Error::SignatureRejected(_))));
        assert!(p.local.store().get_record::<Transaction>(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changes_since_requires_known_peer() {
        let p = pair().await;
        p.local.store().put_record(&transaction(3, "1.00", at(10, 0))).await.unwrap();

        assert!(p.local.changes_since(at(0, 0), None).await.is_err());
        assert!(p.local.changes_since(at(0, 0), Some("stranger.example")).await.is_err());

        let payload = p.local.changes_since(at(0, 0), Some("b.example")).await.unwrap();
        let opened = payload.open(&p.local.identity().public_key).unwrap();
        assert_eq!(opened.source_instance, "a.example");
        assert_eq!(opened.transactions.len(), 1);
    }
}
