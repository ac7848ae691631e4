//! Change Extractor
//!
//! Selects the local delta sent to a mirror.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Account, Transaction};
use crate::replication::payload::ChangeSet;
use crate::store::Store;

pub struct ChangeExtractor {
    store: Arc<Store>,
    first_sync_lookback: chrono::Duration,
}

impl ChangeExtractor {
    pub fn new(store: Arc<Store>, first_sync_lookback: chrono::Duration) -> Self {
        Self {
            store,
            first_sync_lookback,
        }
    }

    /// The mirror's last successful sync, or the look-back window for a new one
    pub fn cutoff(&self, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        last_sync.unwrap_or(now - self.first_sync_lookback)
    }

    /// Every account and transaction modified strictly after `since`
    pub async fn extract(&self, since: DateTime<Utc>, source_instance: &str) -> Result<ChangeSet> {
        let accounts = self.store.changed_since::<Account>(since).await?;
        let transactions = self.store.changed_since::<Transaction>(since).await?;
        tracing::debug!(
            "Extracted {} transactions and {} accounts changed since {}",
            transactions.len(),
            accounts.len(),
            since
        );
        Ok(ChangeSet {
            transactions,
            accounts,
            timestamp: Utc::now(),
            source_instance: source_instance.to_string(),
        })
    }
}
