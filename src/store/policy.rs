//! Conflict Resolution Policies
//!
//! One stored strategy per entity kind. Kinds without a row use the
//! configured default.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{format_ts, opt_ts_column, Store};
use crate::error::{Error, Result};
use crate::model::{ConflictPolicy, EntityKind, Strategy};

fn ensure_syncable(kind: EntityKind) -> Result<()> {
    match kind {
        EntityKind::Transaction | EntityKind::Account => Ok(()),
        EntityKind::General => Err(Error::Config(
            "conflict policies apply to transaction or account only".into(),
        )),
    }
}

impl Store {
    /// Effective policy for `kind`, falling back to `default`
    pub async fn conflict_policy(&self, kind: EntityKind, default: &Strategy) -> Result<ConflictPolicy> {
        ensure_syncable(kind)?;
        let stored = self
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT strategy, primary_instance_id, updated_at
                         FROM conflict_resolutions WHERE entity_type = ?1",
                        params![kind.as_str()],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                opt_ts_column(row, 2)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        match stored {
            Some((name, primary, updated_at)) => Ok(ConflictPolicy {
                entity_type: kind,
                strategy: Strategy::from_parts(&name, primary)?,
                updated_at,
            }),
            None => Ok(ConflictPolicy {
                entity_type: kind,
                strategy: default.clone(),
                updated_at: None,
            }),
        }
    }

    /// Store the strategy for `kind`, replacing any previous one
    pub async fn set_conflict_policy(&self, kind: EntityKind, strategy: Strategy) -> Result<ConflictPolicy> {
        ensure_syncable(kind)?;
        let now = Utc::now();
        self.transaction(|tx| {
            tx.execute(
                r#"
                INSERT INTO conflict_resolutions (entity_type, strategy, primary_instance_id,
                    created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(entity_type) DO UPDATE SET
                    strategy = excluded.strategy,
                    primary_instance_id = excluded.primary_instance_id,
                    updated_at = excluded.updated_at
                "#,
                params![
                    kind.as_str(),
                    strategy.name(),
                    strategy.primary_instance_id(),
                    format_ts(&now),
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(ConflictPolicy {
            entity_type: kind,
            strategy,
            updated_at: Some(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_falls_back_to_default() {
        let store = Store::open_in_memory().unwrap();
        let policy = store
            .conflict_policy(EntityKind::Transaction, &Strategy::Manual)
            .await
            .unwrap();
        assert_eq!(policy.strategy, Strategy::Manual);
        assert!(policy.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_set_replaces_previous() {
        let store = Store::open_in_memory().unwrap();
        store
            .set_conflict_policy(EntityKind::Account, Strategy::Manual)
            .await
            .unwrap();
        let primary = Strategy::PrimaryWins {
            primary_instance_id: Some("hq.example.com".into()),
        };
        store
            .set_conflict_policy(EntityKind::Account, primary.clone())
            .await
            .unwrap();

        let policy = store
            .conflict_policy(EntityKind::Account, &Strategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(policy.strategy, primary);
        assert!(policy.updated_at.is_some());

        let other = store
            .conflict_policy(EntityKind::Transaction, &Strategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(other.strategy, Strategy::LastWriteWins);
    }

    #[tokio::test]
    async fn test_general_kind_rejected() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .set_conflict_policy(EntityKind::General, Strategy::Manual)
            .await
            .is_err());
    }
}
