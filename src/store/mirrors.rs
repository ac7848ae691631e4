//! Mirror Registry
//!
//! Durable configuration of the peer instances this instance replicates
//! with.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, opt_ts_column, tag_column, ts_column, Store};
use crate::error::{Error, Result};
use crate::model::{MirrorInstance, MirrorUpdate, NewMirror};
use crate::signing::parse_public_key;

const MIRROR_COLUMNS: &str = "id, instance_id, instance_url, public_key, sync_enabled, \
     sync_direction, priority, last_sync, created_at, updated_at";

fn mirror_from_row(row: &Row<'_>) -> rusqlite::Result<MirrorInstance> {
    Ok(MirrorInstance {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        instance_url: row.get(2)?,
        public_key: row.get(3)?,
        sync_enabled: row.get(4)?,
        sync_direction: tag_column(row, 5)?,
        priority: row.get(6)?,
        last_sync: opt_ts_column(row, 7)?,
        created_at: ts_column(row, 8)?,
        updated_at: ts_column(row, 9)?,
    })
}

fn load_mirror(conn: &Connection, id: i64) -> Result<MirrorInstance> {
    let sql = format!("SELECT {} FROM mirror_instances WHERE id = ?1", MIRROR_COLUMNS);
    conn.query_row(&sql, params![id], mirror_from_row)
        .optional()?
        .ok_or(Error::MirrorNotFound(id))
}

/// Reject a value already held by a different mirror
fn ensure_unique(
    conn: &Connection,
    field: &'static str,
    value: &str,
    except: Option<i64>,
) -> Result<()> {
    let sql = format!("SELECT id FROM mirror_instances WHERE {} = ?1", field);
    let holder: Option<i64> = conn
        .query_row(&sql, params![value], |row| row.get(0))
        .optional()?;
    match holder {
        Some(id) if Some(id) != except => Err(Error::DuplicateMirror {
            field,
            value: value.to_string(),
        }),
        _ => Ok(()),
    }
}

fn validate_fields(url: Option<&str>, public_key: Option<&str>, priority: Option<i32>) -> Result<()> {
    if let Some(url) = url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "instance_url must be an http(s) URL: {}",
                url
            )));
        }
    }
    if let Some(key) = public_key {
        parse_public_key(key)?;
    }
    if let Some(priority) = priority {
        if priority < 1 {
            return Err(Error::Config("priority must be >= 1".into()));
        }
    }
    Ok(())
}

impl Store {
    /// Register a new mirror
    pub async fn create_mirror(&self, new: NewMirror) -> Result<MirrorInstance> {
        if new.instance_id.trim().is_empty() {
            return Err(Error::Config("instance_id cannot be empty".into()));
        }
        let url = new.instance_url.trim_end_matches('/').to_string();
        validate_fields(Some(&url), Some(&new.public_key), Some(new.priority))?;

        self.transaction(|tx| {
            ensure_unique(tx, "instance_id", &new.instance_id, None)?;
            ensure_unique(tx, "instance_url", &url, None)?;

            let now = format_ts(&Utc::now());
            tx.execute(
                r#"
                INSERT INTO mirror_instances (instance_id, instance_url, public_key,
                    sync_enabled, sync_direction, priority, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
                params![
                    new.instance_id,
                    url,
                    new.public_key.trim(),
                    new.sync_enabled,
                    new.sync_direction.as_str(),
                    new.priority,
                    now,
                ],
            )?;
            load_mirror(tx, tx.last_insert_rowid())
        })
        .await
    }

    /// All registered mirrors, in registration order
    pub async fn list_mirrors(&self) -> Result<Vec<MirrorInstance>> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM mirror_instances ORDER BY id", MIRROR_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], mirror_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Mirrors that take part in sync-all
    pub async fn list_enabled_mirrors(&self) -> Result<Vec<MirrorInstance>> {
        Ok(self
            .list_mirrors()
            .await?
            .into_iter()
            .filter(|m| m.sync_enabled)
            .collect())
    }

    pub async fn get_mirror(&self, id: i64) -> Result<MirrorInstance> {
        self.read(|conn| load_mirror(conn, id)).await
    }

    /// Look up a mirror by the identifier it announces in `X-Instance`
    pub async fn get_mirror_by_instance(&self, instance_id: &str) -> Result<Option<MirrorInstance>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM mirror_instances WHERE instance_id = ?1",
                MIRROR_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![instance_id], mirror_from_row)
                .optional()?)
        })
        .await
    }

    /// Apply a partial update
    pub async fn update_mirror(&self, id: i64, update: MirrorUpdate) -> Result<MirrorInstance> {
        let url = update
            .instance_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string());
        validate_fields(url.as_deref(), update.public_key.as_deref(), update.priority)?;

        self.transaction(|tx| {
            let mut mirror = load_mirror(tx, id)?;
            if let Some(url) = url {
                ensure_unique(tx, "instance_url", &url, Some(id))?;
                mirror.instance_url = url;
            }
            if let Some(key) = update.public_key {
                mirror.public_key = key.trim().to_string();
            }
            if let Some(enabled) = update.sync_enabled {
                mirror.sync_enabled = enabled;
            }
            if let Some(direction) = update.sync_direction {
                mirror.sync_direction = direction;
            }
            if let Some(priority) = update.priority {
                mirror.priority = priority;
            }

            tx.execute(
                r#"
                UPDATE mirror_instances SET instance_url = ?2, public_key = ?3,
                    sync_enabled = ?4, sync_direction = ?5, priority = ?6, updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    id,
                    mirror.instance_url,
                    mirror.public_key,
                    mirror.sync_enabled,
                    mirror.sync_direction.as_str(),
                    mirror.priority,
                    format_ts(&Utc::now()),
                ],
            )?;
            load_mirror(tx, id)
        })
        .await
    }

    /// Remove a mirror together with its sync log
    pub async fn delete_mirror(&self, id: i64) -> Result<()> {
        self.transaction(|tx| {
            let removed = tx.execute("DELETE FROM mirror_instances WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(Error::MirrorNotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Record the start time of a fully successful round
    pub async fn set_last_sync(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE mirror_instances SET last_sync = ?2 WHERE id = ?1",
                params![id, format_ts(&at)],
            )?;
            if changed == 0 {
                return Err(Error::MirrorNotFound(id));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) fn new_mirror(instance_id: &str, public_key: &str) -> NewMirror {
    NewMirror {
        instance_id: instance_id.to_string(),
        instance_url: format!("https://{}", instance_id),
        public_key: public_key.to_string(),
        sync_enabled: true,
        sync_direction: crate::model::SyncDirection::Bidirectional,
        priority: 2,
    }
}
