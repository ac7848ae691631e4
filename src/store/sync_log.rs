//! Sync Log
//!
//! Append-only audit trail of replication attempts. Counters shown to
//! operators are always derived from these rows.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{format_ts, tag_column, ts_column, Store};
use crate::error::Result;
use crate::model::{
    ConflictSnapshot, EntityId, EntityKind, LogSummary, NewLogEntry, Outcome, SyncLogEntry,
};

const LOG_COLUMNS: &str = "id, mirror_instance_id, sync_type, entity_type, entity_id, operation, \
     status, resolution, error_message, conflict_data, synced_at";

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let resolution: Option<String> = row.get(7)?;
    let conflict_data: Option<String> = row.get(9)?;
    Ok(SyncLogEntry {
        id: row.get(0)?,
        mirror_id: row.get(1)?,
        direction: tag_column(row, 2)?,
        entity_type: tag_column(row, 3)?,
        entity_id: row.get(4)?,
        operation: tag_column(row, 5)?,
        status: tag_column(row, 6)?,
        resolution: match resolution {
            Some(_) => Some(tag_column(row, 7)?),
            None => None,
        },
        error_message: row.get(8)?,
        conflict_data: conflict_data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
            })?,
        synced_at: ts_column(row, 10)?,
    })
}

/// Insert one row; usable inside an enclosing transaction
pub(crate) fn append_log(conn: &Connection, entry: &NewLogEntry) -> Result<i64> {
    let conflict_data = entry
        .conflict_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        r#"
        INSERT INTO sync_logs (mirror_instance_id, sync_type, entity_type, entity_id, operation,
            status, resolution, error_message, conflict_data, synced_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            entry.mirror_id,
            entry.direction.as_str(),
            entry.entity_type.as_str(),
            entry.entity_id,
            entry.operation.as_str(),
            entry.status.as_str(),
            entry.resolution.map(|r| r.as_str()),
            entry.error_message,
            conflict_data,
            format_ts(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether a conflict with this exact remote version is already pending
pub(crate) fn pending_conflict_exists(
    conn: &Connection,
    mirror_id: i64,
    kind: EntityKind,
    entity_id: EntityId,
    remote: &serde_json::Value,
) -> Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT conflict_data FROM sync_logs
         WHERE mirror_instance_id = ?1 AND entity_type = ?2 AND entity_id = ?3
           AND status = ?4 AND conflict_data IS NOT NULL",
    )?;
    let rows = stmt.query_map(
        params![mirror_id, kind.as_str(), entity_id, Outcome::Conflict.as_str()],
        |row| row.get::<_, String>(0),
    )?;
    for raw in rows {
        let snapshot: ConflictSnapshot = serde_json::from_str(&raw?)?;
        if &snapshot.remote == remote {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Store {
    pub async fn append_log(&self, entry: NewLogEntry) -> Result<i64> {
        self.read(|conn| append_log(conn, &entry)).await
    }

    /// Most recent entries for one mirror, newest first
    pub async fn logs_for_mirror(&self, mirror_id: i64, limit: u32) -> Result<Vec<SyncLogEntry>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM sync_logs WHERE mirror_instance_id = ?1 ORDER BY id DESC LIMIT ?2",
                LOG_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![mirror_id, limit], log_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Pending conflicts across all mirrors, newest first
    pub async fn conflict_logs(&self, limit: u32) -> Result<Vec<SyncLogEntry>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {} FROM sync_logs WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
                LOG_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![Outcome::Conflict.as_str(), limit], log_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Outcome counts for one mirror, derived from the log
    pub async fn log_summary(&self, mirror_id: i64) -> Result<LogSummary> {
        self.read(|conn| {
            let mut summary = LogSummary {
                mirror_id,
                ..Default::default()
            };
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM sync_logs
                 WHERE mirror_instance_id = ?1 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![mirror_id], |row| {
                Ok((tag_column::<Outcome>(row, 0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                let count = count.max(0) as u64;
                match status {
                    Outcome::Success => summary.success = count,
                    Outcome::Failed => summary.failed = count,
                    Outcome::Conflict => summary.conflict = count,
                }
            }

            let last: Option<String> = conn.query_row(
                "SELECT MAX(synced_at) FROM sync_logs WHERE mirror_instance_id = ?1",
                params![mirror_id],
                |row| row.get(0),
            )?;
            summary.last_entry_at = last
                .map(|raw| chrono::DateTime::parse_from_rfc3339(&raw))
                .transpose()
                .map_err(|e| crate::Error::Database(format!("bad synced_at: {}", e)))?
                .map(|ts| ts.with_timezone(&Utc));
            Ok(summary)
        })
        .await
    }
}
