//! Durable Store
//!
//! SQLite database shared by the ledger tables and the replication
//! tables (mirror registry, conflict policies, sync log).

mod ledger;
mod mirrors;
mod policy;
mod sync_log;

use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tokio::sync::Mutex;

use crate::error::Result;

pub use ledger::LedgerRecord;

#[cfg(test)]
pub(crate) use ledger::fixtures;
#[cfg(test)]
pub(crate) use mirrors::new_mirror;

pub(crate) use sync_log::{append_log, pending_conflict_exists};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    iban TEXT,
    balance TEXT NOT NULL,
    currency TEXT NOT NULL,
    bank_name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_updated_at ON accounts(updated_at);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    date TEXT NOT NULL,
    amount TEXT NOT NULL,
    category TEXT,
    description TEXT,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    requires_confirmation INTEGER NOT NULL DEFAULT 0,
    receipt_path TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_updated_at ON transactions(updated_at);

CREATE TABLE IF NOT EXISTS mirror_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL UNIQUE,
    instance_url TEXT NOT NULL UNIQUE,
    public_key TEXT NOT NULL,
    sync_enabled INTEGER NOT NULL DEFAULT 1,
    sync_direction TEXT NOT NULL DEFAULT 'bidirectional',
    priority INTEGER NOT NULL DEFAULT 2,
    last_sync TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mirror_instance_id INTEGER NOT NULL
        REFERENCES mirror_instances(id) ON DELETE CASCADE,
    sync_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    operation TEXT NOT NULL,
    status TEXT NOT NULL,
    resolution TEXT,
    error_message TEXT,
    conflict_data TEXT,
    synced_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_logs_mirror ON sync_logs(mirror_instance_id, id);
CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs(status, id);

CREATE TABLE IF NOT EXISTS conflict_resolutions (
    entity_type TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    primary_instance_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Shared handle to the instance database
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open a throwaway database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the connection
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run `f` inside one SQLite transaction; rolled back if `f` fails
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Stored timestamp form: fixed-width RFC 3339 in UTC, so text order is time order
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => ts_column(row, idx).map(Some),
    }
}

pub(crate) fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a stored tag column into its enum
pub(crate) fn tag_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = crate::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
