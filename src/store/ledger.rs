//! Ledger Tables
//!
//! Accounts and transactions belong to the ledger domain. Replication only
//! needs to look them up by id, select by freshness, and replace them as
//! whole records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{date_column, format_ts, ts_column, Store};
use crate::error::Result;
use crate::model::{Account, EntityId, EntityKind, Transaction};

/// A ledger record that replication can move between instances
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send + Sync + Sized + 'static {
    const KIND: EntityKind;

    fn id(&self) -> EntityId;

    fn updated_at(&self) -> DateTime<Utc>;

    fn load(conn: &Connection, id: EntityId) -> Result<Option<Self>>;

    fn insert(&self, conn: &Connection) -> Result<()>;

    /// Replace every field except `id` and `created_at`
    fn overwrite(&self, conn: &Connection) -> Result<()>;

    /// Records with `updated_at` strictly after `since`, oldest first
    fn changed_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<Self>>;
}

const TRANSACTION_COLUMNS: &str = "id, account_id, date, amount, category, description, status, \
     source, requires_confirmation, receipt_path, created_at, updated_at";

const ACCOUNT_COLUMNS: &str =
    "id, name, type, iban, balance, currency, bank_name, created_at, updated_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        date: date_column(row, 2)?,
        amount: row.get(3)?,
        category: row.get(4)?,
        description: row.get(5)?,
        status: row.get(6)?,
        source: row.get(7)?,
        requires_confirmation: row.get(8)?,
        receipt_path: row.get(9)?,
        created_at: ts_column(row, 10)?,
        updated_at: ts_column(row, 11)?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        account_type: row.get(2)?,
        iban: row.get(3)?,
        balance: row.get(4)?,
        currency: row.get(5)?,
        bank_name: row.get(6)?,
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
    })
}

impl LedgerRecord for Transaction {
    const KIND: EntityKind = EntityKind::Transaction;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn load(conn: &Connection, id: EntityId) -> Result<Option<Self>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS);
        Ok(conn.query_row(&sql, params![id], transaction_from_row).optional()?)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO transactions (id, account_id, date, amount, category, description,
                status, source, requires_confirmation, receipt_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                self.id,
                self.account_id,
                self.date.format("%Y-%m-%d").to_string(),
                self.amount,
                self.category,
                self.description,
                self.status,
                self.source,
                self.requires_confirmation,
                self.receipt_path,
                format_ts(&self.created_at),
                format_ts(&self.updated_at),
            ],
        )?;
        Ok(())
    }

    fn overwrite(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            UPDATE transactions SET account_id = ?2, date = ?3, amount = ?4, category = ?5,
                description = ?6, status = ?7, source = ?8, requires_confirmation = ?9,
                receipt_path = ?10, updated_at = ?11
            WHERE id = ?1
            "#,
            params![
                self.id,
                self.account_id,
                self.date.format("%Y-%m-%d").to_string(),
                self.amount,
                self.category,
                self.description,
                self.status,
                self.source,
                self.requires_confirmation,
                self.receipt_path,
                format_ts(&self.updated_at),
            ],
        )?;
        Ok(())
    }

    fn changed_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE updated_at > ?1 ORDER BY updated_at, id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![format_ts(&since)], transaction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl LedgerRecord for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn load(conn: &Connection, id: EntityId) -> Result<Option<Self>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], account_from_row).optional()?)
    }

    fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO accounts (id, name, type, iban, balance, currency, bank_name,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                self.id,
                self.name,
                self.account_type,
                self.iban,
                self.balance,
                self.currency,
                self.bank_name,
                format_ts(&self.created_at),
                format_ts(&self.updated_at),
            ],
        )?;
        Ok(())
    }

    fn overwrite(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            UPDATE accounts SET name = ?2, type = ?3, iban = ?4, balance = ?5, currency = ?6,
                bank_name = ?7, updated_at = ?8
            WHERE id = ?1
            "#,
            params![
                self.id,
                self.name,
                self.account_type,
                self.iban,
                self.balance,
                self.currency,
                self.bank_name,
                format_ts(&self.updated_at),
            ],
        )?;
        Ok(())
    }

    fn changed_since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {} FROM accounts WHERE updated_at > ?1 ORDER BY updated_at, id",
            ACCOUNT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![format_ts(&since)], account_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl Store {
    /// Look up one ledger record
    pub async fn get_record<R: LedgerRecord>(&self, id: EntityId) -> Result<Option<R>> {
        self.read(|conn| R::load(conn, id)).await
    }

    /// Write a record as the ledger would: insert, or replace if it exists
    pub async fn put_record<R: LedgerRecord>(&self, record: &R) -> Result<()> {
        self.transaction(|tx| match R::load(tx, record.id())? {
            Some(_) => record.overwrite(tx),
            None => record.insert(tx),
        })
        .await
    }

    /// Records of one kind changed after `since`
    pub async fn changed_since<R: LedgerRecord>(&self, since: DateTime<Utc>) -> Result<Vec<R>> {
        self.read(|conn| R::changed_since(conn, since)).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{NaiveDate, TimeZone, Utc};

    use crate::model::{Account, EntityId, Transaction};

    pub fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    pub fn transaction(id: EntityId, amount: &str, updated_at: chrono::DateTime<Utc>) -> Transaction {
        Transaction {
            id,
            account_id: 1,
            date: NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            amount: amount.to_string(),
            category: Some("groceries".to_string()),
            description: Some(format!("purchase #{}", id)),
            status: "confirmed".to_string(),
            source: "manual".to_string(),
            requires_confirmation: false,
            receipt_path: None,
            created_at: at(8, 0),
            updated_at,
        }
    }

    pub fn account(id: EntityId, balance: &str, updated_at: chrono::DateTime<Utc>) -> Account {
        Account {
            id,
            name: format!("Account {}", id),
            account_type: "checking".to_string(),
            iban: Some("CH9300762011623852957".to_string()),
            balance: balance.to_string(),
            currency: "CHF".to_string(),
            bank_name: Some("PostFinance".to_string()),
            created_at: at(8, 0),
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn test_put_and_get_records() {
        let store = Store::open_in_memory().unwrap();
        let tx = transaction(10, "-42.10", at(9, 0));
        store.put_record(&tx).await.unwrap();

        let loaded: Transaction = store.get_record(10).await.unwrap().unwrap();
        assert_eq!(loaded, tx);
        assert!(store.get_record::<Account>(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let store = Store::open_in_memory().unwrap();
        store.put_record(&account(1, "100.00", at(9, 0))).await.unwrap();

        let mut newer = account(1, "250.00", at(10, 0));
        newer.created_at = at(23, 59);
        store.put_record(&newer).await.unwrap();

        let loaded: Account = store.get_record(1).await.unwrap().unwrap();
        assert_eq!(loaded.balance, "250.00");
        assert_eq!(loaded.updated_at, at(10, 0));
        assert_eq!(loaded.created_at, at(8, 0));
    }

    #[tokio::test]
    async fn test_changed_since_is_strict() {
        let store = Store::open_in_memory().unwrap();
        store.put_record(&transaction(1, "1.00", at(9, 0))).await.unwrap();
        store.put_record(&transaction(2, "2.00", at(10, 0))).await.unwrap();
        store.put_record(&transaction(3, "3.00", at(11, 0))).await.unwrap();

        let changed: Vec<Transaction> = store.changed_since(at(10, 0)).await.unwrap();
        assert_eq!(changed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![3]);

        let all: Vec<Transaction> = store.changed_since(at(0, 0)).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
