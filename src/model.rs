//! Replication Data Model
//!
//! Ledger records exchanged between instances, mirror registry rows,
//! conflict policies and sync log entries.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Ledger-side primary key
pub type EntityId = i64;

/// Record timestamps are persisted with microsecond precision; finer input
/// is truncated on the way in so stored and received values compare equal.
mod micros {
    use chrono::{DateTime, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(|ts| ts.trunc_subsecs(6))
    }
}

/// Defines a closed enum persisted as a lowercase tag, with `as_str`,
/// `Display` and `FromStr` kept in one place.
macro_rules! tagged_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $tag:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(crate::Error::Config(format!(
                        "invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

tagged_enum! {
    /// Kind of entity a log row or policy refers to
    pub enum EntityKind {
        Transaction => "transaction",
        Account => "account",
        /// Mirror-level entries not tied to one entity
        General => "general",
    }
}

tagged_enum! {
    /// Which phases a mirror round runs
    pub enum SyncDirection {
        Push => "push",
        Pull => "pull",
        Bidirectional => "bidirectional",
    }
}

tagged_enum! {
    /// Direction recorded on a sync log row
    pub enum LogDirection {
        /// Local entity sent to a mirror
        Push => "push",
        /// Remote entity applied locally (pulled or received)
        Pull => "pull",
        /// Mirror-level round event
        Sync => "sync",
    }
}

tagged_enum! {
    pub enum Operation {
        Create => "create",
        Update => "update",
        Delete => "delete",
        Sync => "sync",
    }
}

tagged_enum! {
    pub enum Outcome {
        Success => "success",
        Failed => "failed",
        Conflict => "conflict",
    }
}

tagged_enum! {
    /// How a conflict (local strictly newer) was settled
    pub enum Resolution {
        KeptLocal => "kept_local",
        TookRemote => "took_remote",
        Deferred => "deferred",
    }
}

impl SyncDirection {
    pub fn includes_push(&self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Bidirectional)
    }

    pub fn includes_pull(&self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Bidirectional)
    }
}

impl Default for SyncDirection {
    fn default() -> Self {
        SyncDirection::Bidirectional
    }
}

/// Conflict resolution strategy for one entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    /// Keep whichever side was written last (the local copy, when it is newer)
    LastWriteWins,
    /// The authoritative instance wins
    PrimaryWins {
        /// Explicit primary; ranks decide when absent or unrelated
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_instance_id: Option<String>,
    },
    /// Keep local and record the conflict for an operator
    Manual,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LastWriteWins
    }
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::LastWriteWins => "last_write_wins",
            Strategy::PrimaryWins { .. } => "primary_wins",
            Strategy::Manual => "manual",
        }
    }

    /// Rebuild a strategy from its stored columns
    pub fn from_parts(name: &str, primary_instance_id: Option<String>) -> crate::Result<Self> {
        match name {
            "last_write_wins" => Ok(Strategy::LastWriteWins),
            "primary_wins" => Ok(Strategy::PrimaryWins { primary_instance_id }),
            "manual" => Ok(Strategy::Manual),
            other => Err(crate::Error::Config(format!("invalid strategy: {}", other))),
        }
    }

    pub fn primary_instance_id(&self) -> Option<&str> {
        match self {
            Strategy::PrimaryWins { primary_instance_id } => primary_instance_id.as_deref(),
            _ => None,
        }
    }
}

/// Ledger transaction as exchanged on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: EntityId,
    pub account_id: EntityId,
    pub date: NaiveDate,
    /// Decimal amount, kept as text to avoid float rounding
    pub amount: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub source: String,
    pub requires_confirmation: bool,
    pub receipt_path: Option<String>,
    #[serde(deserialize_with = "micros::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "micros::deserialize")]
    pub updated_at: DateTime<Utc>,
}

/// Ledger account as exchanged on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub iban: Option<String>,
    pub balance: String,
    pub currency: String,
    pub bank_name: Option<String>,
    #[serde(deserialize_with = "micros::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "micros::deserialize")]
    pub updated_at: DateTime<Utc>,
}

/// A registered peer instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorInstance {
    pub id: i64,
    pub instance_id: String,
    pub instance_url: String,
    pub public_key: String,
    pub sync_enabled: bool,
    pub sync_direction: SyncDirection,
    /// 1 = primary, 2 = secondary, ...
    pub priority: i32,
    /// Start time of the last fully successful round
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration request for a mirror
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMirror {
    pub instance_id: String,
    pub instance_url: String,
    pub public_key: String,
    #[serde(default = "default_enabled")]
    pub sync_enabled: bool,
    #[serde(default)]
    pub sync_direction: SyncDirection,
    #[serde(default = "default_mirror_priority")]
    pub priority: i32,
}

/// Partial update of a mirror; absent fields are left alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorUpdate {
    pub instance_url: Option<String>,
    pub public_key: Option<String>,
    pub sync_enabled: Option<bool>,
    pub sync_direction: Option<SyncDirection>,
    pub priority: Option<i32>,
}

fn default_enabled() -> bool {
    true
}

fn default_mirror_priority() -> i32 {
    2
}

/// Stored conflict policy for one entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    pub entity_type: EntityKind,
    #[serde(flatten)]
    pub strategy: Strategy,
    /// `None` when the policy is the configured fallback
    pub updated_at: Option<DateTime<Utc>>,
}

/// Both whole versions of a conflicting entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSnapshot {
    pub local: serde_json::Value,
    pub remote: serde_json::Value,
}

/// One immutable sync log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub mirror_id: i64,
    pub direction: LogDirection,
    pub entity_type: EntityKind,
    pub entity_id: EntityId,
    pub operation: Operation,
    pub status: Outcome,
    pub resolution: Option<Resolution>,
    pub error_message: Option<String>,
    pub conflict_data: Option<ConflictSnapshot>,
    pub synced_at: DateTime<Utc>,
}

/// A sync log row before insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub mirror_id: i64,
    pub direction: LogDirection,
    pub entity_type: EntityKind,
    pub entity_id: EntityId,
    pub operation: Operation,
    pub status: Outcome,
    pub resolution: Option<Resolution>,
    pub error_message: Option<String>,
    pub conflict_data: Option<ConflictSnapshot>,
}

impl NewLogEntry {
    pub fn success(
        mirror_id: i64,
        direction: LogDirection,
        entity_type: EntityKind,
        entity_id: EntityId,
        operation: Operation,
    ) -> Self {
        Self {
            mirror_id,
            direction,
            entity_type,
            entity_id,
            operation,
            status: Outcome::Success,
            resolution: None,
            error_message: None,
            conflict_data: None,
        }
    }

    pub fn failed(
        mirror_id: i64,
        direction: LogDirection,
        entity_type: EntityKind,
        entity_id: EntityId,
        operation: Operation,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: Outcome::Failed,
            error_message: Some(error.into()),
            ..Self::success(mirror_id, direction, entity_type, entity_id, operation)
        }
    }

    /// Mirror-level failure of a whole round
    pub fn round_failed(mirror_id: i64, error: impl Into<String>) -> Self {
        Self::failed(mirror_id, LogDirection::Sync, EntityKind::General, 0, Operation::Sync, error)
    }

    /// Attach a conflict resolution and both snapshots
    pub fn with_conflict(mut self, resolution: Resolution, snapshot: ConflictSnapshot) -> Self {
        if resolution == Resolution::Deferred {
            self.status = Outcome::Conflict;
        }
        self.resolution = Some(resolution);
        self.conflict_data = Some(snapshot);
        self
    }
}

/// Per-mirror counts derived from the sync log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSummary {
    pub mirror_id: i64,
    pub success: u64,
    pub failed: u64,
    pub conflict: u64,
    pub last_entry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_through_str() {
        assert_eq!("bidirectional".parse::<SyncDirection>().unwrap(), SyncDirection::Bidirectional);
        assert_eq!(Resolution::KeptLocal.as_str(), "kept_local");
        assert_eq!(EntityKind::General.to_string(), "general");
        assert!("sideways".parse::<SyncDirection>().is_err());
    }

    #[test]
    fn test_direction_phases() {
        assert!(SyncDirection::Push.includes_push());
        assert!(!SyncDirection::Push.includes_pull());
        assert!(SyncDirection::Pull.includes_pull());
        assert!(SyncDirection::Bidirectional.includes_push());
        assert!(SyncDirection::Bidirectional.includes_pull());
    }

    #[test]
    fn test_strategy_serde_shape() {
        let json = serde_json::to_value(Strategy::PrimaryWins {
            primary_instance_id: Some("hq.example.com".into()),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"strategy": "primary_wins", "primary_instance_id": "hq.example.com"})
        );

        let manual: Strategy = serde_json::from_str(r#"{"strategy":"manual"}"#).unwrap();
        assert_eq!(manual, Strategy::Manual);
        assert!(serde_json::from_str::<Strategy>(r#"{"strategy":"coin_flip"}"#).is_err());
    }

    #[test]
    fn test_policy_flattens_strategy() {
        let policy = ConflictPolicy {
            entity_type: EntityKind::Account,
            strategy: Strategy::Manual,
            updated_at: None,
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["entity_type"], "account");
        assert_eq!(json["strategy"], "manual");
    }

    #[test]
    fn test_account_type_field_name() {
        let json = serde_json::json!({
            "id": 4, "name": "Checking", "type": "checking", "iban": null,
            "balance": "12.50", "currency": "CHF", "bank_name": "PostFinance",
            "created_at": "2024-03-01T10:00:00Z", "updated_at": "2024-03-02T10:00:00Z"
        });
        let account: Account = serde_json::from_value(json).unwrap();
        assert_eq!(account.account_type, "checking");
        assert_eq!(serde_json::to_value(&account).unwrap()["type"], "checking");
    }

    #[test]
    fn test_deferred_conflict_marks_outcome() {
        let snapshot = ConflictSnapshot {
            local: serde_json::json!({"id": 1}),
            remote: serde_json::json!({"id": 1}),
        };
        let kept = NewLogEntry::success(1, LogDirection::Pull, EntityKind::Transaction, 1, Operation::Update)
            .with_conflict(Resolution::KeptLocal, snapshot.clone());
        assert_eq!(kept.status, Outcome::Success);

        let deferred = NewLogEntry::success(1, LogDirection::Pull, EntityKind::Transaction, 1, Operation::Update)
            .with_conflict(Resolution::Deferred, snapshot);
        assert_eq!(deferred.status, Outcome::Conflict);
    }
}
