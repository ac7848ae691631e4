//! Replication Payload
//!
//! Wire format shared by push bodies and pull responses. The body is
//! serialized once; the signature covers those exact bytes and the
//! receiver verifies them before parsing anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Account, Transaction};
use crate::signing::{self, InstanceKey};

/// A local delta ready to be sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub transactions: Vec<Transaction>,
    pub accounts: Vec<Account>,
    pub timestamp: DateTime<Utc>,
    pub source_instance: String,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.transactions.len() + self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize and sign
    pub fn seal(&self, key: &InstanceKey) -> Result<SignedPayload> {
        let body = serde_json::to_vec(self)?;
        let signature = key.sign(&body);
        Ok(SignedPayload {
            body,
            signature,
            instance: self.source_instance.clone(),
        })
    }
}

/// A received change set whose entities have not been parsed yet.
///
/// Entities stay as JSON values so a malformed record fails on its own
/// instead of rejecting the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChangeSet {
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
    #[serde(default)]
    pub accounts: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub source_instance: String,
}

impl RawChangeSet {
    pub fn len(&self) -> usize {
        self.transactions.len() + self.accounts.len()
    }
}

/// Body bytes plus the headers that travel with them
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub body: Vec<u8>,
    /// `X-Signature`
    pub signature: String,
    /// `X-Instance`
    pub instance: String,
}

impl SignedPayload {
    /// Verify against the sender's registered key, then parse
    pub fn open(&self, public_key: &str) -> Result<RawChangeSet> {
        if !signing::verify(&self.body, &self.signature, public_key) {
            return Err(Error::SignatureRejected(self.instance.clone()));
        }
        let changes: RawChangeSet = serde_json::from_slice(&self.body)?;
        if changes.source_instance != self.instance {
            return Err(Error::SignatureRejected(format!(
                "{} (payload claims to come from {})",
                self.instance, changes.source_instance
            )));
        }
        Ok(changes)
    }
}

/// Answer to a push, as returned by `/replication/receive`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiveResponse {
    pub status: String,
    pub entities_synced: u64,
    pub conflicts: u64,
    #[serde(default)]
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{account, at, transaction};

    fn change_set() -> ChangeSet {
        ChangeSet {
            transactions: vec![transaction(1, "-12.30", at(9, 0))],
            accounts: vec![account(1, "100.00", at(9, 0))],
            timestamp: at(12, 0),
            source_instance: "a.example".into(),
        }
    }

    #[test]
    fn test_seal_then_open() {
        let key = InstanceKey::generate();
        let payload = change_set().seal(&key).unwrap();
        assert_eq!(payload.instance, "a.example");

        let raw = payload.open(&key.public_key_base64()).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.transactions[0]["amount"], "-12.30");
        assert_eq!(raw.accounts[0]["type"], "checking");
    }

    #[test]
    fn test_signature_checked_before_parsing() {
        let key = InstanceKey::generate();
        let payload = SignedPayload {
            body: b"not json at all".to_vec(),
            signature: InstanceKey::generate().sign(b"not json at all"),
            instance: "a.example".into(),
        };
        assert!(matches!(
            payload.open(&key.public_key_base64()),
            Err(Error::SignatureRejected(_))
        ));

        let signed_garbage = SignedPayload {
            signature: key.sign(b"not json at all"),
            ..payload
        };
        assert!(matches!(
            signed_garbage.open(&key.public_key_base64()),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let key = InstanceKey::generate();
        let mut payload = change_set().seal(&key).unwrap();
        let text = String::from_utf8(payload.body.clone()).unwrap();
        payload.body = text.replace("-12.30", "-1230.00").into_bytes();

        assert!(payload.open(&key.public_key_base64()).is_err());
    }

    #[test]
    fn test_source_instance_must_match_header() {
        let key = InstanceKey::generate();
        let mut payload = change_set().seal(&key).unwrap();
        payload.instance = "b.example".into();

        assert!(matches!(
            payload.open(&key.public_key_base64()),
            Err(Error::SignatureRejected(_))
        ));
    }

    #[test]
    fn test_missing_entity_lists_default_to_empty() {
        let raw: RawChangeSet = serde_json::from_str(
            r#"{"timestamp":"2024-06-01T12:00:00Z","source_instance":"a.example"}"#,
        )
        .unwrap();
        assert_eq!(raw.len(), 0);
    }
}
