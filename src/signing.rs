//! Instance Signing Keys
//!
//! Every instance owns one Ed25519 keypair. The secret half lives in a
//! file outside the database (base64, owner-only permissions); the public
//! half is registered on peers so they can verify our payloads.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::info;

use crate::error::{Error, Result};

/// The instance keypair used to sign outgoing change sets
pub struct InstanceKey {
    signing_key: SigningKey,
}

impl InstanceKey {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Load a keypair from a private key file (32 bytes, base64 encoded)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(content.trim())
            .map_err(|e| key_error(path, format!("not valid base64: {}", e)))?;
        let key_bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            key_error(path, format!("expected 32 bytes, found {}", bytes.len()))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Save the private key to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Instance key saved to {:?}", path);
        Ok(())
    }

    /// Load the keypair, generating and persisting one on first use
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading instance key from {:?}", path);
            Self::load(path)
        } else {
            info!("No instance key found, generating one at {:?}", path);
            let key = Self::generate();
            key.save(path)?;
            Ok(key)
        }
    }

    /// Public key as registered on peers
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign exactly these bytes; returns a base64 signature
    pub fn sign(&self, payload: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(payload).to_bytes())
    }
}

/// Check a base64 signature against a base64 public key.
///
/// Any malformed input counts as a mismatch.
pub fn verify(payload: &[u8], signature: &str, public_key: &str) -> bool {
    let Ok(key) = parse_public_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    key.verify(payload, &Signature::from_bytes(&sig_bytes)).is_ok()
}

/// Parse a base64-encoded Ed25519 public key
pub fn parse_public_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Config(format!("public key is not valid base64: {}", e)))?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        Error::Config(format!("invalid public key length: {} (expected 32)", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| Error::Config(format!("invalid public key: {}", e)))
}

fn key_error(path: &Path, reason: String) -> Error {
    Error::KeyFile {
        path: path.display().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sign_and_verify() {
        let key = InstanceKey::generate();
        let body = br#"{"transactions":[],"accounts":[]}"#;
        let signature = key.sign(body);

        assert!(verify(body, &signature, &key.public_key_base64()));
    }

    #[test]
    fn test_verify_rejects_tampering_and_wrong_key() {
        let key = InstanceKey::generate();
        let other = InstanceKey::generate();
        let signature = key.sign(b"amount=10.00");

        assert!(!verify(b"amount=99.00", &signature, &key.public_key_base64()));
        assert!(!verify(b"amount=10.00", &signature, &other.public_key_base64()));
    }

    #[test]
    fn test_verify_never_errors_on_garbage() {
        let key = InstanceKey::generate();
        let signature = key.sign(b"x");

        assert!(!verify(b"x", "not base64 !!", &key.public_key_base64()));
        assert!(!verify(b"x", &BASE64.encode([1u8; 10]), &key.public_key_base64()));
        assert!(!verify(b"x", &signature, "AAAA"));
        assert!(!verify(b"x", &signature, ""));
    }

    #[test]
    fn test_load_or_generate_persists_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets").join("instance.key");

        let first = InstanceKey::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = InstanceKey::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());
    }

    #[test]
    fn test_malformed_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instance.key");

        std::fs::write(&path, "definitely not a key").unwrap();
        assert!(matches!(InstanceKey::load(&path), Err(Error::KeyFile { .. })));

        std::fs::write(&path, BASE64.encode([7u8; 16])).unwrap();
        assert!(matches!(InstanceKey::load_or_generate(&path), Err(Error::KeyFile { .. })));
    }

    #[test]
    fn test_parse_public_key() {
        let key = InstanceKey::generate();
        assert!(parse_public_key(&key.public_key_base64()).is_ok());
        assert!(parse_public_key("c2hvcnQ=").is_err());
    }
}
