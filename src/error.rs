//! LedgerMirror Error Types

use thiserror::Error;

/// Result type alias for LedgerMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// LedgerMirror error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Mirror not found: {0}")]
    MirrorNotFound(i64),

    #[error("Unknown mirror instance: {0}")]
    UnknownInstance(String),

    #[error("Mirror already registered with this {field}: {value}")]
    DuplicateMirror { field: &'static str, value: String },

    #[error("Sync round already running for mirror {0}")]
    RoundInProgress(String),

    // Key errors
    #[error("Instance key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Payload errors
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Signature rejected for {0}")]
    SignatureRejected(String),

    // Transport errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Mirror {url} responded with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error aborts a sync round at the transport boundary
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionTimeout(_)
                | Error::HttpStatus { .. }
                | Error::SignatureRejected(_)
                | Error::InvalidPayload(_)
        )
    }

    /// Check if this error is worth retrying on the next trigger
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::ConnectionTimeout(_) => true,
            Error::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(format!("SQLite error: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let url = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        if e.is_timeout() {
            Error::ConnectionTimeout(url)
        } else if let Some(status) = e.status() {
            Error::HttpStatus { url, status: status.as_u16() }
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::ConnectionTimeout("m1".into()).is_transport());
        assert!(Error::SignatureRejected("m1".into()).is_transport());
        assert!(!Error::MirrorNotFound(3).is_transport());
        assert!(!Error::Config("bad".into()).is_transport());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Network("refused".into()).is_retryable());
        assert!(Error::HttpStatus { url: "u".into(), status: 503 }.is_retryable());
        assert!(!Error::HttpStatus { url: "u".into(), status: 404 }.is_retryable());
        assert!(!Error::SignatureRejected("m".into()).is_retryable());
    }
}
