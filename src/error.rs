use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Failure kinds for a transfer session. Per-connection errors are
/// isolated to that connection; startup errors tear down the session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("archive entry escapes the destination: {0}")]
    UnsafePath(String),

    #[error("compression failure: {0}")]
    Compression(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection was not approved")]
    ApprovalDenied,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("discovery failure: {0}")]
    Discovery(String),

    #[error("a sender session is already active")]
    SessionActive,
}

impl TransferError {
    pub fn protocol(message: impl Into<String>) -> Self {
        TransferError::Protocol(message.into())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Protocol(err.to_string())
    }
}

impl From<zip::result::ZipError> for TransferError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(inner) => TransferError::Io(inner),
            other => TransferError::Protocol(other.to_string()),
        }
    }
}

impl From<rustls::Error> for TransferError {
    fn from(err: rustls::Error) -> Self {
        TransferError::Tls(err.to_string())
    }
}

impl From<mdns_sd::Error> for TransferError {
    fn from(err: mdns_sd::Error) -> Self {
        TransferError::Discovery(err.to_string())
    }
}
