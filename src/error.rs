//! Transfer error types

use thiserror::Error;

use crate::backend::Capability;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Authentication lost: {0}")]
    AuthenticationLost(String),

    #[error("Operation not supported by backend: {0:?}")]
    UnsupportedCapability(Capability),

    #[error("Unresolved conflict: {0}")]
    UnresolvedConflict(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransferError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only transport hiccups qualify; everything else is reported as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Timeout(_) | TransferError::ConnectionReset(_) => true,
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the session is unusable after this error.
    ///
    /// A fatal error halts a batch even when the caller asked to continue
    /// on errors.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectionLost(_) | TransferError::AuthenticationLost(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Map a local I/O error, keeping the path for not-found / denied cases.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                TransferError::PermissionDenied(path.to_string())
            }
            _ => TransferError::Io(err),
        }
    }
}

// io::Error is not Clone; keep its kind and message
impl Clone for TransferError {
    fn clone(&self) -> Self {
        match self {
            TransferError::NotFound(s) => TransferError::NotFound(s.clone()),
            TransferError::PermissionDenied(s) => TransferError::PermissionDenied(s.clone()),
            TransferError::Protocol(s) => TransferError::Protocol(s.clone()),
            TransferError::Timeout(s) => TransferError::Timeout(s.clone()),
            TransferError::ConnectionReset(s) => TransferError::ConnectionReset(s.clone()),
            TransferError::ConnectionLost(s) => TransferError::ConnectionLost(s.clone()),
            TransferError::AuthenticationLost(s) => TransferError::AuthenticationLost(s.clone()),
            TransferError::UnsupportedCapability(c) => TransferError::UnsupportedCapability(*c),
            TransferError::UnresolvedConflict(s) => TransferError::UnresolvedConflict(s.clone()),
            TransferError::Cancelled => TransferError::Cancelled,
            TransferError::NotAFile(s) => TransferError::NotAFile(s.clone()),
            TransferError::Io(e) => TransferError::Io(std::io::Error::new(e.kind(), e.to_string())),
            TransferError::Storage(s) => TransferError::Storage(s.clone()),
            TransferError::Config(s) => TransferError::Config(s.clone()),
        }
    }
}

impl From<rmp_serde::encode::Error> for TransferError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TransferError::Storage(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransferError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TransferError::Storage(err.to_string())
    }
}

// Observers receive errors as plain strings
impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
