//! Error taxonomy shared by the server, the client and the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for filesync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error kind carried across the wire in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    EmptyName,
    HashMismatch,
    NotEmpty,
    AlreadyExists,
    InvalidPath,
    RootProtected,
    Disconnected,
    Protocol,
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::EmptyName => "empty name",
            ErrorKind::HashMismatch => "hash mismatch",
            ErrorKind::NotEmpty => "not empty",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::RootProtected => "root protected",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Storage => "storage failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("filename cannot be empty")]
    EmptyName,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("folder not empty: {0}")]
    NotEmpty(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot remove root folder")]
    RootProtected,

    #[error("stream ended before transfer completed: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::EmptyName => ErrorKind::EmptyName,
            SyncError::HashMismatch { .. } => ErrorKind::HashMismatch,
            SyncError::NotEmpty(_) => ErrorKind::NotEmpty,
            SyncError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SyncError::InvalidPath(_) => ErrorKind::InvalidPath,
            SyncError::RootProtected => ErrorKind::RootProtected,
            SyncError::Disconnected(_) | SyncError::Timeout(_) => ErrorKind::Disconnected,
            SyncError::Protocol(_) | SyncError::Codec(_) => ErrorKind::Protocol,
            SyncError::Database(_) | SyncError::Io(_) | SyncError::Config(_) => {
                ErrorKind::Storage
            }
            SyncError::Remote { kind, .. } => *kind,
        }
    }

    /// Map an unexpected EOF from the transport onto `Disconnected`.
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::Disconnected("connection closed mid-frame".to_string())
        } else {
            SyncError::Io(err)
        }
    }
}

/// Error payload of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for WireError {
    fn from(err: &SyncError) -> Self {
        let message = match err {
            SyncError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        WireError {
            kind: err.kind(),
            message,
        }
    }
}

impl From<WireError> for SyncError {
    fn from(err: WireError) -> Self {
        SyncError::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_share_a_kind() {
        let io = SyncError::Io(std::io::Error::other("disk on fire"));
        assert_eq!(io.kind(), ErrorKind::Storage);
        assert_eq!(SyncError::Config("bad".into()).kind(), ErrorKind::Storage);
        assert_eq!(SyncError::Timeout(10).kind(), ErrorKind::Disconnected);
    }

    #[test]
    fn wire_error_keeps_kind_and_message() {
        let err = SyncError::HashMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let wire = WireError::from(&err);
        assert_eq!(wire.kind, ErrorKind::HashMismatch);
        assert!(wire.message.contains("expected aa"));

        let back = SyncError::from(wire);
        assert_eq!(back.kind(), ErrorKind::HashMismatch);
        assert!(back.to_string().contains("expected aa, got bb"));
    }

    #[test]
    fn unexpected_eof_is_a_disconnect() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(SyncError::from_read(eof).kind(), ErrorKind::Disconnected);
        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(SyncError::from_read(other).kind(), ErrorKind::Storage);
    }
}
