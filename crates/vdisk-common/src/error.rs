//! Error types for the VDisk skeleton
//!
//! Client protocol failures are not Rust errors: they travel back to the
//! requester as replies carrying a [`ReplyStatus`]. This type covers the
//! failures of the machinery around them (recovery log I/O, encoding,
//! configuration, messages arriving in the wrong state) and maps onto a
//! status when one of them has to be reported to a client.

use crate::types::ReplyStatus;
use thiserror::Error;

/// Common result type for VDisk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for VDisk operations
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("storage error: {0}")]
    Storage(String),

    // Protocol errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} is not accepted in state {state}")]
    UnexpectedMessage { kind: String, state: String },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::UnexpectedMessage { .. })
    }

    /// Status reported to a client when this error ends its request
    #[must_use]
    pub const fn reply_status(&self) -> ReplyStatus {
        match self {
            Self::InvalidRequest(_) => ReplyStatus::Error,
            Self::UnexpectedMessage { .. } => ReplyStatus::NotReady,
            Self::DiskIo(_)
            | Self::ChecksumMismatch { .. }
            | Self::Storage(_)
            | Self::Internal(_)
            | Self::Configuration(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => ReplyStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::UnexpectedMessage {
            kind: "Put".into(),
            state: "SyncGuidRecovery".into(),
        };
        assert!(err.is_retryable());
        assert!(!Error::invalid_request("bad").is_retryable());
        assert!(!Error::storage("torn").is_retryable());
    }

    #[test]
    fn test_error_reply_status() {
        assert_eq!(Error::invalid_request("bad").reply_status(), ReplyStatus::Error);
        assert_eq!(
            Error::UnexpectedMessage {
                kind: "Put".into(),
                state: "LocalRecovery".into()
            }
            .reply_status(),
            ReplyStatus::NotReady
        );
        assert_eq!(Error::storage("torn").reply_status(), ReplyStatus::Error);
    }

    #[test]
    fn test_error_display() {
        let err = Error::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 1,
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected 0xdeadbeef, got 0x00000001");
        let err = Error::UnexpectedMessage {
            kind: "Put".into(),
            state: "LocalRecovery".into(),
        };
        assert_eq!(err.to_string(), "Put is not accepted in state LocalRecovery");
    }
}
