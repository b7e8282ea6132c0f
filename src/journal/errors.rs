//! Journal error types
//!
//! Error codes:
//! - MSGJ_BUSY (retryable)
//! - MSGJ_CLOSED, MSGJ_NOT_READY
//! - MSGJ_UNKNOWN_RECORD, MSGJ_ALREADY_RESOLVED, MSGJ_INVALID_ARGUMENT (caller errors)
//! - MSGJ_IO_FAILURE, MSGJ_CORRUPT_LOG (fatal)
//! - MSGJ_CONFIG

use std::io;

use thiserror::Error;

use crate::format::FormatError;

/// Errors returned synchronously by journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Write cache has no room; retry once completions free pages.
    #[error("write cache full")]
    Busy,

    #[error("journal is stopping or stopped")]
    Closed,

    /// Not initialized, or still recovering.
    #[error("journal not ready: {0}")]
    NotReady(&'static str),

    #[error("unknown record {rid}")]
    UnknownRecord { rid: u64 },

    #[error("transaction {xid} already resolved")]
    AlreadyResolved { xid: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage reported a failure. The journal accepts no further writes.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("corrupt journal: {0}")]
    CorruptLog(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl JournalError {
    pub fn code(&self) -> &'static str {
        match self {
            JournalError::Busy => "MSGJ_BUSY",
            JournalError::Closed => "MSGJ_CLOSED",
            JournalError::NotReady(_) => "MSGJ_NOT_READY",
            JournalError::UnknownRecord { .. } => "MSGJ_UNKNOWN_RECORD",
            JournalError::AlreadyResolved { .. } => "MSGJ_ALREADY_RESOLVED",
            JournalError::InvalidArgument(_) => "MSGJ_INVALID_ARGUMENT",
            JournalError::IoFailure(_) => "MSGJ_IO_FAILURE",
            JournalError::CorruptLog(_) => "MSGJ_CORRUPT_LOG",
            JournalError::Config(_) => "MSGJ_CONFIG",
        }
    }

    /// Only backpressure is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JournalError::Busy)
    }

    /// The journal instance cannot be used for writes any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JournalError::IoFailure(_) | JournalError::CorruptLog(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        JournalError::InvalidArgument(msg.into())
    }

    pub(crate) fn already_resolved(xid: &[u8]) -> Self {
        JournalError::AlreadyResolved {
            xid: display_xid(xid),
        }
    }
}

impl From<io::Error> for JournalError {
    fn from(e: io::Error) -> Self {
        JournalError::IoFailure(e.to_string())
    }
}

impl From<FormatError> for JournalError {
    fn from(e: FormatError) -> Self {
        JournalError::CorruptLog(e.to_string())
    }
}

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;

/// Renders an xid for messages: UTF-8 when printable, hex otherwise.
pub fn display_xid(xid: &[u8]) -> String {
    match std::str::from_utf8(xid) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => xid.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(JournalError::Busy.code(), "MSGJ_BUSY");
        assert_eq!(JournalError::Closed.code(), "MSGJ_CLOSED");
        assert_eq!(
            JournalError::UnknownRecord { rid: 1 }.code(),
            "MSGJ_UNKNOWN_RECORD"
        );
        assert_eq!(
            JournalError::CorruptLog("x".into()).code(),
            "MSGJ_CORRUPT_LOG"
        );
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(JournalError::Busy.is_retryable());
        assert!(!JournalError::Closed.is_retryable());
        assert!(!JournalError::IoFailure("disk".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(JournalError::IoFailure("disk".into()).is_fatal());
        assert!(JournalError::CorruptLog("bad".into()).is_fatal());
        assert!(!JournalError::Busy.is_fatal());
        assert!(!JournalError::already_resolved(b"t1").is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: JournalError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, JournalError::IoFailure(ref m) if m.contains("disk gone")));
    }

    #[test]
    fn test_display_xid() {
        assert_eq!(display_xid(b"txn-1"), "txn-1");
        assert_eq!(display_xid(&[0x00, 0xff]), "00ff");
    }
}
