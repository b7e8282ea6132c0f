//! Recovery error types
//!
//! Error codes:
//! - MSGJ_RECOVERY_CORRUPT_LOG (FATAL)
//! - MSGJ_RECOVERY_FOREIGN_EXTENT (FATAL)
//! - MSGJ_RECOVERY_IO (FATAL)
//! - MSGJ_RECOVERY_STATE (FATAL)
//!
//! No partial result is ever returned alongside a recovery error.

use std::fmt;
use std::io;

use crate::format::FormatError;
use crate::journal::JournalError;

/// Severity levels for recovery errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The recovery attempt is abandoned
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryErrorCode {
    /// A record or header violates the log's structure
    CorruptLog,
    /// An extent belongs to another journal or queue
    ForeignExtent,
    /// Reading the journal directory or an extent failed
    Io,
    /// Recovery requested in a state that does not allow it
    State,
}

impl RecoveryErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryErrorCode::CorruptLog => "MSGJ_RECOVERY_CORRUPT_LOG",
            RecoveryErrorCode::ForeignExtent => "MSGJ_RECOVERY_FOREIGN_EXTENT",
            RecoveryErrorCode::Io => "MSGJ_RECOVERY_IO",
            RecoveryErrorCode::State => "MSGJ_RECOVERY_STATE",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Fatal
    }
}

impl fmt::Display for RecoveryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Recovery error with context
#[derive(Debug)]
pub struct RecoveryError {
    code: RecoveryErrorCode,
    message: String,
    /// Extent serial, when the failure is tied to one extent.
    extent: Option<u64>,
    /// Byte offset within that extent.
    offset: Option<u64>,
}

impl RecoveryError {
    /// Structural violation at a known position.
    pub fn corrupt_at(extent: u64, offset: u64, reason: impl Into<String>) -> Self {
        Self {
            code: RecoveryErrorCode::CorruptLog,
            message: format!(
                "extent {} offset {}: {}",
                extent,
                offset,
                reason.into()
            ),
            extent: Some(extent),
            offset: Some(offset),
        }
    }

    /// Structural violation not tied to a byte position.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self {
            code: RecoveryErrorCode::CorruptLog,
            message: reason.into(),
            extent: None,
            offset: None,
        }
    }

    pub fn foreign_extent(reason: impl Into<String>) -> Self {
        Self {
            code: RecoveryErrorCode::ForeignExtent,
            message: reason.into(),
            extent: None,
            offset: None,
        }
    }

    pub fn io(context: &str, err: impl fmt::Display) -> Self {
        Self {
            code: RecoveryErrorCode::Io,
            message: format!("{}: {}", context, err),
            extent: None,
            offset: None,
        }
    }

    pub fn state(reason: impl Into<String>) -> Self {
        Self {
            code: RecoveryErrorCode::State,
            message: reason.into(),
            extent: None,
            offset: None,
        }
    }

    pub fn code(&self) -> RecoveryErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn extent(&self) -> Option<u64> {
        self.extent
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// All recovery errors are fatal
    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for RecoveryError {}

impl From<io::Error> for RecoveryError {
    fn from(e: io::Error) -> Self {
        RecoveryError::io("journal I/O", e)
    }
}

impl From<FormatError> for RecoveryError {
    fn from(e: FormatError) -> Self {
        RecoveryError::corrupt(e.to_string())
    }
}

impl From<RecoveryError> for JournalError {
    fn from(e: RecoveryError) -> Self {
        match e.code {
            RecoveryErrorCode::CorruptLog | RecoveryErrorCode::ForeignExtent => {
                JournalError::CorruptLog(e.message)
            }
            RecoveryErrorCode::Io => JournalError::IoFailure(e.message),
            RecoveryErrorCode::State => JournalError::InvalidArgument(e.message),
        }
    }
}

/// Result type for recovery operations
pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RecoveryErrorCode::CorruptLog.code(),
            "MSGJ_RECOVERY_CORRUPT_LOG"
        );
        assert_eq!(
            RecoveryErrorCode::ForeignExtent.code(),
            "MSGJ_RECOVERY_FOREIGN_EXTENT"
        );
        assert_eq!(RecoveryErrorCode::Io.code(), "MSGJ_RECOVERY_IO");
        assert_eq!(RecoveryErrorCode::State.code(), "MSGJ_RECOVERY_STATE");
    }

    #[test]
    fn test_all_errors_are_fatal() {
        let codes = [
            RecoveryErrorCode::CorruptLog,
            RecoveryErrorCode::ForeignExtent,
            RecoveryErrorCode::Io,
            RecoveryErrorCode::State,
        ];
        for code in codes {
            assert_eq!(code.severity(), Severity::Fatal);
        }
    }

    #[test]
    fn test_error_display() {
        let err = RecoveryError::corrupt_at(3, 4224, "checksum mismatch");
        let display = format!("{}", err);
        assert!(display.contains("MSGJ_RECOVERY_CORRUPT_LOG"));
        assert!(display.contains("FATAL"));
        assert!(display.contains("offset 4224"));
        assert_eq!(err.extent(), Some(3));
    }

    #[test]
    fn test_conversion_to_journal_error() {
        let err: JournalError = RecoveryError::foreign_extent("queue 7 != 8").into();
        assert_eq!(err.code(), "MSGJ_CORRUPT_LOG");

        let err: JournalError = RecoveryError::io("read", "disk gone").into();
        assert_eq!(err.code(), "MSGJ_IO_FAILURE");
    }
}
