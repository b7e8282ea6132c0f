//! Journal lifecycle events
//!
//! Events are explicit and typed. Each one is emitted as a single `tracing`
//! line whose `event` field carries the stable name below.

use std::fmt;

/// Observable events in a journal's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    // Lifecycle
    /// Fresh journal initialized
    Initialized,
    /// Journal ready for writes after recovery
    Ready,
    /// Stop requested
    StopStart,
    /// Stop complete, storage worker joined
    Stopped,

    // Write path
    /// Write cache page handed to storage
    PageSubmitted,
    /// Flush requested by the inactivity timer
    InactivityFlush,
    /// Write cache full, submission refused
    CacheFull,
    /// A page write failed; journal no longer accepts writes
    WriteFailed,

    // Space
    /// Extent taken from the space provider
    ExtentAcquired,
    /// Fully consumed extent handed back
    ExtentReleased,

    // Recovery
    /// Recovery started
    RecoveryStart,
    /// Extent scan complete
    RecoveryScanComplete,
    /// Recovery finished, results handed to caller
    RecoveryComplete,
    /// Recovery failed (FATAL)
    RecoveryFailed,
}

impl JournalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalEvent::Initialized => "JOURNAL_INITIALIZED",
            JournalEvent::Ready => "JOURNAL_READY",
            JournalEvent::StopStart => "JOURNAL_STOP_BEGIN",
            JournalEvent::Stopped => "JOURNAL_STOPPED",

            JournalEvent::PageSubmitted => "PAGE_SUBMITTED",
            JournalEvent::InactivityFlush => "INACTIVITY_FLUSH",
            JournalEvent::CacheFull => "WRITE_CACHE_FULL",
            JournalEvent::WriteFailed => "PAGE_WRITE_FAILED",

            JournalEvent::ExtentAcquired => "EXTENT_ACQUIRED",
            JournalEvent::ExtentReleased => "EXTENT_RELEASED",

            JournalEvent::RecoveryStart => "RECOVERY_BEGIN",
            JournalEvent::RecoveryScanComplete => "RECOVERY_SCAN_COMPLETE",
            JournalEvent::RecoveryComplete => "RECOVERY_COMPLETE",
            JournalEvent::RecoveryFailed => "RECOVERY_FAILED",
        }
    }

    /// Events after which the journal cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JournalEvent::WriteFailed | JournalEvent::RecoveryFailed)
    }

    /// High-frequency events logged at debug level.
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            JournalEvent::PageSubmitted | JournalEvent::InactivityFlush | JournalEvent::CacheFull
        )
    }
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JournalEvent; 14] = [
        JournalEvent::Initialized,
        JournalEvent::Ready,
        JournalEvent::StopStart,
        JournalEvent::Stopped,
        JournalEvent::PageSubmitted,
        JournalEvent::InactivityFlush,
        JournalEvent::CacheFull,
        JournalEvent::WriteFailed,
        JournalEvent::ExtentAcquired,
        JournalEvent::ExtentReleased,
        JournalEvent::RecoveryStart,
        JournalEvent::RecoveryScanComplete,
        JournalEvent::RecoveryComplete,
        JournalEvent::RecoveryFailed,
    ];

    #[test]
    fn test_all_events_have_string_representation() {
        for event in ALL {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(JournalEvent::WriteFailed.is_fatal());
        assert!(JournalEvent::RecoveryFailed.is_fatal());
        assert!(!JournalEvent::Ready.is_fatal());
        assert!(!JournalEvent::ExtentReleased.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", JournalEvent::Ready), "JOURNAL_READY");
        assert_eq!(
            format!("{}", JournalEvent::RecoveryScanComplete),
            "RECOVERY_SCAN_COMPLETE"
        );
    }
}
