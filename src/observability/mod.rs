//! Observability for the journal
//!
//! - Lifecycle events, emitted through `tracing`
//! - Lock-free operational counters
//! - The optional outstanding-I/O instrumentation seam
//!
//! Observability never changes journal behavior.

mod events;
mod metrics;

pub use events::JournalEvent;
pub use metrics::{InstrumentationSink, JournalMetrics, MetricsSnapshot, NoopInstrumentation};

use tracing::{debug, error, info};

/// Logs a lifecycle event for `journal`.
pub fn log_event(journal: &str, event: JournalEvent) {
    if event.is_fatal() {
        error!(journal = %journal, event = event.as_str(), "journal event");
    } else if event.is_chatty() {
        debug!(journal = %journal, event = event.as_str(), "journal event");
    } else {
        info!(journal = %journal, event = event.as_str(), "journal event");
    }
}

/// Logs a lifecycle event with extra key/value detail.
pub fn log_event_with_fields(journal: &str, event: JournalEvent, fields: &[(&str, &str)]) {
    let detail = fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ");
    if event.is_fatal() {
        error!(journal = %journal, event = event.as_str(), %detail, "journal event");
    } else if event.is_chatty() {
        debug!(journal = %journal, event = event.as_str(), %detail, "journal event");
    } else {
        info!(journal = %journal, event = event.as_str(), %detail, "journal event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        // Verifies no panic without a subscriber installed.
        log_event("q1", JournalEvent::Initialized);
        log_event("q1", JournalEvent::RecoveryFailed);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields("q1", JournalEvent::ExtentAcquired, &[("serial", "4")]);
    }
}
