//! Crash point injection for durability testing
//!
//! Setting `MSGJOURNAL_CRASH_POINT=<name>` makes the process abort the moment
//! execution reaches the named point: no cleanup, no unwinding, no flushing of
//! the write cache. This reproduces a power cut at a precise step of the
//! write or recovery path.
//!
//! ```bash
//! MSGJOURNAL_CRASH_POINT=aio_after_page_sync ./broker
//! ```

use std::sync::OnceLock;

use tracing::error;

/// Environment variable naming the active crash point.
pub const CRASH_POINT_ENV: &str = "MSGJOURNAL_CRASH_POINT";

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var(CRASH_POINT_ENV).ok())
        .as_deref()
}

/// Returns true if the configured crash point equals `name`.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Aborts the process if `name` is the configured crash point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        error!(point = name, "triggering crash");
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Storage worker
    pub const AIO_BEFORE_PAGE_WRITE: &str = "aio_before_page_write";
    pub const AIO_AFTER_PAGE_WRITE: &str = "aio_after_page_write";
    pub const AIO_AFTER_PAGE_SYNC: &str = "aio_after_page_sync";

    // Extent lifecycle
    pub const EXTENT_AFTER_HEADER: &str = "extent_after_header";
    pub const EXTENT_BEFORE_RELEASE: &str = "extent_before_release";

    // Recovery
    pub const RECOVERY_AFTER_SCAN: &str = "recovery_after_scan";

    pub fn all() -> &'static [&'static str] {
        &[
            AIO_BEFORE_PAGE_WRITE,
            AIO_AFTER_PAGE_WRITE,
            AIO_AFTER_PAGE_SYNC,
            EXTENT_AFTER_HEADER,
            EXTENT_BEFORE_RELEASE,
            RECOVERY_AFTER_SCAN,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_point_disabled_by_default() {
        assert!(!crash_point_enabled("test_point"));
        // Must return without aborting.
        maybe_crash("test_point");
    }

    #[test]
    fn test_crash_point_names_are_lowercase_with_underscores() {
        for point in points::all() {
            assert!(
                point.chars().all(|c| c.is_lowercase() || c == '_'),
                "crash point '{}' should be lowercase with underscores",
                point
            );
        }
    }

    #[test]
    fn test_crash_point_names_unique() {
        let all = points::all();
        let mut sorted = all.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len());
    }
}
