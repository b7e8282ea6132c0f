//! Journal configuration
//!
//! Loaded from a JSON file. Every field except `journal_id` and `directory`
//! has a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::format::{ExtentHeader, SBLK_SIZE};
use crate::journal::{JournalError, JournalResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Identity stamped into every extent header.
    pub journal_id: String,

    /// Directory holding the journal's extent files.
    pub directory: PathBuf,

    /// Queue this journal belongs to (default: 0)
    #[serde(default)]
    pub queue_id: u64,

    /// Quiet period before buffered writes are flushed (default: 500ms)
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Completion polling interval while I/O is outstanding (default: 10ms)
    #[serde(default = "default_get_events_timeout_ms")]
    pub get_events_timeout_ms: u64,

    /// Number of write cache pages (default: 32)
    #[serde(default = "default_wcache_pages")]
    pub wcache_pages: u16,

    /// Write cache page size in sblks (default: 4)
    #[serde(default = "default_wcache_page_sblks")]
    pub wcache_page_sblks: u32,

    /// Extent file size in sblks, header included (default: 512)
    #[serde(default = "default_extent_sblks")]
    pub extent_sblks: u32,

    /// Directory of the shared extent pool (default: `<directory>/pool`)
    #[serde(default)]
    pub pool_directory: Option<PathBuf>,
}

fn default_flush_timeout_ms() -> u64 {
    500
}
fn default_get_events_timeout_ms() -> u64 {
    10
}
fn default_wcache_pages() -> u16 {
    32
}
fn default_wcache_page_sblks() -> u32 {
    4
}
fn default_extent_sblks() -> u32 {
    512
}

impl JournalConfig {
    pub fn new(journal_id: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            journal_id: journal_id.into(),
            directory: directory.into(),
            queue_id: 0,
            flush_timeout_ms: default_flush_timeout_ms(),
            get_events_timeout_ms: default_get_events_timeout_ms(),
            wcache_pages: default_wcache_pages(),
            wcache_page_sblks: default_wcache_page_sblks(),
            extent_sblks: default_extent_sblks(),
            pool_directory: None,
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> JournalResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| JournalError::Config(format!("failed to read config: {}", e)))?;

        let config: JournalConfig = serde_json::from_str(&content)
            .map_err(|e| JournalError::Config(format!("invalid config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> JournalResult<()> {
        if self.journal_id.is_empty() {
            return Err(JournalError::Config("journal_id must not be empty".into()));
        }
        if self.journal_id.len() > ExtentHeader::MAX_JOURNAL_ID_LEN {
            return Err(JournalError::Config(format!(
                "journal_id longer than {} bytes",
                ExtentHeader::MAX_JOURNAL_ID_LEN
            )));
        }
        if self.flush_timeout_ms == 0 || self.get_events_timeout_ms == 0 {
            return Err(JournalError::Config("timer intervals must be > 0".into()));
        }
        if self.wcache_pages == 0 || self.wcache_page_sblks == 0 {
            return Err(JournalError::Config("write cache must have pages of > 0 sblks".into()));
        }
        // One sblk holds the header; the rest must fit at least one cache page.
        if self.extent_sblks <= self.wcache_page_sblks {
            return Err(JournalError::Config(format!(
                "extent_sblks ({}) must exceed wcache_page_sblks ({})",
                self.extent_sblks, self.wcache_page_sblks
            )));
        }
        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn get_events_timeout(&self) -> Duration {
        Duration::from_millis(self.get_events_timeout_ms)
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_sblks as u64 * SBLK_SIZE as u64
    }

    pub fn pool_path(&self) -> PathBuf {
        self.pool_directory
            .clone()
            .unwrap_or_else(|| self.directory.join("pool"))
    }
}
