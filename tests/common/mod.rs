//! Shared helpers for journal integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use msgjournal::config::JournalConfig;
use msgjournal::extent::FilePool;
use msgjournal::journal::{DataToken, Journal, QueueStore};
use msgjournal::recovery::RecoveredJournal;
use msgjournal::timer::{TimerService, TimerTask};

pub const JOURNAL_ID: &str = "itest";

/// Small geometry so tests cross extent and page boundaries quickly.
pub fn small_config(root: &Path) -> JournalConfig {
    let mut config = JournalConfig::new(JOURNAL_ID, root.join("journal"));
    config.extent_sblks = 8;
    config.wcache_pages = 4;
    config.wcache_page_sblks = 1;
    config.flush_timeout_ms = 50;
    config.get_events_timeout_ms = 5;
    config
}

pub fn pool_for(config: &JournalConfig) -> Arc<FilePool> {
    Arc::new(FilePool::open(config.pool_path(), config.extent_size()).expect("open pool"))
}

pub fn fresh_journal(config: &JournalConfig) -> (Journal, Arc<FilePool>) {
    let pool = pool_for(config);
    let journal = Journal::new(config.clone()).expect("build journal");
    journal
        .initialize(pool.clone(), config.wcache_pages, config.wcache_page_sblks)
        .expect("initialize");
    (journal, pool)
}

/// Recovers the journal in `config.directory` without completing recovery.
pub fn recover(config: &JournalConfig) -> (Journal, RecoveredJournal) {
    let pool = pool_for(config);
    let journal = Journal::new(config.clone()).expect("build journal");
    let recovered = journal
        .recover(pool, config.wcache_pages, config.wcache_page_sblks, config.queue_id)
        .expect("recover");
    (journal, recovered)
}

/// Abandons a journal as a crash would: nothing more is flushed and no
/// teardown runs. Only bytes already written survive.
pub fn crash(journal: Journal) {
    std::mem::forget(journal);
}

pub fn enqueue(journal: &Journal, payload: &[u8]) -> DataToken {
    let token = DataToken::new();
    journal
        .enqueue_data_record(payload, payload.len() as u64, &token, false)
        .expect("enqueue");
    token
}

pub fn enqueue_txn(journal: &Journal, payload: &[u8], xid: &[u8]) -> DataToken {
    let token = DataToken::new();
    journal
        .enqueue_txn_data_record(payload, payload.len() as u64, &token, xid, false)
        .expect("txn enqueue");
    token
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Timer service that only fires when told to.
#[derive(Default)]
pub struct ManualTimer {
    tasks: Mutex<Vec<Arc<dyn TimerTask>>>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Fires every task scheduled so far. Tasks scheduled by a fire wait for
    /// the next call.
    pub fn fire_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let count = tasks.len();
        for task in tasks {
            task.fire();
        }
        count
    }
}

impl TimerService for ManualTimer {
    fn add(&self, task: Arc<dyn TimerTask>, _delay: Duration) {
        self.tasks.lock().unwrap().push(task);
    }
}
