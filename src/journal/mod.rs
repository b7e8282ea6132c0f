//! The journal engine
//!
//! A [`Journal`] is a write-ahead log for one broker queue. It accepts
//! enqueue, dequeue and transaction-boundary records, stages them in a
//! bounded write cache, and hands full (or flushed) pages to a storage worker.
//! Callers learn about durability through their [`DataToken`]s.
//!
//! # Write path
//!
//! 1. A submission is checked against the engine phase and the cache
//! 2. The record is encoded into the current extent's next slot
//! 3. Full pages are submitted; the inactivity timer bounds how long a
//!    partial page may wait
//! 4. Completions are drained by the get-events timer, an explicit
//!    [`Journal::get_events`] call, or a blocking [`QueueStore::flush`]
//! 5. Durable records settle their tokens and release extent references;
//!    fully dead extents go back to the space provider, oldest first
//!
//! # Invariants
//!
//! - Records reach storage in submission order
//! - A transaction's boundary record follows all of its members
//! - An extent is never returned while it holds a live message or a record
//!   of an unresolved transaction
//! - After a write failure the journal accepts no further writes

mod engine;
mod errors;
mod management;
mod rcache;
mod recover;
mod token;
mod txn;
mod wcache;

pub use engine::{DeleteCallback, Journal, JournalBuilder, JournalStats};
pub use errors::{display_xid, JournalError, JournalResult};
pub use management::{Manageable, ManagementStatus, METHOD_FLUSH, METHOD_QUERY_STATS};
pub use token::{DataToken, TokenState};
pub use txn::{Outcome, RESOLVED_HISTORY};

use std::fmt;

use serde::Serialize;

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoResult {
    Ok,
    /// A write has failed since the journal was opened.
    Failed,
}

/// Engine lifecycle.
///
/// ```text
/// Uninitialized -> Recovering -> Ready -> Stopping -> Stopped
///        \______________________/^
///              initialize
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Uninitialized,
    Recovering,
    Ready,
    Stopping,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Recovering => "recovering",
            Phase::Ready => "ready",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable store operations used by a queue.
///
/// Every submission returns once the record is staged; durability is
/// reported through the token. `total_len` is the full payload length of the
/// message. A payload may be submitted in several chunks by calling
/// [`enqueue_data_record`](Self::enqueue_data_record) repeatedly with the same
/// token until `total_len` bytes have been given.
pub trait QueueStore {
    fn enqueue_data_record(
        &self,
        data: &[u8],
        total_len: u64,
        token: &DataToken,
        transient: bool,
    ) -> JournalResult<()>;

    /// Records a message whose payload is stored elsewhere.
    fn enqueue_extern_data_record(
        &self,
        total_len: u64,
        token: &DataToken,
        transient: bool,
    ) -> JournalResult<()>;

    fn enqueue_txn_data_record(
        &self,
        data: &[u8],
        total_len: u64,
        token: &DataToken,
        xid: &[u8],
        transient: bool,
    ) -> JournalResult<()>;

    fn enqueue_extern_txn_data_record(
        &self,
        total_len: u64,
        token: &DataToken,
        xid: &[u8],
        transient: bool,
    ) -> JournalResult<()>;

    /// Consumes the message enqueued with `token`.
    fn dequeue_data_record(&self, token: &DataToken, txn_coml_commit: bool) -> JournalResult<()>;

    /// Consumes the message under `xid`; it stays live until the commit.
    fn dequeue_txn_data_record(
        &self,
        token: &DataToken,
        xid: &[u8],
        txn_coml_commit: bool,
    ) -> JournalResult<()>;

    fn txn_abort(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()>;

    fn txn_commit(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()>;

    /// First phase of a two-phase commit.
    fn txn_prepare(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()>;

    /// Submits buffered records; with `block`, waits until every write
    /// submitted so far has completed.
    fn flush(&self, block: bool) -> IoResult;

    /// Terminal. Refuses new work and flushes.
    fn stop(&self, block: bool);
}
