//! Journal recovery
//!
//! Rebuilds durable state from the extents left in a journal directory.
//!
//! # Sequence
//!
//! 1. Read every extent header; zeroed headers are unused extents
//! 2. Order extents by serial
//! 3. Stream each extent's data area through the read pages
//! 4. Scan records until the first empty or stale slot
//! 5. Replay records in log order
//! 6. Hand live messages, in-doubt transactions and the highest rid to the
//!    caller
//!
//! A torn record ends the log when it sits in the newest extent. Anywhere
//! else it is corruption, and recovery fails without a partial result.
//! The driver that performs the reads lives with the journal engine, which
//! owns the storage worker and read pages.

mod errors;
mod replay;
mod scan;

pub use errors::{RecoveryError, RecoveryErrorCode, RecoveryResult, Severity};
pub use replay::ReplayStats;

pub(crate) use replay::Replayer;
pub(crate) use scan::{ExtentScanner, Scan};

use serde::Serialize;

use crate::journal::DataToken;

/// A message recovered from the log.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredMessage {
    pub rid: u64,
    /// Declared payload length; for external messages the bytes live
    /// elsewhere and `data` is empty.
    pub data_len: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub external: bool,
    /// Owning transaction, for enqueues of an in-doubt transaction.
    #[serde(serialize_with = "serialize_xid")]
    pub xid: Option<Vec<u8>>,
    /// Durable token to dequeue this message with.
    #[serde(skip)]
    pub token: DataToken,
    #[serde(skip)]
    pub(crate) extent_serial: u64,
}

/// A dequeue performed by an in-doubt transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredDequeue {
    /// Record id of the dequeue itself.
    pub rid: u64,
    /// Record id of the message it consumes.
    pub deq_rid: u64,
    pub txn_coml_commit: bool,
    #[serde(skip)]
    pub(crate) extent_serial: u64,
}

/// A transaction with no durable commit or abort.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedTransaction {
    #[serde(serialize_with = "serialize_xid_bytes")]
    pub xid: Vec<u8>,
    /// A prepare record was written (two-phase commit).
    pub prepared: bool,
    pub enqueues: Vec<RecoveredMessage>,
    pub dequeues: Vec<RecoveredDequeue>,
    #[serde(skip)]
    pub(crate) first_rid: u64,
    #[serde(skip)]
    pub(crate) prepare_serials: Vec<u64>,
}

/// Everything recovery hands back.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveredJournal {
    /// Live messages in enqueue order.
    pub messages: Vec<RecoveredMessage>,
    /// In-doubt transactions, in the order they first appear in the log.
    pub prepared_txns: Vec<PreparedTransaction>,
    /// Highest record id seen; new records are numbered above it.
    pub highest_rid: u64,
    pub stats: ReplayStats,
}

fn serialize_xid<S: serde::Serializer>(xid: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match xid {
        Some(xid) => s.serialize_some(&crate::journal::display_xid(xid)),
        None => s.serialize_none(),
    }
}

fn serialize_xid_bytes<S: serde::Serializer>(xid: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&crate::journal::display_xid(xid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovered_journal_serializes_readably() {
        let journal = RecoveredJournal {
            messages: vec![RecoveredMessage {
                rid: 4,
                data_len: 3,
                data: b"abc".to_vec(),
                external: false,
                xid: None,
                token: DataToken::recovered(4, None, false),
                extent_serial: 1,
            }],
            prepared_txns: vec![PreparedTransaction {
                xid: b"t1".to_vec(),
                prepared: true,
                enqueues: Vec::new(),
                dequeues: vec![RecoveredDequeue {
                    rid: 6,
                    deq_rid: 4,
                    txn_coml_commit: false,
                    extent_serial: 1,
                }],
                first_rid: 6,
                prepare_serials: vec![1],
            }],
            highest_rid: 7,
            stats: ReplayStats::default(),
        };

        let json = serde_json::to_value(&journal).unwrap();
        assert_eq!(json["highest_rid"], 7);
        assert_eq!(json["messages"][0]["rid"], 4);
        assert!(json["messages"][0]["xid"].is_null());
        assert_eq!(json["prepared_txns"][0]["xid"], "t1");
        assert_eq!(json["prepared_txns"][0]["dequeues"][0]["deq_rid"], 4);
        assert!(json["prepared_txns"][0].get("prepare_serials").is_none());
    }
}
