//! Replay of scanned records into recovered state
//!
//! Records are applied strictly in log order:
//! - non-transactional enqueues become live messages, transient ones are
//!   dropped (their rids are remembered so a later dequeue is not an error)
//! - a non-transactional dequeue removes its target; a target that is neither
//!   live nor accounted for is corruption
//! - transactional records accumulate under their xid until a commit (apply
//!   in order) or abort (discard)
//! - whatever is still open at the end of the log is in doubt

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::format::RecordType;
use crate::journal::DataToken;

use super::errors::{RecoveryError, RecoveryResult};
use super::scan::ScannedRecord;
use super::{PreparedTransaction, RecoveredDequeue, RecoveredJournal, RecoveredMessage};

/// Statistics from replay
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReplayStats {
    pub extents_scanned: u64,
    pub records_replayed: u64,
    pub enqueues: u64,
    pub dequeues: u64,
    pub commits: u64,
    pub aborts: u64,
    pub prepares: u64,
    /// Transient enqueues dropped.
    pub transient_dropped: u64,
    /// Commit/abort records whose transaction left no surviving records.
    pub orphan_boundaries: u64,
}

#[derive(Debug, Default)]
struct OpenTxn {
    /// Log position of the first record, for stable output order.
    first_rid: u64,
    prepared: bool,
    prepare_serials: Vec<u64>,
    enqueues: Vec<RecoveredMessage>,
    dequeues: Vec<RecoveredDequeue>,
}

/// Applies records one at a time.
pub(crate) struct Replayer {
    /// First rid of the oldest surviving extent.
    floor: u64,
    live: BTreeMap<u64, RecoveredMessage>,
    dropped: HashSet<u64>,
    open: HashMap<Vec<u8>, OpenTxn>,
    last_rid: Option<u64>,
    stats: ReplayStats,
}

impl Replayer {
    pub fn new(floor: u64) -> Self {
        Self {
            floor,
            live: BTreeMap::new(),
            dropped: HashSet::new(),
            open: HashMap::new(),
            last_rid: None,
            stats: ReplayStats::default(),
        }
    }

    pub fn extent_scanned(&mut self) {
        self.stats.extents_scanned += 1;
    }

    /// Applies one verified record found in extent `serial`.
    pub fn apply(&mut self, serial: u64, record: ScannedRecord) -> RecoveryResult<()> {
        let rid = record.header.rid;
        if let Some(last) = self.last_rid {
            if rid <= last {
                return Err(RecoveryError::corrupt_at(
                    serial,
                    record.offset,
                    format!("record id {} does not follow {}", rid, last),
                ));
            }
        }
        self.last_rid = Some(rid);
        self.stats.records_replayed += 1;

        match record.header.record_type {
            RecordType::Enqueue => self.apply_enqueue(serial, record),
            RecordType::Dequeue => self.apply_dequeue(serial, record),
            RecordType::TxnPrepare => {
                self.stats.prepares += 1;
                let txn = self.txn(&record.xid, rid);
                txn.prepared = true;
                txn.prepare_serials.push(serial);
                Ok(())
            }
            RecordType::TxnCommit => {
                self.stats.commits += 1;
                match self.open.remove(&record.xid) {
                    Some(txn) => self.commit(txn),
                    None => self.stats.orphan_boundaries += 1,
                }
                Ok(())
            }
            RecordType::TxnAbort => {
                self.stats.aborts += 1;
                if self.open.remove(&record.xid).is_none() {
                    self.stats.orphan_boundaries += 1;
                }
                Ok(())
            }
        }
    }

    fn apply_enqueue(&mut self, serial: u64, record: ScannedRecord) -> RecoveryResult<()> {
        self.stats.enqueues += 1;
        let header = record.header;
        if header.is_transient() {
            self.stats.transient_dropped += 1;
            self.dropped.insert(header.rid);
            return Ok(());
        }

        let xid = if record.xid.is_empty() {
            None
        } else {
            Some(record.xid)
        };
        let message = RecoveredMessage {
            rid: header.rid,
            data_len: header.data_len,
            data: record.data,
            external: header.is_external(),
            xid: xid.clone(),
            token: DataToken::recovered(header.rid, xid.clone(), header.is_external()),
            extent_serial: serial,
        };
        match xid {
            Some(xid) => self.txn(&xid, header.rid).enqueues.push(message),
            None => {
                self.live.insert(header.rid, message);
            }
        }
        Ok(())
    }

    fn apply_dequeue(&mut self, serial: u64, record: ScannedRecord) -> RecoveryResult<()> {
        self.stats.dequeues += 1;
        let header = record.header;
        let target = header.deq_rid;

        if !self.live.contains_key(&target) && !self.accounted_for(target) {
            return Err(RecoveryError::corrupt_at(
                serial,
                record.offset,
                format!("dequeue {} of unknown record {}", header.rid, target),
            ));
        }

        if record.xid.is_empty() {
            self.live.remove(&target);
            return Ok(());
        }
        let dequeue = RecoveredDequeue {
            rid: header.rid,
            deq_rid: target,
            txn_coml_commit: header.txn_coml_commit(),
            extent_serial: serial,
        };
        self.txn(&record.xid, header.rid).dequeues.push(dequeue);
        Ok(())
    }

    /// An enqueue that is gone for a known reason: transient, or in an
    /// extent already handed back.
    fn accounted_for(&self, rid: u64) -> bool {
        rid < self.floor || self.dropped.contains(&rid)
    }

    fn txn(&mut self, xid: &[u8], rid: u64) -> &mut OpenTxn {
        self.open.entry(xid.to_vec()).or_insert_with(|| OpenTxn {
            first_rid: rid,
            ..OpenTxn::default()
        })
    }

    fn commit(&mut self, txn: OpenTxn) {
        for message in txn.enqueues {
            self.live.insert(message.rid, message);
        }
        for dequeue in txn.dequeues {
            self.live.remove(&dequeue.deq_rid);
        }
    }

    /// Ends replay, handing back live messages in rid order and open
    /// transactions in the order they first appeared.
    pub fn finish(self) -> RecoveredJournal {
        let mut prepared_txns: Vec<PreparedTransaction> = self
            .open
            .into_iter()
            .map(|(xid, txn)| PreparedTransaction {
                xid,
                prepared: txn.prepared,
                enqueues: txn.enqueues,
                dequeues: txn.dequeues,
                first_rid: txn.first_rid,
                prepare_serials: txn.prepare_serials,
            })
            .collect();
        prepared_txns.sort_by_key(|txn| txn.first_rid);

        RecoveredJournal {
            messages: self.live.into_values().collect(),
            prepared_txns,
            highest_rid: self.last_rid.unwrap_or(0),
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{RecordHeader, FLAG_EXTERNAL, FLAG_TRANSIENT, FLAG_TXN_COML_COMMIT};

    const TAG: u64 = 1;

    fn record(header: RecordHeader, xid: &[u8], data: &[u8]) -> ScannedRecord {
        ScannedRecord {
            header,
            xid: xid.to_vec(),
            data: data.to_vec(),
            offset: 4096,
        }
    }

    fn enq(rid: u64, data: &[u8]) -> ScannedRecord {
        record(RecordHeader::enqueue(TAG, rid, 0, data.len() as u64, 0), b"", data)
    }

    fn txn_enq(rid: u64, xid: &[u8]) -> ScannedRecord {
        record(RecordHeader::enqueue(TAG, rid, xid.len() as u32, 1, 0), xid, b"m")
    }

    fn deq(rid: u64, target: u64) -> ScannedRecord {
        record(RecordHeader::dequeue(TAG, rid, 0, target, 0), b"", b"")
    }

    fn txn_deq(rid: u64, target: u64, xid: &[u8], flags: u8) -> ScannedRecord {
        record(RecordHeader::dequeue(TAG, rid, xid.len() as u32, target, flags), xid, b"")
    }

    fn boundary(rt: RecordType, rid: u64, xid: &[u8]) -> ScannedRecord {
        record(RecordHeader::txn(rt, TAG, rid, xid.len() as u32), xid, b"")
    }

    fn replay(records: Vec<ScannedRecord>) -> RecoveryResult<RecoveredJournal> {
        let mut replayer = Replayer::new(1);
        for r in records {
            replayer.apply(1, r)?;
        }
        Ok(replayer.finish())
    }

    #[test]
    fn test_enqueue_dequeue_leaves_nothing() {
        let journal = replay(vec![enq(1, b"a"), deq(2, 1)]).unwrap();
        assert!(journal.messages.is_empty());
        assert!(journal.prepared_txns.is_empty());
        assert_eq!(journal.highest_rid, 2);
    }

    #[test]
    fn test_live_messages_in_enqueue_order() {
        let journal = replay(vec![enq(1, b"a"), enq(2, b"b"), enq(3, b"c"), deq(4, 2)]).unwrap();
        let rids: Vec<u64> = journal.messages.iter().map(|m| m.rid).collect();
        assert_eq!(rids, vec![1, 3]);
        assert_eq!(journal.messages[1].data, b"c");
        assert!(journal.messages[0].token.is_durable());
    }

    #[test]
    fn test_committed_txn_applies() {
        let journal = replay(vec![
            txn_enq(1, b"t1"),
            boundary(RecordType::TxnCommit, 2, b"t1"),
        ])
        .unwrap();
        assert_eq!(journal.messages.len(), 1);
        assert_eq!(journal.messages[0].rid, 1);
        assert!(journal.prepared_txns.is_empty());
    }

    #[test]
    fn test_aborted_txn_discards() {
        let journal = replay(vec![
            enq(1, b"a"),
            txn_enq(2, b"t1"),
            txn_deq(3, 1, b"t1", 0),
            boundary(RecordType::TxnAbort, 4, b"t1"),
        ])
        .unwrap();
        let rids: Vec<u64> = journal.messages.iter().map(|m| m.rid).collect();
        assert_eq!(rids, vec![1]);
        assert!(journal.prepared_txns.is_empty());
    }

    #[test]
    fn test_prepared_txn_in_doubt() {
        let journal = replay(vec![
            txn_enq(1, b"t1"),
            boundary(RecordType::TxnPrepare, 2, b"t1"),
        ])
        .unwrap();
        assert!(journal.messages.is_empty());
        assert_eq!(journal.prepared_txns.len(), 1);
        let txn = &journal.prepared_txns[0];
        assert_eq!(txn.xid, b"t1");
        assert!(txn.prepared);
        assert_eq!(txn.enqueues.len(), 1);
        assert_eq!(txn.enqueues[0].rid, 1);
        assert_eq!(txn.enqueues[0].xid.as_deref(), Some(&b"t1"[..]));
    }

    #[test]
    fn test_unprepared_open_txn_in_doubt() {
        let journal = replay(vec![
            enq(1, b"a"),
            txn_deq(2, 1, b"t2", FLAG_TXN_COML_COMMIT),
        ])
        .unwrap();
        // The message stays live until the dequeue commits.
        assert_eq!(journal.messages.len(), 1);
        let txn = &journal.prepared_txns[0];
        assert!(!txn.prepared);
        assert_eq!(txn.dequeues[0].deq_rid, 1);
        assert!(txn.dequeues[0].txn_coml_commit);
    }

    #[test]
    fn test_dequeue_of_unknown_record_is_corrupt() {
        let err = replay(vec![enq(5, b"a"), deq(6, 4)]).unwrap_err();
        assert_eq!(err.code().code(), "MSGJ_RECOVERY_CORRUPT_LOG");
    }

    #[test]
    fn test_dequeue_below_floor_tolerated() {
        let mut replayer = Replayer::new(10);
        replayer.apply(2, enq(10, b"a")).unwrap();
        replayer.apply(2, deq(11, 3)).unwrap();
        let journal = replayer.finish();
        assert_eq!(journal.messages.len(), 1);
    }

    #[test]
    fn test_transient_dropped_and_dequeue_tolerated() {
        let transient = record(RecordHeader::enqueue(TAG, 1, 0, 1, FLAG_TRANSIENT), b"", b"x");
        let journal = replay(vec![transient, enq(2, b"b"), deq(3, 1)]).unwrap();
        assert_eq!(journal.messages.len(), 1);
        assert_eq!(journal.stats.transient_dropped, 1);
    }

    #[test]
    fn test_external_message_recovered_without_payload() {
        let external = record(RecordHeader::enqueue(TAG, 1, 0, 4096, FLAG_EXTERNAL), b"", b"");
        let journal = replay(vec![external]).unwrap();
        assert!(journal.messages[0].external);
        assert_eq!(journal.messages[0].data_len, 4096);
        assert!(journal.messages[0].data.is_empty());
    }

    #[test]
    fn test_rid_must_increase() {
        let err = replay(vec![enq(2, b"a"), enq(2, b"b")]).unwrap_err();
        assert_eq!(err.code().code(), "MSGJ_RECOVERY_CORRUPT_LOG");
    }

    #[test]
    fn test_orphan_boundary_ignored() {
        let journal = replay(vec![boundary(RecordType::TxnCommit, 7, b"gone")]).unwrap();
        assert_eq!(journal.stats.orphan_boundaries, 1);
        assert_eq!(journal.highest_rid, 7);
    }

    #[test]
    fn test_xid_reused_after_commit() {
        let journal = replay(vec![
            txn_enq(1, b"t1"),
            boundary(RecordType::TxnCommit, 2, b"t1"),
            txn_enq(3, b"t1"),
        ])
        .unwrap();
        assert_eq!(journal.messages.len(), 1);
        assert_eq!(journal.prepared_txns.len(), 1);
        assert_eq!(journal.prepared_txns[0].enqueues[0].rid, 3);
    }

    #[test]
    fn test_in_doubt_order_follows_log() {
        let journal = replay(vec![
            txn_enq(1, b"b"),
            txn_enq(2, b"a"),
            txn_enq(3, b"c"),
        ])
        .unwrap();
        let xids: Vec<&[u8]> = journal
            .prepared_txns
            .iter()
            .map(|t| t.xid.as_slice())
            .collect();
        assert_eq!(xids, vec![&b"b"[..], b"a", b"c"]);
    }
}
