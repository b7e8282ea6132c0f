//! Open transaction bookkeeping
//!
//! A transaction is created by the first record naming its xid and lives
//! until its commit or abort record is durable. Resolved xids are remembered
//! (up to [`RESOLVED_HISTORY`]) so a late duplicate commit or abort can be
//! told apart from a new empty transaction.

use std::collections::{HashMap, VecDeque};

use super::errors::{display_xid, JournalError, JournalResult};
use super::token::DataToken;

/// Resolved xids remembered for duplicate detection.
pub const RESOLVED_HISTORY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Commit => "commit",
            Outcome::Abort => "abort",
        }
    }
}

/// A record written under a transaction.
#[derive(Debug, Clone)]
pub(crate) enum Member {
    Enqueue {
        rid: u64,
        serial: u64,
        external: bool,
        token: DataToken,
    },
    Dequeue {
        rid: u64,
        serial: u64,
        target: u64,
        /// Extent of the dequeued enqueue, when it is still tracked.
        target_serial: Option<u64>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub members: Vec<Member>,
    pub prepared: bool,
    /// Extents holding this transaction's prepare records.
    pub prepare_serials: Vec<u64>,
    pub resolving: Option<Outcome>,
    /// Tokens of duplicate commit/abort calls absorbed while resolving.
    pub waiters: Vec<DataToken>,
}

/// What a commit or abort call has to do.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Write the boundary record; the transaction's contents are attached.
    Write {
        members: Vec<Member>,
        prepare_serials: Vec<u64>,
    },
    /// The same outcome is already in flight.
    Absorbed,
}

#[derive(Debug, Default)]
pub(crate) struct TxnTable {
    open: HashMap<Vec<u8>, Transaction>,
    resolved: HashMap<Vec<u8>, Outcome>,
    resolved_order: VecDeque<Vec<u8>>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, xid: &[u8]) -> bool {
        self.open.contains_key(xid)
    }

    pub fn resolved_outcome(&self, xid: &[u8]) -> Option<Outcome> {
        self.resolved.get(xid).copied()
    }

    /// Checks that a member record may be added under `xid`.
    pub fn check_member(&self, xid: &[u8]) -> JournalResult<()> {
        match self.open.get(xid) {
            Some(txn) if txn.resolving.is_some() => Err(JournalError::invalid(format!(
                "transaction {} is being resolved",
                display_xid(xid)
            ))),
            _ => Ok(()),
        }
    }

    /// Records a member, opening (or reopening) the transaction.
    pub fn add_member(&mut self, xid: &[u8], member: Member) {
        self.entry(xid).members.push(member);
    }

    pub fn check_prepare(&self, xid: &[u8]) -> JournalResult<()> {
        if !self.open.contains_key(xid) && self.resolved.contains_key(xid) {
            return Err(JournalError::already_resolved(xid));
        }
        self.check_member(xid)
    }

    pub fn add_prepare(&mut self, xid: &[u8], serial: u64) {
        let txn = self.entry(xid);
        txn.prepared = true;
        txn.prepare_serials.push(serial);
    }

    /// Starts resolving `xid` with `outcome`.
    ///
    /// # Errors
    ///
    /// - `AlreadyResolved` once the transaction's boundary record is durable
    /// - `InvalidArgument` if the opposite outcome is already in flight
    pub fn begin_resolution(&mut self, xid: &[u8], outcome: Outcome) -> JournalResult<Resolution> {
        if let Some(txn) = self.open.get_mut(xid) {
            return match txn.resolving {
                Some(current) if current == outcome => Ok(Resolution::Absorbed),
                Some(current) => Err(JournalError::invalid(format!(
                    "transaction {} is already being resolved by {}",
                    display_xid(xid),
                    current.as_str()
                ))),
                None => {
                    txn.resolving = Some(outcome);
                    Ok(Resolution::Write {
                        members: txn.members.clone(),
                        prepare_serials: txn.prepare_serials.clone(),
                    })
                }
            };
        }
        if self.resolved.contains_key(xid) {
            return Err(JournalError::already_resolved(xid));
        }
        // Empty transaction: nothing but the boundary record.
        self.entry(xid).resolving = Some(outcome);
        Ok(Resolution::Write {
            members: Vec::new(),
            prepare_serials: Vec::new(),
        })
    }

    /// Undoes [`begin_resolution`](Self::begin_resolution) when the
    /// boundary record could not be staged.
    pub fn abandon_resolution(&mut self, xid: &[u8]) {
        let drop_entry = match self.open.get_mut(xid) {
            Some(txn) => {
                txn.resolving = None;
                txn.members.is_empty() && !txn.prepared && txn.waiters.is_empty()
            }
            None => false,
        };
        if drop_entry {
            self.open.remove(xid);
        }
    }

    pub fn add_waiter(&mut self, xid: &[u8], token: DataToken) {
        if let Some(txn) = self.open.get_mut(xid) {
            txn.waiters.push(token);
        }
    }

    /// The boundary record of `xid` is durable. Returns absorbed duplicates.
    pub fn resolution_durable(&mut self, xid: &[u8]) -> Vec<DataToken> {
        let txn = match self.open.remove(xid) {
            Some(txn) => txn,
            None => return Vec::new(),
        };
        if let Some(outcome) = txn.resolving {
            self.remember(xid.to_vec(), outcome);
        }
        txn.waiters
    }

    /// Reinstates a transaction found unresolved by recovery.
    pub fn restore(&mut self, xid: Vec<u8>, txn: Transaction) {
        self.open.insert(xid, txn);
    }

    fn entry(&mut self, xid: &[u8]) -> &mut Transaction {
        // A new reference reopens a previously resolved xid.
        if !self.open.contains_key(xid) && self.resolved.remove(xid).is_some() {
            self.resolved_order.retain(|x| x.as_slice() != xid);
        }
        self.open.entry(xid.to_vec()).or_default()
    }

    fn remember(&mut self, xid: Vec<u8>, outcome: Outcome) {
        if self.resolved.insert(xid.clone(), outcome).is_none() {
            self.resolved_order.push_back(xid);
        }
        while self.resolved_order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
    }
}
