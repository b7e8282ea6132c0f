//! Journal engine: submissions, completion dispatch, timers and teardown

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, warn};

use crate::aio::{AioCallback, AioContext, AioEvent, AioRequest};
use crate::config::JournalConfig;
use crate::crash_point::{maybe_crash, points};
use crate::extent::{Extent, SpaceProvider};
use crate::format::{
    ExtentHeader, RecordHeader, RecordType, FLAG_EXTERNAL, FLAG_TRANSIENT, FLAG_TXN_COML_COMMIT,
    SBLK_SIZE,
};
use crate::observability::{
    log_event, log_event_with_fields, InstrumentationSink, JournalEvent, JournalMetrics,
    MetricsSnapshot, NoopInstrumentation,
};
use crate::recovery::{RecoveredJournal, RecoveryResult};
use crate::timer::{FireEvent, Timer, TimerService};

use super::errors::{display_xid, JournalError, JournalResult};
use super::rcache::ReadCache;
use super::token::{DataToken, OpKind, TokenOp};
use super::txn::{Member, Outcome, Resolution, TxnTable};
use super::wcache::{PageWrite, WriteCache};
use super::{IoResult, Phase, QueueStore};

/// Page id carried by extent header writes; never a cache page.
pub(super) const HEADER_PAGE: u16 = u16::MAX;

/// Notification run with the journal id when a [`Journal`] is dropped.
pub type DeleteCallback = Box<dyn FnOnce(&str) + Send>;

/// An extent the journal holds, oldest first.
pub(super) struct ExtentSlot {
    pub serial: u64,
    pub extent: Extent,
    /// Open only for the extent being written.
    pub file: Option<Arc<File>>,
    pub tag: u64,
    /// Live messages and unresolved transaction records in this extent.
    pub live_refs: u64,
    pub pages_in_flight: u64,
    pub write_offset: u64,
}

#[derive(Debug, Clone)]
pub(super) struct LiveRecord {
    pub serial: u64,
    /// Transaction holding a pending dequeue of this record.
    pub locked_by: Option<Vec<u8>>,
    pub external: bool,
}

/// An enqueue whose payload is still arriving in chunks.
struct PartialRecord {
    token: DataToken,
    rid: u64,
    xid: Option<Vec<u8>>,
    total_len: u64,
    transient: bool,
    external: bool,
    data: Vec<u8>,
}

pub(super) struct EngineState {
    pub phase: Phase,
    pub io_failed: bool,
    pub queue_id: u64,
    pub space: Option<Arc<dyn SpaceProvider>>,
    pub wcache: Option<WriteCache>,
    pub rcache: Option<ReadCache>,
    pub extents: VecDeque<ExtentSlot>,
    /// The newest extent is still being written.
    pub current_open: bool,
    pub next_serial: u64,
    pub next_rid: u64,
    pub live: BTreeMap<u64, LiveRecord>,
    pub txns: TxnTable,
    partial: Option<PartialRecord>,
    write_activity: bool,
    flush_triggered: bool,
    flush_target: u64,
    /// Page and header writes handed to the storage worker.
    pages_submitted: u64,
    /// Writes whose completion has been dispatched.
    pages_completed: u64,
    /// Extents whose header write is outstanding, in submission order.
    pending_headers: VecDeque<u64>,
    /// Extents waiting to go back to the provider, in release order.
    pub retired: VecDeque<Extent>,
    /// Never-written extents found by recovery, returned once it completes.
    pub unused: Vec<Extent>,
    /// Torn record ending the recovered log: extent file and record offset.
    pub torn_tail: Option<(PathBuf, u64)>,
}

impl EngineState {
    pub(super) fn new(queue_id: u64) -> Self {
        Self {
            phase: Phase::Uninitialized,
            io_failed: false,
            queue_id,
            space: None,
            wcache: None,
            rcache: None,
            extents: VecDeque::new(),
            current_open: false,
            next_serial: 1,
            next_rid: 1,
            live: BTreeMap::new(),
            txns: TxnTable::new(),
            partial: None,
            write_activity: false,
            flush_triggered: false,
            flush_target: 0,
            pages_submitted: 0,
            pages_completed: 0,
            pending_headers: VecDeque::new(),
            retired: VecDeque::new(),
            unused: Vec::new(),
            torn_tail: None,
        }
    }

    fn check_writable(&self) -> JournalResult<()> {
        match self.phase {
            Phase::Uninitialized => Err(JournalError::NotReady("journal not initialized")),
            Phase::Recovering => Err(JournalError::NotReady("journal is recovering")),
            Phase::Stopping | Phase::Stopped => Err(JournalError::Closed),
            Phase::Ready if self.io_failed => Err(JournalError::IoFailure(
                "an earlier write failed; journal is read-only".into(),
            )),
            Phase::Ready => Ok(()),
        }
    }

    /// Checks that nothing else is staged ahead of a non-enqueue record.
    fn check_no_partial(&self) -> JournalResult<()> {
        if self.partial.is_some() {
            return Err(JournalError::Busy);
        }
        Ok(())
    }

    fn slot_mut(&mut self, serial: u64) -> Option<&mut ExtentSlot> {
        self.extents.iter_mut().find(|slot| slot.serial == serial)
    }

    fn current_mut(&mut self) -> Option<&mut ExtentSlot> {
        if self.current_open {
            self.extents.back_mut()
        } else {
            None
        }
    }

    pub(super) fn add_ref(&mut self, serial: u64) {
        if let Some(slot) = self.slot_mut(serial) {
            slot.live_refs += 1;
        }
    }

    fn release_ref(&mut self, serial: u64) {
        if let Some(slot) = self.slot_mut(serial) {
            slot.live_refs = slot.live_refs.saturating_sub(1);
        }
    }

    /// Moves dead extents at the head of the sequence to the retired list.
    ///
    /// Only the head is ever released, so every surviving extent is newer
    /// than every released one.
    pub(super) fn retire_dead_extents(&mut self) {
        // An uncompleted recovery still holds its read pages; it may be
        // stopped but must leave the directory as it found it.
        if self.rcache.is_some()
            || !matches!(self.phase, Phase::Ready | Phase::Stopping | Phase::Stopped)
        {
            return;
        }
        while let Some(front) = self.extents.front() {
            let writing = self.current_open && self.extents.len() == 1;
            if writing || front.live_refs > 0 || front.pages_in_flight > 0 {
                break;
            }
            if let Some(slot) = self.extents.pop_front() {
                self.retired.push_back(slot.extent);
            }
        }
    }
}

/// Journal state shared with timer tasks.
pub(super) struct JournalShared {
    pub id: String,
    pub config: JournalConfig,
    state: Mutex<EngineState>,
    /// Serializes completion dispatch and extent release.
    dispatch: Mutex<()>,
    pub aio: AioContext,
    timer: Arc<dyn TimerService>,
    inactivity: Arc<FireEvent<JournalShared>>,
    poller: Arc<FireEvent<JournalShared>>,
    pub metrics: Arc<JournalMetrics>,
    instrumentation: Arc<dyn InstrumentationSink>,
}

impl JournalShared {
    pub(super) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_inactivity(&self) {
        self.inactivity
            .arm(self.timer.as_ref(), self.config.flush_timeout());
    }

    fn arm_poller(&self) {
        if self.aio.in_flight() > 0 {
            self.poller
                .arm(self.timer.as_ref(), self.config.get_events_timeout());
        }
    }

    /// Runs after every submission attempt, outside the state lock.
    fn after_attempt(&self, result: &JournalResult<()>) {
        match result {
            Ok(()) => {
                self.arm_inactivity();
                self.arm_poller();
            }
            // A refusal may have sealed the partial page; its completion
            // is what frees the cache for the retry.
            Err(JournalError::Busy) => self.arm_poller(),
            Err(_) => {}
        }
    }

    pub(super) fn note_submitted(&self) {
        self.metrics.incr_outstanding_aio();
        self.instrumentation.incr_outstanding_aio();
    }

    pub(super) fn note_completed(&self) {
        self.metrics.decr_outstanding_aio();
        self.instrumentation.decr_outstanding_aio();
    }

    fn poison(&self, st: &mut EngineState, error: &str) {
        self.metrics.increment_write_failures();
        if !st.io_failed {
            st.io_failed = true;
            log_event_with_fields(&self.id, JournalEvent::WriteFailed, &[("error", error)]);
        }
    }

    /// Largest record the journal can ever stage.
    fn record_limit(&self, st: &EngineState) -> u64 {
        let extent_size = st
            .space
            .as_ref()
            .map(|space| space.extent_size())
            .unwrap_or_else(|| self.config.extent_size());
        let cache = st.wcache.as_ref().map_or(0, |w| w.capacity()) as u64;
        cache.min(extent_size.saturating_sub(SBLK_SIZE as u64))
    }

    // ---- write path ----

    fn enqueue(
        &self,
        data: Option<&[u8]>,
        total_len: u64,
        token: &DataToken,
        xid: Option<&[u8]>,
        transient: bool,
    ) -> JournalResult<()> {
        let result = {
            let mut st = self.lock_state();
            self.stage_enqueue(&mut st, data, total_len, token, xid, transient)
        };
        self.after_attempt(&result);
        result
    }

    fn stage_enqueue(
        &self,
        st: &mut EngineState,
        data: Option<&[u8]>,
        total_len: u64,
        token: &DataToken,
        xid: Option<&[u8]>,
        transient: bool,
    ) -> JournalResult<()> {
        st.check_writable()?;
        if xid.map_or(false, |x| x.is_empty()) {
            return Err(JournalError::invalid("transaction id must not be empty"));
        }
        let external = data.is_none();
        let chunk = data.unwrap_or(&[]);

        let (staged, fresh) = match &st.partial {
            Some(partial) if partial.token == *token => {
                if partial.xid.as_deref() != xid || partial.external != external {
                    return Err(JournalError::invalid(
                        "chunk does not belong to the record being staged",
                    ));
                }
                (partial.data.len() as u64, false)
            }
            Some(_) => return Err(JournalError::Busy),
            None => {
                self.check_new_enqueue(st, external, total_len, token, xid)?;
                (0, true)
            }
        };
        let stored_total = if external { 0 } else { total_len };
        if staged + chunk.len() as u64 > stored_total {
            return Err(JournalError::invalid(format!(
                "chunk of {} bytes overruns a record of {} bytes ({} staged)",
                chunk.len(),
                total_len,
                staged
            )));
        }

        if fresh {
            let rid = st.next_rid;
            st.next_rid += 1;
            token.begin_enqueue(rid, xid, external, transient);
            st.partial = Some(PartialRecord {
                token: token.clone(),
                rid,
                xid: xid.map(<[u8]>::to_vec),
                total_len,
                transient,
                external,
                data: Vec::with_capacity(stored_total as usize),
            });
        }

        let complete = match st.partial.as_mut() {
            Some(partial) => {
                partial.data.extend_from_slice(chunk);
                partial.data.len() as u64 == stored_total
            }
            None => false,
        };
        if !complete {
            st.write_activity = true;
            return Ok(());
        }
        let mut partial = match st.partial.take() {
            Some(partial) => partial,
            None => return Ok(()),
        };

        let mut flags = 0;
        if partial.transient {
            flags |= FLAG_TRANSIENT;
        }
        if partial.external {
            flags |= FLAG_EXTERNAL;
        }
        let xid_bytes = partial.xid.clone().unwrap_or_default();
        let header = RecordHeader::enqueue(
            0,
            partial.rid,
            xid_bytes.len() as u32,
            partial.total_len,
            flags,
        );
        let op = TokenOp::new(OpKind::Enqueue);
        match self.append_record(st, header, &xid_bytes, &partial.data, token, op) {
            Ok(serial) => {
                st.add_ref(serial);
                match partial.xid {
                    Some(xid) => st.txns.add_member(
                        &xid,
                        Member::Enqueue {
                            rid: partial.rid,
                            serial,
                            external: partial.external,
                            token: token.clone(),
                        },
                    ),
                    None => {
                        st.live.insert(
                            partial.rid,
                            LiveRecord {
                                serial,
                                locked_by: None,
                                external: partial.external,
                            },
                        );
                    }
                }
                self.metrics.increment_enqueues();
                Ok(())
            }
            Err(JournalError::Busy) => {
                // Earlier chunks stay staged; this one is not consumed.
                if fresh {
                    token.reset();
                } else {
                    partial.data.truncate(staged as usize);
                    st.partial = Some(partial);
                }
                Err(JournalError::Busy)
            }
            Err(e) => Err(e),
        }
    }

    fn check_new_enqueue(
        &self,
        st: &EngineState,
        external: bool,
        total_len: u64,
        token: &DataToken,
        xid: Option<&[u8]>,
    ) -> JournalResult<()> {
        if token.has_pending() {
            return Err(JournalError::invalid(format!(
                "token {} has an operation in flight",
                token.id()
            )));
        }
        if let Some(rid) = token.rid() {
            if st.live.contains_key(&rid) {
                return Err(JournalError::invalid(format!(
                    "token {} still holds live record {}",
                    token.id(),
                    rid
                )));
            }
        }
        if let Some(xid) = xid {
            st.txns.check_member(xid)?;
        }

        let xid_len = xid.map_or(0, <[u8]>::len);
        let limit = self.record_limit(st);
        let stored = if external { 0 } else { total_len };
        let flags = if external { FLAG_EXTERNAL } else { 0 };
        if stored > limit
            || xid_len as u64 > limit
            || RecordHeader::enqueue(0, 0, xid_len as u32, total_len, flags).record_size() > limit
        {
            return Err(JournalError::invalid(format!(
                "record of {} bytes exceeds the largest writable record ({} bytes)",
                total_len, limit
            )));
        }
        Ok(())
    }

    fn dequeue(
        &self,
        token: &DataToken,
        xid: Option<&[u8]>,
        txn_coml_commit: bool,
    ) -> JournalResult<()> {
        let result = {
            let mut st = self.lock_state();
            self.stage_dequeue(&mut st, token, xid, txn_coml_commit)
        };
        self.after_attempt(&result);
        result
    }

    fn stage_dequeue(
        &self,
        st: &mut EngineState,
        token: &DataToken,
        xid: Option<&[u8]>,
        txn_coml_commit: bool,
    ) -> JournalResult<()> {
        st.check_writable()?;
        st.check_no_partial()?;
        if let Some(xid) = xid {
            if xid.is_empty() {
                return Err(JournalError::invalid("transaction id must not be empty"));
            }
            st.txns.check_member(xid)?;
        }

        let target = token.rid().ok_or(JournalError::UnknownRecord { rid: 0 })?;
        let record = st
            .live
            .get(&target)
            .cloned()
            .ok_or(JournalError::UnknownRecord { rid: target })?;
        if let Some(owner) = &record.locked_by {
            return Err(JournalError::invalid(format!(
                "record {} is being dequeued by transaction {}",
                target,
                display_xid(owner)
            )));
        }

        let rid = st.next_rid;
        let xid_bytes = xid.unwrap_or(&[]);
        let flags = if txn_coml_commit { FLAG_TXN_COML_COMMIT } else { 0 };
        let header = RecordHeader::dequeue(0, rid, xid_bytes.len() as u32, target, flags);
        let mut op = TokenOp::new(OpKind::Dequeue);
        if xid.is_none() {
            op.release.push(record.serial);
        }
        let serial = self.append_record(st, header, xid_bytes, &[], token, op)?;
        st.next_rid += 1;
        token.set_dequeue(rid, xid);

        match xid {
            None => {
                st.live.remove(&target);
            }
            Some(xid) => {
                st.add_ref(serial);
                if let Some(entry) = st.live.get_mut(&target) {
                    entry.locked_by = Some(xid.to_vec());
                }
                st.txns.add_member(
                    xid,
                    Member::Dequeue {
                        rid,
                        serial,
                        target,
                        target_serial: Some(record.serial),
                    },
                );
            }
        }
        self.metrics.increment_dequeues();
        Ok(())
    }

    fn txn_end(&self, token: &DataToken, xid: &[u8], outcome: Outcome) -> JournalResult<()> {
        let result = {
            let mut st = self.lock_state();
            self.stage_txn_end(&mut st, token, xid, outcome)
        };
        self.after_attempt(&result);
        result
    }

    fn stage_txn_end(
        &self,
        st: &mut EngineState,
        token: &DataToken,
        xid: &[u8],
        outcome: Outcome,
    ) -> JournalResult<()> {
        st.check_writable()?;
        st.check_no_partial()?;
        if xid.is_empty() {
            return Err(JournalError::invalid("transaction id must not be empty"));
        }
        let (kind, record_type) = match outcome {
            Outcome::Commit => (OpKind::Commit, RecordType::TxnCommit),
            Outcome::Abort => (OpKind::Abort, RecordType::TxnAbort),
        };

        let (members, prepare_serials) = match st.txns.begin_resolution(xid, outcome)? {
            Resolution::Absorbed => {
                token.set_xid(xid);
                token.push_op(TokenOp::new(kind));
                st.txns.add_waiter(xid, token.clone());
                return Ok(());
            }
            Resolution::Write {
                members,
                prepare_serials,
            } => (members, prepare_serials),
        };

        let rid = st.next_rid;
        let header = RecordHeader::txn(record_type, 0, rid, xid.len() as u32);
        let mut op = TokenOp::new(kind);
        op.resolves = Some(xid.to_vec());
        op.release = release_on_resolution(&members, &prepare_serials, outcome);
        if let Err(e) = self.append_record(st, header, xid, &[], token, op) {
            st.txns.abandon_resolution(xid);
            return Err(e);
        }
        st.next_rid += 1;
        token.set_xid(xid);

        for member in &members {
            match (outcome, member) {
                (
                    Outcome::Commit,
                    Member::Enqueue {
                        rid,
                        serial,
                        external,
                        ..
                    },
                ) => {
                    st.live.insert(
                        *rid,
                        LiveRecord {
                            serial: *serial,
                            locked_by: None,
                            external: *external,
                        },
                    );
                }
                (Outcome::Commit, Member::Dequeue { target, .. }) => {
                    st.live.remove(target);
                }
                (Outcome::Abort, Member::Dequeue { target, .. }) => {
                    if let Some(entry) = st.live.get_mut(target) {
                        entry.locked_by = None;
                    }
                }
                (Outcome::Abort, Member::Enqueue { .. }) => {}
            }
        }
        match outcome {
            Outcome::Commit => self.metrics.increment_txn_commits(),
            Outcome::Abort => self.metrics.increment_txn_aborts(),
        }
        Ok(())
    }

    fn txn_prepare(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()> {
        let result = {
            let mut st = self.lock_state();
            self.stage_txn_prepare(&mut st, token, xid)
        };
        self.after_attempt(&result);
        result
    }

    fn stage_txn_prepare(
        &self,
        st: &mut EngineState,
        token: &DataToken,
        xid: &[u8],
    ) -> JournalResult<()> {
        st.check_writable()?;
        st.check_no_partial()?;
        if xid.is_empty() {
            return Err(JournalError::invalid("transaction id must not be empty"));
        }
        st.txns.check_prepare(xid)?;

        let rid = st.next_rid;
        let header = RecordHeader::txn(RecordType::TxnPrepare, 0, rid, xid.len() as u32);
        let op = TokenOp::new(OpKind::Prepare);
        let serial = self.append_record(st, header, xid, &[], token, op)?;
        st.next_rid += 1;
        st.add_ref(serial);
        st.txns.add_prepare(xid, serial);
        token.set_xid(xid);
        self.metrics.increment_txn_prepares();
        Ok(())
    }

    /// Places one record at the write position of the current extent,
    /// moving to a fresh extent when it does not fit.
    ///
    /// The record's tag is filled in here. Returns the extent serial.
    fn append_record(
        &self,
        st: &mut EngineState,
        mut header: RecordHeader,
        xid: &[u8],
        data: &[u8],
        token: &DataToken,
        op: TokenOp,
    ) -> JournalResult<u64> {
        let size = header.record_size();
        let need_switch = match st.current_mut() {
            Some(slot) => slot.write_offset + size > slot.extent.size(),
            None => true,
        };
        let available = st
            .wcache
            .as_ref()
            .map_or(0, |wcache| wcache.available(need_switch)) as u64;
        if size > available {
            // A partial page holds space no retry can use until it is written.
            self.seal_current(st)?;
            self.metrics.increment_busy_rejections();
            log_event(&self.id, JournalEvent::CacheFull);
            return Err(JournalError::Busy);
        }
        if need_switch {
            self.open_extent(st, header.rid)?;
        }

        let slot = st
            .current_mut()
            .ok_or_else(|| JournalError::IoFailure("no extent open for writing".into()))?;
        let file = slot
            .file
            .clone()
            .ok_or_else(|| JournalError::IoFailure("current extent has no open file".into()))?;
        let (serial, offset) = (slot.serial, slot.write_offset);
        header.tag = slot.tag;
        slot.write_offset += size;

        let bytes = crate::format::encode_record(&header, xid, data);
        token.push_op(op);
        let sealed = match st.wcache.as_mut() {
            Some(wcache) => wcache.append(serial, &file, offset, &bytes, Some(token.clone())),
            None => Vec::new(),
        };
        for write in sealed {
            if let Err(e) = self.submit_page(st, write) {
                token.fail();
                return Err(e);
            }
        }

        st.write_activity = true;
        if st.flush_triggered && st.pages_completed >= st.flush_target {
            st.flush_triggered = false;
        }
        Ok(serial)
    }

    fn seal_current(&self, st: &mut EngineState) -> JournalResult<()> {
        if let Some(write) = st.wcache.as_mut().and_then(WriteCache::take_current) {
            self.submit_page(st, write)?;
        }
        Ok(())
    }

    fn submit_page(&self, st: &mut EngineState, write: PageWrite) -> JournalResult<()> {
        let PageWrite {
            page,
            serial,
            file,
            offset,
            data,
        } = write;
        let len = data.len();
        if let Err(e) = self.aio.submit(AioRequest::Write {
            page,
            file,
            offset,
            data,
        }) {
            self.poison(st, &e.to_string());
            return Err(e.into());
        }
        if let Some(slot) = st.slot_mut(serial) {
            slot.pages_in_flight += 1;
        }
        st.pages_submitted += 1;
        self.note_submitted();
        debug!(
            journal = %self.id,
            event = JournalEvent::PageSubmitted.as_str(),
            page,
            serial,
            offset,
            len,
            "page submitted"
        );
        Ok(())
    }

    /// Seals the current page, takes a new extent from the provider and
    /// queues its header behind everything already submitted.
    fn open_extent(&self, st: &mut EngineState, first_rid: u64) -> JournalResult<()> {
        self.seal_current(st)?;
        st.current_open = false;

        let space = st
            .space
            .clone()
            .ok_or(JournalError::NotReady("no space provider"))?;
        let extent = space.acquire_extent(&self.config.directory, self.config.extent_size())?;
        let file = match OpenOptions::new().read(true).write(true).open(extent.path()) {
            Ok(file) => Arc::new(file),
            Err(e) => {
                if let Err(release) = space.release_extent(extent) {
                    warn!(journal = %self.id, error = %release, "could not return unusable extent");
                }
                return Err(e.into());
            }
        };

        let serial = st.next_serial;
        st.next_serial += 1;
        let header = ExtentHeader::new(&self.id, st.queue_id, serial, first_rid);
        let block = header.encode()?;
        if let Err(e) = self.aio.submit(AioRequest::Write {
            page: HEADER_PAGE,
            file: Arc::clone(&file),
            offset: 0,
            data: block,
        }) {
            self.poison(st, &e.to_string());
            return Err(e.into());
        }
        st.pages_submitted += 1;
        st.pending_headers.push_back(serial);
        self.note_submitted();

        let id = extent.id();
        st.extents.push_back(ExtentSlot {
            serial,
            extent,
            file: Some(file),
            tag: header.tag,
            live_refs: 0,
            pages_in_flight: 1,
            write_offset: SBLK_SIZE as u64,
        });
        st.current_open = true;
        self.metrics.increment_extents_acquired();
        log_event_with_fields(
            &self.id,
            JournalEvent::ExtentAcquired,
            &[("serial", &serial.to_string()), ("extent", &id.to_string())],
        );
        Ok(())
    }

    // ---- completions ----

    /// Drains completed I/O and dispatches it. Returns the number of events.
    pub(super) fn get_events(&self) -> usize {
        let _dispatch = self.lock_dispatch();
        let mut durable = Vec::new();
        let mut failed = Vec::new();
        let mut pages = Vec::new();
        let mut writes = 0u64;

        let count = {
            let mut st = self.lock_state();
            let events = self.aio.take_events();
            let count = events.len();
            for event in events {
                self.note_completed();
                match event {
                    AioEvent::Write {
                        page: HEADER_PAGE,
                        result,
                        ..
                    } => {
                        writes += 1;
                        if let Some(serial) = st.pending_headers.pop_front() {
                            if let Some(slot) = st.slot_mut(serial) {
                                slot.pages_in_flight = slot.pages_in_flight.saturating_sub(1);
                            }
                        }
                        match result {
                            Ok(()) => maybe_crash(points::EXTENT_AFTER_HEADER),
                            Err(e) => self.poison(&mut st, &e.to_string()),
                        }
                    }
                    AioEvent::Write { page, data, result } => {
                        writes += 1;
                        let done = st
                            .wcache
                            .as_mut()
                            .and_then(|wcache| wcache.complete(page, data));
                        let done = match done {
                            Some(done) => done,
                            None => {
                                warn!(journal = %self.id, page, "completion for idle page");
                                continue;
                            }
                        };
                        if let Some(slot) = st.slot_mut(done.serial) {
                            slot.pages_in_flight = slot.pages_in_flight.saturating_sub(1);
                        }
                        match result {
                            Ok(()) if !st.io_failed => {
                                self.metrics.add_page_written(done.bytes as u64);
                                durable.extend(done.tokens);
                            }
                            // Records behind a failed write cannot be recovered.
                            Ok(()) => failed.extend(done.tokens),
                            Err(e) => {
                                self.poison(&mut st, &e.to_string());
                                failed.extend(done.tokens);
                            }
                        }
                    }
                    AioEvent::Read { page, result } => {
                        if let Some(rcache) = st.rcache.as_mut() {
                            rcache.fill(page, result.map_err(|e| e.to_string()));
                        }
                        pages.push(page);
                    }
                }
            }
            count
        };
        if count == 0 {
            return 0;
        }

        for token in &failed {
            token.fail();
        }
        if !durable.is_empty() {
            self.write_completion_callback(&durable);
        }
        if !pages.is_empty() {
            self.read_completion_callback(&pages);
        }
        {
            let mut st = self.lock_state();
            st.pages_completed += writes;
            st.retire_dead_extents();
        }
        self.release_retired();
        count
    }

    /// Hands retired extents back to the provider, oldest first.
    ///
    /// Callers hold the dispatch lock, which keeps releases in order.
    pub(super) fn release_retired(&self) {
        loop {
            let (space, extent) = {
                let mut st = self.lock_state();
                let space = match st.space.clone() {
                    Some(space) => space,
                    None => return,
                };
                match st.retired.pop_front() {
                    Some(extent) => (space, extent),
                    None => return,
                }
            };
            maybe_crash(points::EXTENT_BEFORE_RELEASE);
            let id = extent.id();
            match space.release_extent(extent.clone()) {
                Ok(()) => {
                    self.metrics.increment_extents_released();
                    log_event_with_fields(
                        &self.id,
                        JournalEvent::ExtentReleased,
                        &[("extent", &id.to_string())],
                    );
                }
                Err(e) => {
                    warn!(journal = %self.id, extent = %id, error = %e, "extent release failed");
                    self.lock_state().retired.push_front(extent);
                    return;
                }
            }
        }
    }

    pub(super) fn flush(&self, block: bool) -> IoResult {
        let target = {
            let mut st = self.lock_state();
            if matches!(st.phase, Phase::Ready | Phase::Stopping) && !st.io_failed {
                if let Err(e) = self.seal_current(&mut st) {
                    debug!(journal = %self.id, error = %e, "flush could not submit page");
                }
            }
            st.flush_triggered = true;
            st.flush_target = st.pages_submitted;
            st.flush_target
        };
        self.metrics.increment_flushes();
        self.arm_poller();

        if block {
            loop {
                self.get_events();
                if self.lock_state().pages_completed >= target {
                    break;
                }
                self.aio.wait_for_events(self.config.get_events_timeout());
            }
        }

        if self.lock_state().io_failed {
            IoResult::Failed
        } else {
            IoResult::Ok
        }
    }

    /// Inactivity timer action.
    fn flush_fire(&self) {
        enum Next {
            Rearm,
            Flush,
            Idle,
        }
        let next = {
            let mut st = self.lock_state();
            if st.phase != Phase::Ready {
                return;
            }
            if st.flush_triggered && st.pages_completed >= st.flush_target {
                st.flush_triggered = false;
            }
            let buffered = st.wcache.as_ref().map_or(0, WriteCache::buffered);
            if st.write_activity {
                st.write_activity = false;
                Next::Rearm
            } else if !st.flush_triggered {
                if buffered > 0 {
                    Next::Flush
                } else {
                    Next::Idle
                }
            } else {
                // A flush is still in flight; look again next window.
                Next::Rearm
            }
        };
        match next {
            Next::Rearm => self.arm_inactivity(),
            Next::Flush => {
                log_event(&self.id, JournalEvent::InactivityFlush);
                self.flush(false);
                self.arm_inactivity();
            }
            Next::Idle => {}
        }
    }

    /// Get-events timer action.
    fn get_events_fire(&self) {
        self.get_events();
        self.arm_poller();
    }

    pub(super) fn stop(&self, block: bool) {
        {
            let mut st = self.lock_state();
            match st.phase {
                Phase::Stopping | Phase::Stopped => return,
                _ => st.phase = Phase::Stopping,
            }
        }
        log_event(&self.id, JournalEvent::StopStart);

        // No engine lock held: cancel waits for a running fire.
        self.inactivity.cancel();
        self.poller.cancel();

        self.flush(block);
        if block {
            self.aio.shutdown();
            self.get_events();
        }
        self.lock_state().phase = Phase::Stopped;
        log_event(&self.id, JournalEvent::Stopped);
    }

    fn stats(&self) -> JournalStats {
        let st = self.lock_state();
        JournalStats {
            journal_id: self.id.clone(),
            phase: st.phase,
            io_failed: st.io_failed,
            live_records: st.live.len(),
            open_txns: st.txns.open_count(),
            extents: st.extents.len(),
            buffered_bytes: st.wcache.as_ref().map_or(0, WriteCache::buffered),
            free_cache_pages: st.wcache.as_ref().map_or(0, WriteCache::free_pages),
            pages_submitted: st.pages_submitted,
            pages_completed: st.pages_completed,
            outstanding_aio: self.aio.in_flight(),
            next_rid: st.next_rid,
            write_activity: st.write_activity,
            flush_triggered: st.flush_triggered,
            inactivity_armed: self.inactivity.is_armed(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Extent references a resolved transaction gives up once its boundary
/// record is durable.
fn release_on_resolution(members: &[Member], prepare_serials: &[u64], outcome: Outcome) -> Vec<u64> {
    let mut release = prepare_serials.to_vec();
    for member in members {
        match member {
            // Committed enqueues stay referenced as live messages.
            Member::Enqueue { serial, .. } => {
                if outcome == Outcome::Abort {
                    release.push(*serial);
                }
            }
            Member::Dequeue {
                serial,
                target_serial,
                ..
            } => {
                release.push(*serial);
                if outcome == Outcome::Commit {
                    release.extend(target_serial.iter().copied());
                }
            }
        }
    }
    release
}

impl AioCallback for JournalShared {
    fn write_completion_callback(&self, tokens: &[DataToken]) {
        let mut release = Vec::new();
        let mut resolved = Vec::new();
        for token in tokens {
            if let Some(op) = token.complete() {
                release.extend(op.release);
                resolved.extend(op.resolves);
            }
        }
        if release.is_empty() && resolved.is_empty() {
            return;
        }

        let mut waiters = Vec::new();
        {
            let mut st = self.lock_state();
            for serial in release {
                st.release_ref(serial);
            }
            for xid in &resolved {
                waiters.extend(st.txns.resolution_durable(xid));
            }
        }
        for waiter in waiters {
            waiter.complete();
        }
    }

    fn read_completion_callback(&self, pages: &[u16]) {
        let mut st = self.lock_state();
        if let Some(rcache) = st.rcache.as_mut() {
            rcache.mark_ready(pages);
        }
    }
}

/// Counters and state of one journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub journal_id: String,
    pub phase: Phase,
    pub io_failed: bool,
    pub live_records: usize,
    pub open_txns: usize,
    pub extents: usize,
    pub buffered_bytes: usize,
    pub free_cache_pages: usize,
    pub pages_submitted: u64,
    pub pages_completed: u64,
    pub outstanding_aio: usize,
    pub next_rid: u64,
    pub write_activity: bool,
    pub flush_triggered: bool,
    pub inactivity_armed: bool,
    pub metrics: MetricsSnapshot,
}

/// A message journal for one queue.
///
/// Created through [`Journal::builder`], then either
/// [`initialize`](Self::initialize)d fresh or
/// [`recover`](Self::recover)ed from an existing directory. Dropping a
/// journal stops it (blocking) and runs the delete callback.
pub struct Journal {
    shared: Arc<JournalShared>,
    on_delete: Mutex<Option<DeleteCallback>>,
}

/// Configures and builds a [`Journal`].
pub struct JournalBuilder {
    config: JournalConfig,
    timer: Option<Arc<dyn TimerService>>,
    instrumentation: Option<Arc<dyn InstrumentationSink>>,
    on_delete: Option<DeleteCallback>,
}

impl JournalBuilder {
    /// Timer service running the inactivity and get-events tasks. Without
    /// one the journal starts its own timer thread.
    pub fn timer(mut self, timer: Arc<dyn TimerService>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn instrumentation(mut self, sink: Arc<dyn InstrumentationSink>) -> Self {
        self.instrumentation = Some(sink);
        self
    }

    pub fn on_delete(mut self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_delete = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> JournalResult<Journal> {
        self.config.validate()?;
        let id = self.config.journal_id.clone();
        let aio = AioContext::start(&id)?;
        let timer: Arc<dyn TimerService> = match self.timer {
            Some(timer) => timer,
            None => Arc::new(Timer::start(&id)?),
        };
        let instrumentation: Arc<dyn InstrumentationSink> = match self.instrumentation {
            Some(sink) => sink,
            None => Arc::new(NoopInstrumentation),
        };
        let queue_id = self.config.queue_id;
        let config = self.config;

        let shared = Arc::new_cyclic(|weak: &Weak<JournalShared>| JournalShared {
            id,
            config,
            state: Mutex::new(EngineState::new(queue_id)),
            dispatch: Mutex::new(()),
            aio,
            timer,
            inactivity: Arc::new(FireEvent::new(
                "inactivity",
                weak.clone(),
                JournalShared::flush_fire,
            )),
            poller: Arc::new(FireEvent::new(
                "get_events",
                weak.clone(),
                JournalShared::get_events_fire,
            )),
            metrics: Arc::new(JournalMetrics::new()),
            instrumentation,
        });
        debug!(journal = %shared.id, "journal created");

        Ok(Journal {
            shared,
            on_delete: Mutex::new(self.on_delete),
        })
    }
}

impl Journal {
    pub fn builder(config: JournalConfig) -> JournalBuilder {
        JournalBuilder {
            config,
            timer: None,
            instrumentation: None,
            on_delete: None,
        }
    }

    /// Builds a journal with its own timer and no instrumentation.
    pub fn new(config: JournalConfig) -> JournalResult<Self> {
        Self::builder(config).build()
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &JournalConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    /// Prepares a fresh journal. Extent files left in the directory are
    /// handed back to `space` unread.
    pub fn initialize(
        &self,
        space: Arc<dyn SpaceProvider>,
        wcache_pages: u16,
        wcache_page_sblks: u32,
    ) -> JournalResult<()> {
        self.shared.initialize(space, wcache_pages, wcache_page_sblks)
    }

    /// Rebuilds state from the journal directory.
    ///
    /// The journal stays in [`Phase::Recovering`] until
    /// [`recover_complete`](Self::recover_complete). On error it returns to
    /// [`Phase::Uninitialized`] and nothing is released.
    pub fn recover(
        &self,
        space: Arc<dyn SpaceProvider>,
        wcache_pages: u16,
        wcache_page_sblks: u32,
        queue_id: u64,
    ) -> RecoveryResult<RecoveredJournal> {
        self.shared
            .recover(space, wcache_pages, wcache_page_sblks, queue_id)
    }

    /// Ends recovery: frees the read pages, returns dead extents and opens
    /// the journal for writes.
    pub fn recover_complete(&self) -> JournalResult<()> {
        self.shared.recover_complete()
    }

    /// Dispatches completed I/O now. Returns the number of completions.
    pub fn get_events(&self) -> usize {
        self.shared.get_events()
    }

    pub fn stats(&self) -> JournalStats {
        self.shared.stats()
    }

    pub fn metrics(&self) -> Arc<JournalMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Drops the delete callback without running it.
    pub fn reset_delete_callback(&self) {
        self.on_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl QueueStore for Journal {
    fn enqueue_data_record(
        &self,
        data: &[u8],
        total_len: u64,
        token: &DataToken,
        transient: bool,
    ) -> JournalResult<()> {
        self.shared
            .enqueue(Some(data), total_len, token, None, transient)
    }

    fn enqueue_extern_data_record(
        &self,
        total_len: u64,
        token: &DataToken,
        transient: bool,
    ) -> JournalResult<()> {
        self.shared.enqueue(None, total_len, token, None, transient)
    }

    fn enqueue_txn_data_record(
        &self,
        data: &[u8],
        total_len: u64,
        token: &DataToken,
        xid: &[u8],
        transient: bool,
    ) -> JournalResult<()> {
        self.shared
            .enqueue(Some(data), total_len, token, Some(xid), transient)
    }

    fn enqueue_extern_txn_data_record(
        &self,
        total_len: u64,
        token: &DataToken,
        xid: &[u8],
        transient: bool,
    ) -> JournalResult<()> {
        self.shared
            .enqueue(None, total_len, token, Some(xid), transient)
    }

    fn dequeue_data_record(&self, token: &DataToken, txn_coml_commit: bool) -> JournalResult<()> {
        self.shared.dequeue(token, None, txn_coml_commit)
    }

    fn dequeue_txn_data_record(
        &self,
        token: &DataToken,
        xid: &[u8],
        txn_coml_commit: bool,
    ) -> JournalResult<()> {
        self.shared.dequeue(token, Some(xid), txn_coml_commit)
    }

    fn txn_abort(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()> {
        self.shared.txn_end(token, xid, Outcome::Abort)
    }

    fn txn_commit(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()> {
        self.shared.txn_end(token, xid, Outcome::Commit)
    }

    fn txn_prepare(&self, token: &DataToken, xid: &[u8]) -> JournalResult<()> {
        self.shared.txn_prepare(token, xid)
    }

    fn flush(&self, block: bool) -> IoResult {
        self.shared.flush(block)
    }

    fn stop(&self, block: bool) {
        self.shared.stop(block)
    }
}

impl AioCallback for Journal {
    fn write_completion_callback(&self, tokens: &[DataToken]) {
        self.shared.write_completion_callback(tokens)
    }

    fn read_completion_callback(&self, pages: &[u16]) {
        self.shared.read_completion_callback(pages)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shared.stop(true);
        // A non-blocking stop leaves writes in flight; deliver them before
        // the sink goes away.
        self.shared.aio.shutdown();
        self.shared.get_events();
        let callback = self
            .on_delete
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&self.shared.id);
        }
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("id", &self.shared.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
