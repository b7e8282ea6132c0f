//! Journal startup: fresh initialization and recovery from disk

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::aio::fileio::{read_exact_at, write_all_at};
use crate::aio::AioRequest;
use crate::crash_point::{maybe_crash, points};
use crate::extent::{list_extent_files, Extent, SpaceProvider};
use crate::format::{ExtentHeader, RecordHeader, SBLK_SIZE};
use crate::observability::{log_event, log_event_with_fields, JournalEvent};
use crate::recovery::{
    ExtentScanner, RecoveredJournal, RecoveryError, RecoveryResult, Replayer, Scan,
};

use super::engine::{EngineState, ExtentSlot, JournalShared, LiveRecord};
use super::errors::{JournalError, JournalResult};
use super::rcache::ReadCache;
use super::txn::{Member, Transaction};
use super::wcache::WriteCache;
use super::Phase;

/// An extent whose header names this journal and queue.
struct FoundExtent {
    extent: Extent,
    file: Arc<File>,
    header: ExtentHeader,
}

fn check_cache_geometry(pages: u16, page_sblks: u32) -> JournalResult<()> {
    // u16::MAX is the page id of header writes.
    if pages == 0 || pages == u16::MAX || page_sblks == 0 {
        return Err(JournalError::invalid(format!(
            "unusable write cache of {} pages of {} sblks",
            pages, page_sblks
        )));
    }
    Ok(())
}

/// Zeroes the header of a torn record so later scans end there. Once newer
/// extents exist the record would otherwise read as corruption.
fn erase_torn_record(path: &Path, offset: u64) -> JournalResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    write_all_at(&file, &[0u8; RecordHeader::SIZE], offset)?;
    file.sync_data()?;
    Ok(())
}

impl JournalShared {
    /// Prepares an empty journal. Extent files already in the directory are
    /// returned to `space` without being read.
    pub(super) fn initialize(
        &self,
        space: Arc<dyn SpaceProvider>,
        wcache_pages: u16,
        wcache_page_sblks: u32,
    ) -> JournalResult<()> {
        check_cache_geometry(wcache_pages, wcache_page_sblks)?;
        let stale = list_extent_files(&self.config.directory)?
            .iter()
            .map(|path| Extent::from_path(path))
            .collect::<io::Result<Vec<_>>>()?;
        let stale_count = stale.len();
        {
            let mut st = self.lock_state();
            if st.phase != Phase::Uninitialized {
                return Err(JournalError::invalid(format!(
                    "cannot initialize a journal that is {}",
                    st.phase
                )));
            }
            st.retired.extend(stale);
            st.space = Some(space);
            st.queue_id = self.config.queue_id;
            st.next_serial = 1;
            st.next_rid = 1;
            st.wcache = Some(WriteCache::new(wcache_pages, wcache_page_sblks));
            st.phase = Phase::Ready;
        }
        {
            let _dispatch = self.lock_dispatch();
            self.release_retired();
        }
        log_event_with_fields(
            &self.id,
            JournalEvent::Initialized,
            &[("stale_extents", &stale_count.to_string())],
        );
        Ok(())
    }

    pub(super) fn recover(
        &self,
        space: Arc<dyn SpaceProvider>,
        wcache_pages: u16,
        wcache_page_sblks: u32,
        queue_id: u64,
    ) -> RecoveryResult<RecoveredJournal> {
        check_cache_geometry(wcache_pages, wcache_page_sblks)
            .map_err(|e| RecoveryError::state(e.to_string()))?;
        {
            let mut st = self.lock_state();
            if st.phase != Phase::Uninitialized {
                return Err(RecoveryError::state(format!(
                    "cannot recover a journal that is {}",
                    st.phase
                )));
            }
            st.phase = Phase::Recovering;
            st.queue_id = queue_id;
            st.space = Some(space);
            st.rcache = Some(ReadCache::new(
                wcache_pages,
                wcache_page_sblks as usize * SBLK_SIZE,
            ));
        }
        log_event_with_fields(
            &self.id,
            JournalEvent::RecoveryStart,
            &[("directory", &self.config.directory.display().to_string())],
        );

        match self.recover_extents(queue_id, wcache_pages, wcache_page_sblks) {
            Ok(recovered) => {
                log_event_with_fields(
                    &self.id,
                    JournalEvent::RecoveryComplete,
                    &[
                        ("messages", &recovered.messages.len().to_string()),
                        ("in_doubt", &recovered.prepared_txns.len().to_string()),
                        ("highest_rid", &recovered.highest_rid.to_string()),
                    ],
                );
                Ok(recovered)
            }
            Err(e) => {
                self.drain_reads();
                *self.lock_state() = EngineState::new(self.config.queue_id);
                log_event_with_fields(
                    &self.id,
                    JournalEvent::RecoveryFailed,
                    &[("code", e.code().code()), ("error", e.message())],
                );
                Err(e)
            }
        }
    }

    /// Finishes recovery and opens the journal for writes.
    pub(super) fn recover_complete(&self) -> JournalResult<()> {
        {
            let mut st = self.lock_state();
            if st.phase != Phase::Recovering || st.wcache.is_none() {
                return Err(JournalError::invalid(format!(
                    "no finished recovery to complete (journal is {})",
                    st.phase
                )));
            }
            if let Some((path, offset)) = st.torn_tail.take() {
                erase_torn_record(&path, offset)?;
            }
            st.rcache = None;
            let unused = mem::take(&mut st.unused);
            st.retired.extend(unused);
            st.phase = Phase::Ready;
            st.retire_dead_extents();
        }
        {
            let _dispatch = self.lock_dispatch();
            self.release_retired();
        }
        log_event(&self.id, JournalEvent::Ready);
        Ok(())
    }

    fn recover_extents(
        &self,
        queue_id: u64,
        wcache_pages: u16,
        wcache_page_sblks: u32,
    ) -> RecoveryResult<RecoveredJournal> {
        let (found, unused) = self.read_headers(queue_id)?;

        // Everything older than the oldest surviving extent was released.
        let floor = found.first().map_or(1, |f| f.header.first_rid);
        let mut replayer = Replayer::new(floor);
        let mut torn_tail = None;
        let newest = found.len().saturating_sub(1);
        for (index, extent) in found.iter().enumerate() {
            let serial = extent.header.serial;
            let data = self.read_data_area(extent)?;
            let mut scanner = ExtentScanner::new(&data, extent.header.tag);
            loop {
                match scanner.next_record() {
                    Scan::Record(record) => replayer.apply(serial, record)?,
                    Scan::End => break,
                    Scan::Torn { offset, reason } if index == newest => {
                        warn!(journal = %self.id, serial, offset, reason = %reason, "torn record ends the log");
                        torn_tail = Some((extent.extent.path().to_path_buf(), offset));
                        break;
                    }
                    Scan::Torn { offset, reason } => {
                        return Err(RecoveryError::corrupt_at(serial, offset, reason));
                    }
                }
            }
            replayer.extent_scanned();
        }
        maybe_crash(points::RECOVERY_AFTER_SCAN);
        log_event_with_fields(
            &self.id,
            JournalEvent::RecoveryScanComplete,
            &[
                ("extents", &found.len().to_string()),
                ("unused", &unused.len().to_string()),
            ],
        );

        let recovered = replayer.finish();
        self.rebuild(found, unused, &recovered, wcache_pages, wcache_page_sblks);
        self.lock_state().torn_tail = torn_tail;
        Ok(recovered)
    }

    /// Reads every extent header in the directory, oldest serial first.
    /// Extents with a zeroed header never took a record.
    fn read_headers(&self, queue_id: u64) -> RecoveryResult<(Vec<FoundExtent>, Vec<Extent>)> {
        let paths = list_extent_files(&self.config.directory)
            .map_err(|e| RecoveryError::io("listing journal directory", e))?;
        let mut found = Vec::new();
        let mut unused = Vec::new();
        let mut block = vec![0u8; SBLK_SIZE];

        for path in paths {
            let extent = Extent::from_path(&path)
                .map_err(|e| RecoveryError::io("reading extent metadata", e))?;
            if extent.size() < SBLK_SIZE as u64 {
                return Err(RecoveryError::corrupt(format!(
                    "extent {} is shorter than its header",
                    path.display()
                )));
            }
            let file = OpenOptions::new()
                .read(true)
                .open(&path)
                .map_err(|e| RecoveryError::io("opening extent", e))?;
            read_exact_at(&file, &mut block, 0)
                .map_err(|e| RecoveryError::io("reading extent header", e))?;

            let header = match ExtentHeader::decode(&block) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    unused.push(extent);
                    continue;
                }
                Err(e) => {
                    return Err(RecoveryError::corrupt(format!(
                        "extent {}: {}",
                        path.display(),
                        e
                    )))
                }
            };
            if header.journal_id != self.id {
                return Err(RecoveryError::foreign_extent(format!(
                    "extent {} belongs to journal {:?}",
                    path.display(),
                    header.journal_id
                )));
            }
            if header.queue_id != queue_id {
                return Err(RecoveryError::foreign_extent(format!(
                    "extent {} belongs to queue {}, expected {}",
                    path.display(),
                    header.queue_id,
                    queue_id
                )));
            }
            debug!(journal = %self.id, serial = header.serial, extent = %extent.id(), "found extent");
            found.push(FoundExtent {
                extent,
                file: Arc::new(file),
                header,
            });
        }

        found.sort_by_key(|f| f.header.serial);
        if let Some(pair) = found
            .windows(2)
            .find(|pair| pair[0].header.serial == pair[1].header.serial)
        {
            return Err(RecoveryError::corrupt(format!(
                "extents {} and {} share serial {}",
                pair[0].extent.path().display(),
                pair[1].extent.path().display(),
                pair[0].header.serial
            )));
        }
        Ok((found, unused))
    }

    /// Streams an extent's data area through the storage worker and the
    /// read pages.
    fn read_data_area(&self, extent: &FoundExtent) -> RecoveryResult<Vec<u8>> {
        let total = extent.extent.size() - SBLK_SIZE as u64;
        let page_size = {
            let mut st = self.lock_state();
            let rcache = st
                .rcache
                .as_mut()
                .ok_or_else(|| RecoveryError::state("read pages released during recovery"))?;
            rcache.reset();
            rcache.page_size() as u64
        };

        let mut data = Vec::with_capacity(total as usize);
        let mut issued = 0u64;
        while (data.len() as u64) < total {
            let mut progressed = false;
            {
                let mut st = self.lock_state();
                let rcache = st
                    .rcache
                    .as_mut()
                    .ok_or_else(|| RecoveryError::state("read pages released during recovery"))?;
                while issued < total {
                    let page = match rcache.claim() {
                        Some((page, _)) => page,
                        None => break,
                    };
                    let len = page_size.min(total - issued);
                    self.aio
                        .submit(AioRequest::Read {
                            page,
                            file: Arc::clone(&extent.file),
                            offset: SBLK_SIZE as u64 + issued,
                            len: len as usize,
                        })
                        .map_err(|e| RecoveryError::io("submitting extent read", e))?;
                    self.note_submitted();
                    issued += len;
                    progressed = true;
                }
                loop {
                    match rcache.take_next() {
                        Ok(Some(bytes)) => {
                            data.extend_from_slice(&bytes);
                            progressed = true;
                        }
                        Ok(None) => break,
                        Err(e) => return Err(RecoveryError::io("reading extent data", e)),
                    }
                }
            }
            if !progressed && self.get_events() == 0 {
                self.aio.wait_for_events(self.config.get_events_timeout());
            }
        }
        Ok(data)
    }

    /// Waits out reads left behind by a failed recovery.
    fn drain_reads(&self) {
        while self.aio.in_flight() > 0 {
            if self.get_events() == 0 {
                self.aio.wait_for_events(self.config.get_events_timeout());
            }
        }
    }

    /// Rebuilds write-side bookkeeping from the replay result.
    fn rebuild(
        &self,
        found: Vec<FoundExtent>,
        unused: Vec<Extent>,
        recovered: &RecoveredJournal,
        wcache_pages: u16,
        wcache_page_sblks: u32,
    ) {
        let newest_first_rid = found.last().map_or(1, |f| f.header.first_rid);
        let newest_serial = found.last().map_or(0, |f| f.header.serial);

        let mut st = self.lock_state();
        st.extents = found
            .into_iter()
            .map(|f| {
                let size = f.extent.size();
                ExtentSlot {
                    serial: f.header.serial,
                    extent: f.extent,
                    file: None,
                    tag: f.header.tag,
                    live_refs: 0,
                    pages_in_flight: 0,
                    write_offset: size,
                }
            })
            .collect();
        st.current_open = false;
        st.unused = unused;

        for message in &recovered.messages {
            st.add_ref(message.extent_serial);
            st.live.insert(
                message.rid,
                LiveRecord {
                    serial: message.extent_serial,
                    locked_by: None,
                    external: message.external,
                },
            );
        }

        for txn in &recovered.prepared_txns {
            let mut restored = Transaction {
                prepared: txn.prepared,
                prepare_serials: txn.prepare_serials.clone(),
                ..Transaction::default()
            };
            for serial in &txn.prepare_serials {
                st.add_ref(*serial);
            }
            for message in &txn.enqueues {
                st.add_ref(message.extent_serial);
                restored.members.push(Member::Enqueue {
                    rid: message.rid,
                    serial: message.extent_serial,
                    external: message.external,
                    token: message.token.clone(),
                });
            }
            for dequeue in &txn.dequeues {
                st.add_ref(dequeue.extent_serial);
                let target_serial = st.live.get_mut(&dequeue.deq_rid).map(|entry| {
                    entry.locked_by = Some(txn.xid.clone());
                    entry.serial
                });
                restored.members.push(Member::Dequeue {
                    rid: dequeue.rid,
                    serial: dequeue.extent_serial,
                    target: dequeue.deq_rid,
                    target_serial,
                });
            }
            st.txns.restore(txn.xid.clone(), restored);
        }

        st.next_serial = newest_serial + 1;
        st.next_rid = (recovered.highest_rid + 1).max(newest_first_rid);
        st.wcache = Some(WriteCache::new(wcache_pages, wcache_page_sblks));
    }
}
