//! Write cache: a ring of page buffers staged for asynchronous write
//!
//! Pages are used round robin. A page covers one contiguous region of one
//! extent, starting wherever the previous page of that extent ended. Records
//! may span pages but never extents. A page is sealed when full, when the
//! journal flushes, or when writing moves to a new extent; sealed pages are
//! handed to the storage worker and return to the ring when their write
//! completes.

use std::fs::File;
use std::mem;
use std::sync::Arc;

use crate::format::SBLK_SIZE;

use super::token::DataToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
    Empty,
    Filling,
    AioPending,
}

struct Page {
    state: PageState,
    buf: Vec<u8>,
    serial: u64,
    file: Option<Arc<File>>,
    offset: u64,
    /// Records whose final byte lies in this page.
    tokens: Vec<DataToken>,
}

/// A sealed page ready for submission.
pub(crate) struct PageWrite {
    pub page: u16,
    pub serial: u64,
    pub file: Arc<File>,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Result of a page write completing.
pub(crate) struct PageDone {
    pub serial: u64,
    pub bytes: usize,
    pub tokens: Vec<DataToken>,
}

pub(crate) struct WriteCache {
    pages: Vec<Page>,
    page_size: usize,
    current: usize,
}

impl WriteCache {
    pub fn new(pages: u16, page_sblks: u32) -> Self {
        let page_size = page_sblks as usize * SBLK_SIZE;
        let pages = (0..pages)
            .map(|_| Page {
                state: PageState::Empty,
                buf: Vec::with_capacity(page_size),
                serial: 0,
                file: None,
                offset: 0,
                tokens: Vec::new(),
            })
            .collect();
        Self {
            pages,
            page_size,
            current: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total bytes the cache can stage.
    pub fn capacity(&self) -> usize {
        self.page_size * self.pages.len()
    }

    pub fn free_pages(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| p.state == PageState::Empty)
            .count()
    }

    pub fn state(&self, page: u16) -> Option<PageState> {
        self.pages.get(page as usize).map(|p| p.state)
    }

    /// Bytes writable right now without waiting for a completion.
    ///
    /// With `fresh_page`, the current page is assumed to be sealed first
    /// (writing is about to move to another extent).
    pub fn available(&self, fresh_page: bool) -> usize {
        let n = self.pages.len();
        let current = &self.pages[self.current];
        let mut total = match current.state {
            PageState::AioPending => return 0,
            PageState::Empty => self.page_size,
            PageState::Filling if fresh_page => 0,
            PageState::Filling => self.page_size - current.buf.len(),
        };
        for i in 1..n {
            if self.pages[(self.current + i) % n].state != PageState::Empty {
                break;
            }
            total += self.page_size;
        }
        total
    }

    /// Buffered bytes not yet handed to storage.
    pub fn buffered(&self) -> usize {
        let current = &self.pages[self.current];
        match current.state {
            PageState::Filling => current.buf.len(),
            _ => 0,
        }
    }

    /// Copies `bytes` into the ring at extent offset `offset`.
    ///
    /// The caller has checked [`available`](Self::available). `token`, if
    /// any, is attached to the page receiving the last byte. Returns the pages
    /// that filled up.
    pub fn append(
        &mut self,
        serial: u64,
        file: &Arc<File>,
        offset: u64,
        bytes: &[u8],
        mut token: Option<DataToken>,
    ) -> Vec<PageWrite> {
        let mut sealed = Vec::new();
        let mut written = 0;
        while written < bytes.len() {
            let idx = self.current;
            let page_size = self.page_size;
            let page = &mut self.pages[idx];
            debug_assert!(page.state != PageState::AioPending, "write cache overrun");
            if page.state == PageState::Empty {
                page.state = PageState::Filling;
                page.serial = serial;
                page.file = Some(Arc::clone(file));
                page.offset = offset + written as u64;
                page.buf.clear();
            }
            let n = (page_size - page.buf.len()).min(bytes.len() - written);
            page.buf.extend_from_slice(&bytes[written..written + n]);
            written += n;
            if written == bytes.len() {
                if let Some(token) = token.take() {
                    page.tokens.push(token);
                }
            }
            if page.buf.len() == page_size {
                if let Some(write) = self.seal(idx) {
                    sealed.push(write);
                }
            }
        }
        sealed
    }

    /// Seals the current page if it holds any data.
    pub fn take_current(&mut self) -> Option<PageWrite> {
        let idx = self.current;
        let page = &self.pages[idx];
        if page.state == PageState::Filling && !page.buf.is_empty() {
            self.seal(idx)
        } else {
            None
        }
    }

    fn seal(&mut self, idx: usize) -> Option<PageWrite> {
        let n = self.pages.len();
        let page = &mut self.pages[idx];
        let file = page.file.take()?;
        page.state = PageState::AioPending;
        let write = PageWrite {
            page: idx as u16,
            serial: page.serial,
            file,
            offset: page.offset,
            data: mem::take(&mut page.buf),
        };
        if idx == self.current {
            self.current = (idx + 1) % n;
        }
        Some(write)
    }

    /// Returns a written page to the ring.
    ///
    /// `data` is the buffer handed out by the sealed [`PageWrite`].
    pub fn complete(&mut self, page: u16, mut data: Vec<u8>) -> Option<PageDone> {
        let page = self.pages.get_mut(page as usize)?;
        if page.state != PageState::AioPending {
            return None;
        }
        let bytes = data.len();
        data.clear();
        page.buf = data;
        page.state = PageState::Empty;
        Some(PageDone {
            serial: page.serial,
            bytes,
            tokens: mem::take(&mut page.tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    const PAGE: usize = SBLK_SIZE;

    fn file(dir: &TempDir) -> Arc<File> {
        Arc::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(dir.path().join("x"))
                .unwrap(),
        )
    }

    #[test]
    fn test_fresh_cache_is_fully_available() {
        let cache = WriteCache::new(4, 1);
        assert_eq!(cache.capacity(), 4 * PAGE);
        assert_eq!(cache.available(false), 4 * PAGE);
        assert_eq!(cache.free_pages(), 4);
    }

    #[test]
    fn test_record_spanning_pages() {
        let dir = TempDir::new().unwrap();
        let f = file(&dir);
        let mut cache = WriteCache::new(4, 1);
        let token = DataToken::new();

        let sealed = cache.append(1, &f, 4096, &vec![7u8; PAGE + 256], Some(token.clone()));
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].offset, 4096);
        assert_eq!(sealed[0].data.len(), PAGE);
        assert_eq!(cache.buffered(), 256);
        assert_eq!(cache.available(false), 3 * PAGE - 256);

        // Token sits with the tail, in the still-filling page.
        let done = cache.complete(sealed[0].page, sealed[0].data.clone()).unwrap();
        assert!(done.tokens.is_empty());

        let tail = cache.take_current().unwrap();
        assert_eq!(tail.offset, 4096 + PAGE as u64);
        let done = cache.complete(tail.page, tail.data).unwrap();
        assert_eq!(done.tokens, vec![token]);
        assert_eq!(done.bytes, 256);
    }

    #[test]
    fn test_pending_pages_block_the_ring() {
        let dir = TempDir::new().unwrap();
        let f = file(&dir);
        let mut cache = WriteCache::new(2, 1);

        let sealed = cache.append(1, &f, 0, &vec![0u8; 2 * PAGE], None);
        assert_eq!(sealed.len(), 2);
        assert_eq!(cache.available(false), 0);
        assert_eq!(cache.free_pages(), 0);

        cache.complete(sealed[0].page, Vec::new()).unwrap();
        assert_eq!(cache.available(false), PAGE);
    }

    #[test]
    fn test_fresh_page_excludes_partial_current() {
        let dir = TempDir::new().unwrap();
        let f = file(&dir);
        let mut cache = WriteCache::new(3, 1);
        cache.append(1, &f, 0, &[1u8; 128], None);
        assert_eq!(cache.available(false), 3 * PAGE - 128);
        assert_eq!(cache.available(true), 2 * PAGE);
    }

    #[test]
    fn test_partial_flush_continues_at_next_offset() {
        let dir = TempDir::new().unwrap();
        let f = file(&dir);
        let mut cache = WriteCache::new(2, 1);
        cache.append(1, &f, 4096, &[1u8; 128], None);
        let first = cache.take_current().unwrap();
        assert_eq!(first.data.len(), 128);
        assert!(cache.take_current().is_none());

        cache.append(1, &f, 4096 + 128, &[2u8; 128], None);
        let second = cache.take_current().unwrap();
        assert_eq!(second.offset, 4096 + 128);
        assert_ne!(first.page, second.page);
    }

    #[test]
    fn test_complete_ignores_idle_page() {
        let mut cache = WriteCache::new(2, 1);
        assert!(cache.complete(0, Vec::new()).is_none());
        assert!(cache.complete(9, Vec::new()).is_none());
    }
}
