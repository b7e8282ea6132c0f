//! Read pages used while recovering
//!
//! Recovery streams each extent through a small ring of pages. Reads are
//! issued in order; completions may be observed in any batch, and the cursor
//! only advances over pages that are ready in sequence.

use std::mem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadState {
    Empty,
    Pending { seq: u64 },
    /// Data has arrived but the completion has not been dispatched yet.
    Filled { seq: u64 },
    Ready { seq: u64 },
    Failed { seq: u64, error: String },
}

pub(crate) struct ReadCache {
    pages: Vec<(ReadState, Vec<u8>)>,
    page_size: usize,
    /// Next sequence number to issue.
    next_seq: u64,
    /// Next sequence number to hand to the consumer.
    cursor: u64,
}

impl ReadCache {
    pub fn new(pages: u16, page_size: usize) -> Self {
        Self {
            pages: (0..pages).map(|_| (ReadState::Empty, Vec::new())).collect(),
            page_size,
            next_seq: 0,
            cursor: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Restarts sequencing for a new extent. All pages must be idle.
    pub fn reset(&mut self) {
        for (state, data) in &mut self.pages {
            *state = ReadState::Empty;
            data.clear();
        }
        self.next_seq = 0;
        self.cursor = 0;
    }

    /// Claims the page for the next sequence number, if it is free.
    pub fn claim(&mut self) -> Option<(u16, u64)> {
        let n = self.pages.len() as u64;
        let idx = (self.next_seq % n) as usize;
        if self.pages[idx].0 != ReadState::Empty {
            return None;
        }
        let seq = self.next_seq;
        self.pages[idx].0 = ReadState::Pending { seq };
        self.next_seq += 1;
        Some((idx as u16, seq))
    }

    /// Stores the outcome of a read.
    pub fn fill(&mut self, page: u16, result: Result<Vec<u8>, String>) {
        if let Some((state, data)) = self.pages.get_mut(page as usize) {
            if let ReadState::Pending { seq } = *state {
                *state = match result {
                    Ok(bytes) => {
                        *data = bytes;
                        ReadState::Filled { seq }
                    }
                    Err(error) => ReadState::Failed { seq, error },
                };
            }
        }
    }

    /// Marks filled pages ready for consumption.
    pub fn mark_ready(&mut self, pages: &[u16]) {
        for page in pages {
            if let Some((state, _)) = self.pages.get_mut(*page as usize) {
                if let ReadState::Filled { seq } = *state {
                    *state = ReadState::Ready { seq };
                }
            }
        }
    }

    /// Takes the page at the cursor if it is ready, advancing the cursor.
    ///
    /// Returns `Err` if that page's read failed.
    pub fn take_next(&mut self) -> Result<Option<Vec<u8>>, String> {
        let n = self.pages.len() as u64;
        let idx = (self.cursor % n) as usize;
        match &self.pages[idx].0 {
            ReadState::Ready { seq } if *seq == self.cursor => {}
            ReadState::Failed { seq, error } if *seq == self.cursor => return Err(error.clone()),
            _ => return Ok(None),
        }
        let (state, data) = &mut self.pages[idx];
        *state = ReadState::Empty;
        self.cursor += 1;
        Ok(Some(mem::take(data)))
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn issued(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_consumption() {
        let mut cache = ReadCache::new(2, 16);
        let (p0, s0) = cache.claim().unwrap();
        let (p1, s1) = cache.claim().unwrap();
        assert_eq!((s0, s1), (0, 1));
        assert!(cache.claim().is_none());

        // Second page completes first; cursor must wait for the first.
        cache.fill(p1, Ok(vec![2; 16]));
        cache.mark_ready(&[p1]);
        assert_eq!(cache.take_next().unwrap(), None);

        cache.fill(p0, Ok(vec![1; 16]));
        cache.mark_ready(&[p0]);
        assert_eq!(cache.take_next().unwrap(), Some(vec![1; 16]));
        assert_eq!(cache.take_next().unwrap(), Some(vec![2; 16]));
        assert_eq!(cache.cursor(), 2);

        // Pages are reusable once consumed.
        assert_eq!(cache.claim(), Some((0, 2)));
    }

    #[test]
    fn test_filled_page_waits_for_dispatch() {
        let mut cache = ReadCache::new(1, 16);
        let (p, _) = cache.claim().unwrap();
        cache.fill(p, Ok(vec![0; 16]));
        assert_eq!(cache.take_next().unwrap(), None);
        cache.mark_ready(&[p]);
        assert!(cache.take_next().unwrap().is_some());
    }

    #[test]
    fn test_failed_read_surfaces() {
        let mut cache = ReadCache::new(1, 16);
        let (p, _) = cache.claim().unwrap();
        cache.fill(p, Err("bad sector".into()));
        assert_eq!(cache.take_next(), Err("bad sector".to_string()));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut cache = ReadCache::new(2, 16);
        cache.claim().unwrap();
        cache.reset();
        assert_eq!(cache.issued(), 0);
        assert_eq!(cache.claim(), Some((0, 0)));
    }
}
