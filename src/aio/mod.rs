//! Asynchronous page I/O
//!
//! Page writes and reads are handed to a dedicated storage worker thread so
//! the submitting thread never waits on the disk. The worker executes requests
//! strictly in submission order (a write is synced before the next request
//! starts) and appends one [`AioEvent`] per request to a completion queue.
//!
//! Completions are not pushed into the journal. The journal pulls them with
//! [`AioContext::take_events`], either from its get-events timer, from an
//! explicit poll, or while blocked in a flush, and interprets them through its
//! [`AioCallback`] implementation.

pub(crate) mod fileio;

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::crash_point::{maybe_crash, points};
use crate::journal::DataToken;

/// Receiver of interpreted I/O completions.
///
/// Implemented by the journal. Must be callable from any thread, without the
/// caller holding any journal lock.
pub trait AioCallback: Send + Sync {
    /// Records whose final bytes have been durably written.
    fn write_completion_callback(&self, tokens: &[DataToken]);

    /// Read-cache pages whose contents have arrived.
    fn read_completion_callback(&self, pages: &[u16]);
}

/// Work item for the storage worker.
pub enum AioRequest {
    /// Write and sync `data` at `offset`.
    Write {
        page: u16,
        file: Arc<File>,
        offset: u64,
        data: Vec<u8>,
    },
    /// Read `len` bytes at `offset`.
    Read {
        page: u16,
        file: Arc<File>,
        offset: u64,
        len: usize,
    },
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AioRequest::Write {
                page, offset, data, ..
            } => f
                .debug_struct("Write")
                .field("page", page)
                .field("offset", offset)
                .field("len", &data.len())
                .finish(),
            AioRequest::Read {
                page, offset, len, ..
            } => f
                .debug_struct("Read")
                .field("page", page)
                .field("offset", offset)
                .field("len", len)
                .finish(),
        }
    }
}

/// Raw completion produced by the storage worker.
#[derive(Debug)]
pub enum AioEvent {
    /// The page buffer is handed back for reuse.
    Write {
        page: u16,
        data: Vec<u8>,
        result: io::Result<()>,
    },
    Read {
        page: u16,
        result: io::Result<Vec<u8>>,
    },
}

#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<AioEvent>>,
    ready: Condvar,
}

impl EventQueue {
    fn push(&self, event: AioEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event);
        }
        self.ready.notify_all();
    }
}

/// Handle to the storage worker and its completion queue.
pub struct AioContext {
    name: String,
    sender: Mutex<Option<Sender<AioRequest>>>,
    events: Arc<EventQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    in_flight: AtomicUsize,
}

impl AioContext {
    /// Spawns the storage worker.
    pub fn start(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let events = Arc::new(EventQueue::default());
        let worker_events = Arc::clone(&events);
        let worker = thread::Builder::new()
            .name(format!("aio-{}", name))
            .spawn(move || run_worker(receiver, worker_events))?;

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            events,
            worker: Mutex::new(Some(worker)),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Queues a request. Fails once the context is shut down.
    pub fn submit(&self, request: AioRequest) -> io::Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "aio sender lock poisoned"))?;
        let sender = sender
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "aio context shut down"))?;

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        sender.send(request).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            io::Error::new(io::ErrorKind::BrokenPipe, "aio worker exited")
        })
    }

    /// Removes and returns every queued completion without blocking.
    pub fn take_events(&self) -> Vec<AioEvent> {
        let drained: Vec<AioEvent> = match self.events.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            self.in_flight.fetch_sub(drained.len(), Ordering::AcqRel);
        }
        drained
    }

    /// Blocks until at least one completion is queued or `timeout` elapses.
    ///
    /// Returns whether completions are available. Does not consume them.
    pub fn wait_for_events(&self, timeout: Duration) -> bool {
        let events = match self.events.events.lock() {
            Ok(events) => events,
            Err(_) => return false,
        };
        match self
            .events
            .ready
            .wait_timeout_while(events, timeout, |events| events.is_empty())
        {
            Ok((events, _)) => !events.is_empty(),
            Err(_) => false,
        }
    }

    /// Requests submitted whose completion has not been taken yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stops accepting requests and joins the worker once it has drained
    /// everything already queued. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(context = %self.name, "aio worker panicked");
            }
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<AioRequest>, events: Arc<EventQueue>) {
    for request in receiver.iter() {
        let event = match request {
            AioRequest::Write {
                page,
                file,
                offset,
                data,
            } => {
                maybe_crash(points::AIO_BEFORE_PAGE_WRITE);
                let result = fileio::write_all_at(&file, &data, offset).and_then(|_| {
                    maybe_crash(points::AIO_AFTER_PAGE_WRITE);
                    file.sync_data()
                });
                maybe_crash(points::AIO_AFTER_PAGE_SYNC);
                AioEvent::Write { page, data, result }
            }
            AioRequest::Read {
                page,
                file,
                offset,
                len,
            } => {
                let mut buf = vec![0u8; len];
                let result = fileio::read_exact_at(&file, &mut buf, offset).map(|_| buf);
                AioEvent::Read { page, result }
            }
        };
        events.push(event);
    }
    debug!("aio worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_file(dir: &TempDir) -> Arc<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("extent"))
            .unwrap();
        file.set_len(8192).unwrap();
        Arc::new(file)
    }

    fn wait_for(ctx: &AioContext, count: usize) -> Vec<AioEvent> {
        let mut out = Vec::new();
        while out.len() < count {
            ctx.wait_for_events(Duration::from_secs(5));
            out.extend(ctx.take_events());
        }
        out
    }

    #[test]
    fn test_write_then_read_completes_in_order() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let ctx = AioContext::start("test").unwrap();

        ctx.submit(AioRequest::Write {
            page: 0,
            file: Arc::clone(&file),
            offset: 4096,
            data: b"journal page".to_vec(),
        })
        .unwrap();
        ctx.submit(AioRequest::Read {
            page: 1,
            file,
            offset: 4096,
            len: 12,
        })
        .unwrap();

        let events = wait_for(&ctx, 2);
        assert_eq!(ctx.in_flight(), 0);
        match &events[0] {
            AioEvent::Write { page, data, result } => {
                assert_eq!(*page, 0);
                assert_eq!(data, b"journal page");
                assert!(result.is_ok());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            AioEvent::Read { page, result } => {
                assert_eq!(*page, 1);
                assert_eq!(result.as_ref().unwrap(), b"journal page");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_read_failure_reported() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let ctx = AioContext::start("test").unwrap();
        ctx.submit(AioRequest::Read {
            page: 3,
            file,
            offset: 8000,
            len: 1024,
        })
        .unwrap();

        let events = wait_for(&ctx, 1);
        assert!(matches!(&events[0], AioEvent::Read { page: 3, result: Err(_) }));
    }

    #[test]
    fn test_wait_times_out_without_events() {
        let ctx = AioContext::start("idle").unwrap();
        assert!(!ctx.wait_for_events(Duration::from_millis(20)));
        assert!(ctx.take_events().is_empty());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir);
        let ctx = AioContext::start("closed").unwrap();
        ctx.shutdown();
        ctx.shutdown();
        let err = ctx
            .submit(AioRequest::Write {
                page: 0,
                file,
                offset: 0,
                data: vec![1],
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(ctx.in_flight(), 0);
    }
}
