//! Data tokens: caller-held handles correlating submissions with completions

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Write state of the most recent operation submitted with a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Never submitted.
    None,
    /// Some chunks of an enqueue have been submitted, not all.
    EnqueuePartial,
    EnqueuePending,
    Enqueued,
    DequeuePending,
    Dequeued,
    AbortPending,
    Aborted,
    CommitPending,
    Committed,
    PreparePending,
    Prepared,
    /// A write carrying this token failed.
    Failed,
}

impl TokenState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            TokenState::EnqueuePartial
                | TokenState::EnqueuePending
                | TokenState::DequeuePending
                | TokenState::AbortPending
                | TokenState::CommitPending
                | TokenState::PreparePending
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::None => "none",
            TokenState::EnqueuePartial => "enqueue_partial",
            TokenState::EnqueuePending => "enqueue_pending",
            TokenState::Enqueued => "enqueued",
            TokenState::DequeuePending => "dequeue_pending",
            TokenState::Dequeued => "dequeued",
            TokenState::AbortPending => "abort_pending",
            TokenState::Aborted => "aborted",
            TokenState::CommitPending => "commit_pending",
            TokenState::Committed => "committed",
            TokenState::PreparePending => "prepare_pending",
            TokenState::Prepared => "prepared",
            TokenState::Failed => "failed",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of record an operation wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Enqueue,
    Dequeue,
    Abort,
    Commit,
    Prepare,
}

impl OpKind {
    fn pending_state(self) -> TokenState {
        match self {
            OpKind::Enqueue => TokenState::EnqueuePending,
            OpKind::Dequeue => TokenState::DequeuePending,
            OpKind::Abort => TokenState::AbortPending,
            OpKind::Commit => TokenState::CommitPending,
            OpKind::Prepare => TokenState::PreparePending,
        }
    }

    fn durable_state(self) -> TokenState {
        match self {
            OpKind::Enqueue => TokenState::Enqueued,
            OpKind::Dequeue => TokenState::Dequeued,
            OpKind::Abort => TokenState::Aborted,
            OpKind::Commit => TokenState::Committed,
            OpKind::Prepare => TokenState::Prepared,
        }
    }
}

/// An operation awaiting durability, with the bookkeeping its durability
/// settles.
#[derive(Debug)]
pub(crate) struct TokenOp {
    pub kind: OpKind,
    /// Extent serials each losing one reference once this record is durable.
    pub release: Vec<u64>,
    /// Transaction whose outcome this record makes durable.
    pub resolves: Option<Vec<u8>>,
}

impl TokenOp {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            release: Vec::new(),
            resolves: None,
        }
    }
}

#[derive(Debug)]
struct TokenData {
    state: TokenState,
    rid: Option<u64>,
    dequeue_rid: Option<u64>,
    xid: Option<Vec<u8>>,
    external: bool,
    transient: bool,
    pending: VecDeque<TokenOp>,
}

struct TokenInner {
    id: u64,
    data: Mutex<TokenData>,
}

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation handle for one message's records.
///
/// The same token is passed to the enqueue of a message and later to its
/// dequeue. A token must not be resubmitted while an operation on it is
/// still pending. Clones share state.
#[derive(Clone)]
pub struct DataToken {
    inner: Arc<TokenInner>,
}

impl DataToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(TokenData {
                    state: TokenState::None,
                    rid: None,
                    dequeue_rid: None,
                    xid: None,
                    external: false,
                    transient: false,
                    pending: VecDeque::new(),
                }),
            }),
        }
    }

    /// Token for a record found by recovery: already durable.
    pub(crate) fn recovered(rid: u64, xid: Option<Vec<u8>>, external: bool) -> Self {
        let token = Self::new();
        {
            let mut data = token.data();
            data.state = TokenState::Enqueued;
            data.rid = Some(rid);
            data.xid = xid;
            data.external = external;
        }
        token
    }

    fn data(&self) -> MutexGuard<'_, TokenData> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique identity of this token.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Record id assigned to the enqueue.
    pub fn rid(&self) -> Option<u64> {
        self.data().rid
    }

    /// Record id assigned to the dequeue, once dequeued.
    pub fn dequeue_rid(&self) -> Option<u64> {
        self.data().dequeue_rid
    }

    /// Transaction the latest operation belonged to.
    pub fn xid(&self) -> Option<Vec<u8>> {
        self.data().xid.clone()
    }

    pub fn state(&self) -> TokenState {
        self.data().state
    }

    pub fn is_external(&self) -> bool {
        self.data().external
    }

    pub fn is_transient(&self) -> bool {
        self.data().transient
    }

    /// Every operation submitted with this token has been confirmed written.
    pub fn is_durable(&self) -> bool {
        let data = self.data();
        data.pending.is_empty()
            && !matches!(
                data.state,
                TokenState::None | TokenState::EnqueuePartial | TokenState::Failed
            )
    }

    /// Operations submitted but not yet confirmed.
    pub fn pending_ops(&self) -> usize {
        self.data().pending.len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        let data = self.data();
        !data.pending.is_empty() || data.state == TokenState::EnqueuePartial
    }

    pub(crate) fn begin_enqueue(
        &self,
        rid: u64,
        xid: Option<&[u8]>,
        external: bool,
        transient: bool,
    ) {
        let mut data = self.data();
        data.state = TokenState::EnqueuePartial;
        data.rid = Some(rid);
        data.dequeue_rid = None;
        data.xid = xid.map(|x| x.to_vec());
        data.external = external;
        data.transient = transient;
    }

    /// Abandons a partial enqueue that never reached the cache.
    pub(crate) fn reset(&self) {
        let mut data = self.data();
        data.state = TokenState::None;
        data.rid = None;
        data.xid = None;
    }

    pub(crate) fn set_dequeue(&self, rid: u64, xid: Option<&[u8]>) {
        let mut data = self.data();
        data.dequeue_rid = Some(rid);
        data.xid = xid.map(|x| x.to_vec());
    }

    pub(crate) fn set_xid(&self, xid: &[u8]) {
        self.data().xid = Some(xid.to_vec());
    }

    pub(crate) fn push_op(&self, op: TokenOp) {
        let mut data = self.data();
        data.state = op.kind.pending_state();
        data.pending.push_back(op);
    }

    /// Confirms the oldest pending operation.
    ///
    /// The token reports that operation's durable state once nothing newer
    /// is pending.
    pub(crate) fn complete(&self) -> Option<TokenOp> {
        let mut data = self.data();
        let op = data.pending.pop_front()?;
        if data.pending.is_empty() && data.state != TokenState::Failed {
            data.state = op.kind.durable_state();
        }
        Some(op)
    }

    pub(crate) fn fail(&self) {
        let mut data = self.data();
        data.state = TokenState::Failed;
        data.pending.clear();
    }
}

impl Default for DataToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DataToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DataToken {}

impl fmt::Debug for DataToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("DataToken")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("rid", &data.rid)
            .field("dequeue_rid", &data.dequeue_rid)
            .field("pending", &data.pending.len())
            .finish()
    }
}
