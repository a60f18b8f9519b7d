//! Client sessions and per-RPC state.
//!
//! A `Session` wraps one connected queue pair to a server. Each RPC issued
//! on it is tracked by a `ClientRpc` slab entry that moves through the
//! state machine below and is linked into exactly one of the transport's
//! two intrusive lists while in flight:
//!
//! ```text
//! PENDING --send_or_queue--> (receive buffer reservable?)
//!    yes -> REQUEST_SENT            (on `outstanding_rpcs`)
//!    no  -> QUEUED                  (on `client_send_queue`)
//! QUEUED --buffer freed--> REQUEST_SENT
//! REQUEST_SENT --matching completion--> RESPONSE_RECEIVED
//! REQUEST_SENT | QUEUED --cancel--> CANCELLED
//! any --transport error--> FAILED
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::transport::Transport;
use crate::verbs::QueuePair;

/// State of a client RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Created, not yet admitted to the send path.
    Pending,
    /// Waiting for a receive buffer reservation; queued behind earlier RPCs.
    Queued,
    /// On the wire; a reply may arrive at any tick.
    RequestSent,
    /// Reply received and matched (terminal).
    ResponseReceived,
    /// Cancelled by the caller (terminal).
    Cancelled,
    /// The transport could not complete the RPC (terminal).
    Failed,
}

impl RpcState {
    /// Whether the RPC has reached a terminal state.
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            RpcState::ResponseReceived | RpcState::Cancelled | RpcState::Failed
        )
    }
}

/// Handle to a client RPC tracked by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHandle(pub(crate) usize);

/// State shared between a `Session` and the RPCs issued on it.
pub(crate) struct SessionCore {
    /// The session's queue pair; taken on release.
    pub(crate) qp: RefCell<Option<QueuePair>>,
    /// Set when the session is aborted; blocks further sends.
    pub(crate) aborted: RefCell<Option<String>>,
}

impl SessionCore {
    pub(crate) fn new(qp: QueuePair) -> Self {
        Self {
            qp: RefCell::new(Some(qp)),
            aborted: RefCell::new(None),
        }
    }
}

/// A client session over one connected queue pair.
///
/// Dropping the session destroys the queue pair and fails any of its RPCs
/// that are still in flight.
pub struct Session {
    transport: Rc<Transport>,
    core: Rc<SessionCore>,
}

impl Session {
    pub(crate) fn new(transport: Rc<Transport>, core: Rc<SessionCore>) -> Self {
        Self { transport, core }
    }

    /// Issue an RPC. The request is either posted immediately or queued
    /// behind receive-buffer backpressure.
    pub fn send_rpc(&self, request: Buffer) -> Result<RpcHandle> {
        self.transport.client_send(&self.core, request)
    }

    /// Cancel an RPC issued on this session.
    ///
    /// A request already on the wire is not recalled; its late reply is
    /// dropped when it arrives.
    pub fn cancel(&self, rpc: RpcHandle) {
        self.transport.cancel_rpc(rpc);
    }

    /// Abort the session: fail every in-flight RPC and refuse new ones.
    pub fn abort(&self, reason: &str) {
        self.transport.abort_session(&self.core, reason);
    }

    /// Whether the session's queue pair is plumbed and usable.
    pub fn is_connected(&self) -> bool {
        self.core.aborted.borrow().is_none()
            && self
                .core
                .qp
                .borrow()
                .as_ref()
                .map(|qp| qp.is_plumbed())
                .unwrap_or(false)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.transport.release_session(&self.core);
    }
}

/// Which intrusive list an RPC is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    Outstanding,
    SendQueue,
}

/// Intrusive linkage embedded in each RPC.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    list: Option<ListId>,
}

/// A client RPC tracked in the transport's slab.
pub(crate) struct ClientRpc {
    pub(crate) session: Rc<SessionCore>,
    pub(crate) nonce: u64,
    pub(crate) state: RpcState,
    pub(crate) request: Option<Buffer>,
    pub(crate) response: Option<Buffer>,
    pub(crate) error: Option<String>,
    pub(crate) link: Link,
}

impl ClientRpc {
    pub(crate) fn new(session: Rc<SessionCore>, nonce: u64, request: Buffer) -> Self {
        Self {
            session,
            nonce,
            state: RpcState::Pending,
            request: Some(request),
            response: Some(Buffer::new()),
            error: None,
            link: Link::default(),
        }
    }
}

/// Doubly-linked intrusive queue over slab indices.
///
/// Links live inside the RPC entries, so linking, unlinking, and removal
/// by value are O(1) and allocation-free; an RPC can be on at most one
/// queue at a time.
pub(crate) struct RpcQueue {
    id: ListId,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl RpcQueue {
    pub(crate) fn new(id: ListId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `idx` to the tail.
    ///
    /// # Panics
    /// Panics in debug builds if the RPC is already linked somewhere.
    pub(crate) fn push_back(&mut self, rpcs: &mut Slab<ClientRpc>, idx: usize) {
        debug_assert!(rpcs[idx].link.list.is_none());
        rpcs[idx].link = Link {
            prev: self.tail,
            next: None,
            list: Some(self.id),
        };
        match self.tail {
            Some(tail) => rpcs[tail].link.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Unlink `idx` from anywhere in the queue.
    pub(crate) fn remove(&mut self, rpcs: &mut Slab<ClientRpc>, idx: usize) {
        debug_assert_eq!(rpcs[idx].link.list, Some(self.id));
        let Link { prev, next, .. } = rpcs[idx].link;
        match prev {
            Some(p) => rpcs[p].link.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => rpcs[n].link.prev = prev,
            None => self.tail = prev,
        }
        rpcs[idx].link = Link::default();
        self.len -= 1;
    }

    /// Detach and return the head.
    pub(crate) fn pop_front(&mut self, rpcs: &mut Slab<ClientRpc>) -> Option<usize> {
        let head = self.head?;
        self.remove(rpcs, head);
        Some(head)
    }

    /// Walk the queue front to back, collecting indices.
    pub(crate) fn indices(&self, rpcs: &Slab<ClientRpc>) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            out.push(idx);
            cursor = rpcs[idx].link.next;
        }
        out
    }

    /// Which list, if any, `idx` is linked into.
    pub(crate) fn membership(rpcs: &Slab<ClientRpc>, idx: usize) -> Option<ListId> {
        rpcs[idx].link.list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{Cq, QpState, Srq};

    fn dummy_core() -> Rc<SessionCore> {
        Rc::new(SessionCore::new(QueuePair {
            local_qpn: 1,
            initial_psn: 0,
            port: 1,
            srq: Srq(0),
            tx_cq: Cq(0),
            rx_cq: Cq(1),
            state: QpState::Init,
            remote_lid: 0,
            remote_qpn: 0,
            remote_psn: 0,
        }))
    }

    fn insert(rpcs: &mut Slab<ClientRpc>, nonce: u64) -> usize {
        let core = dummy_core();
        rpcs.insert(ClientRpc::new(core, nonce, Buffer::new()))
    }

    #[test]
    fn test_queue_fifo() {
        let mut rpcs = Slab::new();
        let mut queue = RpcQueue::new(ListId::SendQueue);

        let a = insert(&mut rpcs, 1);
        let b = insert(&mut rpcs, 2);
        let c = insert(&mut rpcs, 3);
        queue.push_back(&mut rpcs, a);
        queue.push_back(&mut rpcs, b);
        queue.push_back(&mut rpcs, c);

        assert_eq!(queue.indices(&rpcs), vec![a, b, c]);
        assert_eq!(queue.pop_front(&mut rpcs), Some(a));
        assert_eq!(queue.pop_front(&mut rpcs), Some(b));
        assert_eq!(queue.pop_front(&mut rpcs), Some(c));
        assert_eq!(queue.pop_front(&mut rpcs), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_remove_middle() {
        let mut rpcs = Slab::new();
        let mut queue = RpcQueue::new(ListId::Outstanding);

        let a = insert(&mut rpcs, 1);
        let b = insert(&mut rpcs, 2);
        let c = insert(&mut rpcs, 3);
        queue.push_back(&mut rpcs, a);
        queue.push_back(&mut rpcs, b);
        queue.push_back(&mut rpcs, c);

        queue.remove(&mut rpcs, b);
        assert_eq!(queue.indices(&rpcs), vec![a, c]);
        assert_eq!(RpcQueue::membership(&rpcs, b), None);

        queue.remove(&mut rpcs, a);
        queue.remove(&mut rpcs, c);
        assert!(queue.is_empty());
        assert_eq!(queue.indices(&rpcs), Vec::<usize>::new());
    }

    #[test]
    fn test_queue_membership_is_exclusive() {
        let mut rpcs = Slab::new();
        let mut outstanding = RpcQueue::new(ListId::Outstanding);
        let mut send_queue = RpcQueue::new(ListId::SendQueue);

        let a = insert(&mut rpcs, 1);
        send_queue.push_back(&mut rpcs, a);
        assert_eq!(RpcQueue::membership(&rpcs, a), Some(ListId::SendQueue));

        send_queue.remove(&mut rpcs, a);
        outstanding.push_back(&mut rpcs, a);
        assert_eq!(RpcQueue::membership(&rpcs, a), Some(ListId::Outstanding));
    }

    #[test]
    fn test_state_terminality() {
        assert!(!RpcState::Pending.is_finished());
        assert!(!RpcState::Queued.is_finished());
        assert!(!RpcState::RequestSent.is_finished());
        assert!(RpcState::ResponseReceived.is_finished());
        assert!(RpcState::Cancelled.is_finished());
        assert!(RpcState::Failed.is_finished());
    }
}
