//! Verbs capability.
//!
//! `Infiniband` is the transport's only window onto the RDMA verbs layer:
//! device attributes, SRQ/CQ/QP creation, queue-pair plumbing, work-request
//! posting, completion polling, and memory registration. The transport
//! takes it as an injected `Rc<dyn Infiniband>` so tests can substitute an
//! in-process provider.
//!
//! Nothing here blocks. All waiting is the caller's responsibility.

use bitflags::bitflags;

use crate::buffer::BufferDescriptor;
use crate::error::Result;
use crate::handshake::QueuePairTuple;

bitflags! {
    /// Access flags for memory registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_READ = 2;
        const REMOTE_WRITE = 4;
    }
}

/// Handle to a shared receive queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Srq(pub u32);

/// Handle to a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cq(pub u32);

/// Handle to a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Provider-assigned region identifier.
    pub id: u32,
    /// Local key for scatter-gather entries referencing this region.
    pub lkey: u32,
}

/// Status of a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RemoteAccessError,
    RemoteInvalidRequestError,
    Unknown,
}

impl WcStatus {
    /// Human-readable status name for log messages.
    pub fn as_str(self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::LocalLengthError => "local length error",
            WcStatus::LocalProtectionError => "local protection error",
            WcStatus::WorkRequestFlushed => "work request flushed",
            WcStatus::RemoteAccessError => "remote access error",
            WcStatus::RemoteInvalidRequestError => "remote invalid request error",
            WcStatus::Unknown => "unknown",
        }
    }
}

/// One entry polled off a completion queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// The work-request ID posted with the request. The transport stashes
    /// the buffer address here so completions need no lookup table.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Bytes transferred (receives only).
    pub byte_len: u32,
    /// Local queue-pair number the completion arrived on.
    pub qp_num: u32,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::Unknown,
            byte_len: 0,
            qp_num: 0,
        }
    }
}

/// Queue-pair connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Created; local tuple known, remote end not yet plumbed.
    Init,
    /// Both ends' tuples exchanged; sends and receives may proceed.
    Plumbed,
}

/// One endpoint of a reliable connected queue pair.
///
/// Plain data; the provider tracks the underlying resources keyed by
/// `local_qpn`. Owned by a `Session` on the client side and by the
/// transport's queue-pair registry on the server side.
#[derive(Debug, Clone)]
pub struct QueuePair {
    /// Local queue-pair number.
    pub local_qpn: u32,
    /// Initial packet sequence number advertised during the handshake.
    pub initial_psn: u32,
    /// Physical port the pair is bound to.
    pub port: u8,
    /// Shared receive queue serving this pair.
    pub srq: Srq,
    /// Transmit completion queue.
    pub tx_cq: Cq,
    /// Receive completion queue.
    pub rx_cq: Cq,
    /// Connection state.
    pub state: QpState,
    /// Remote local identifier, valid once plumbed.
    pub remote_lid: u16,
    /// Remote queue-pair number, valid once plumbed.
    pub remote_qpn: u32,
    /// Remote initial packet sequence number, valid once plumbed.
    pub remote_psn: u32,
}

impl QueuePair {
    /// Whether the pair has completed its handshake.
    #[inline]
    pub fn is_plumbed(&self) -> bool {
        self.state == QpState::Plumbed
    }
}

/// Capability over the RDMA verbs layer.
///
/// Constructing a provider corresponds to opening a device; everything
/// else hangs off the instance (the protection domain is implicit in it).
pub trait Infiniband {
    /// Name of the opened HCA.
    fn device_name(&self) -> &str;

    /// Local identifier of the given physical port.
    fn lid(&self, port: u8) -> Result<u16>;

    /// Create a shared receive queue.
    fn create_srq(&self, depth: u32, max_sge: u32) -> Result<Srq>;

    /// Create a completion queue.
    fn create_cq(&self, depth: u32) -> Result<Cq>;

    /// Create a reliable connected queue pair bound to the given SRQ and
    /// completion queues. The pair starts in `Init`.
    fn create_queue_pair(
        &self,
        port: u8,
        srq: Srq,
        tx_cq: Cq,
        rx_cq: Cq,
        tx_depth: u32,
        rx_depth: u32,
    ) -> Result<QueuePair>;

    /// Drive the pair through INIT → RTR → RTS using the remote tuple.
    fn plumb(&self, qp: &mut QueuePair, remote: &QueuePairTuple) -> Result<()>;

    /// Release the resources behind a queue pair.
    fn destroy_queue_pair(&self, qpn: u32);

    /// Register a span of memory with the protection domain.
    fn register_memory(&self, addr: u64, len: usize, access: AccessFlags) -> Result<MemoryRegion>;

    /// Post a receive work request to a shared receive queue. The buffer
    /// address becomes the work-request ID.
    fn post_srq_receive(&self, srq: Srq, bd: &BufferDescriptor) -> Result<()>;

    /// Post a single-SGE send of `len` bytes from the buffer.
    fn post_send(&self, qp: &QueuePair, bd: &BufferDescriptor, len: u32) -> Result<()>;

    /// Post a two-SGE send: `header_len` bytes from the buffer followed by
    /// `payload_len` bytes straight out of a pre-registered region.
    fn post_send_zero_copy(
        &self,
        qp: &QueuePair,
        bd: &BufferDescriptor,
        header_len: u32,
        payload_addr: u64,
        payload_len: u32,
        payload_mr: &MemoryRegion,
    ) -> Result<()>;

    /// Poll a completion queue, filling `completions` from the front.
    /// Returns the number of entries written. Never blocks.
    fn poll_cq(&self, cq: Cq, completions: &mut [WorkCompletion]) -> usize;
}
