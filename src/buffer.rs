//! Buffer management.
//!
//! Two kinds of buffer live here. `RegisteredPool` is a fixed set of
//! equally-sized slots carved out of one contiguous allocation that is
//! registered with the protection domain exactly once; the transport's RX
//! and TX pools are both of this kind, and slots are loaned out by
//! `BufferDescriptor` handle. `Buffer` is the chunked message type passed
//! across the transport interface: a request or response is a sequence of
//! owned byte chunks, caller-registered region slices, and receive-buffer
//! loans.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::verbs::{AccessFlags, Infiniband, MemoryRegion};

/// Alignment of pool allocations.
pub const POOL_ALIGN: usize = 4096;

/// Handle to one slot of a registered pool.
///
/// Lifetime equals the pool's. Ownership of the slot is loaned to a work
/// request by posting, and returned when the matching completion is
/// processed; the slot address rides in the work-request ID so completions
/// can recover the handle without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Slot base address.
    pub addr: u64,
    /// Slot capacity in bytes.
    pub len: u32,
    /// Local key of the pool's memory region.
    pub lkey: u32,
    /// Slot index within the pool.
    pub index: u32,
}

/// A pool of equally-sized buffers registered once with the HCA.
pub struct RegisteredPool {
    base: NonNull<u8>,
    slot_size: usize,
    count: usize,
    layout: Layout,
    mr: MemoryRegion,
}

impl RegisteredPool {
    /// Allocate and register a pool of `count` slots of `slot_size` bytes.
    pub fn new(ib: &dyn Infiniband, count: usize, slot_size: usize) -> Result<Self> {
        assert!(count > 0 && slot_size > 0);

        let layout = Layout::from_size_align(count * slot_size, POOL_ALIGN)
            .map_err(|_| Error::Verbs("bad pool layout"))?;
        let base = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "failed to allocate buffer pool",
                )));
            }
            NonNull::new_unchecked(ptr)
        };

        let mr = match ib.register_memory(
            base.as_ptr() as u64,
            count * slot_size,
            AccessFlags::LOCAL_WRITE,
        ) {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { dealloc(base.as_ptr(), layout) };
                return Err(e);
            }
        };

        Ok(Self {
            base,
            slot_size,
            count,
            layout,
            mr,
        })
    }

    /// Handle for slot `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn descriptor(&self, index: u32) -> BufferDescriptor {
        assert!((index as usize) < self.count);
        BufferDescriptor {
            addr: self.base.as_ptr() as u64 + index as u64 * self.slot_size as u64,
            len: self.slot_size as u32,
            lkey: self.mr.lkey,
            index,
        }
    }

    /// Recover a slot index from a slot base address (a work-request ID).
    pub fn index_of_addr(&self, addr: u64) -> Option<u32> {
        let base = self.base.as_ptr() as u64;
        if addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % self.slot_size as u64 != 0 {
            return None;
        }
        let index = offset / self.slot_size as u64;
        if (index as usize) < self.count {
            Some(index as u32)
        } else {
            None
        }
    }

    /// Raw pointer to a slot.
    #[inline]
    pub fn slot_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.count);
        unsafe { self.base.as_ptr().add(index as usize * self.slot_size) }
    }

    /// The full slot as a byte slice.
    #[inline]
    pub fn slot_slice(&self, index: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr(index), self.slot_size) }
    }

    /// Slot size in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The pool's memory region.
    #[inline]
    pub fn mr(&self) -> MemoryRegion {
        self.mr
    }
}

impl Drop for RegisteredPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Which shared receive queue a loaned buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrqKind {
    Client,
    Server,
}

/// Return channel for loaned receive buffers.
///
/// Chunk drops push the slot here from whatever thread drops them; the
/// dispatch thread drains the queue and reposts each slot to its SRQ. This
/// is what keeps all verbs calls on the dispatch thread.
#[derive(Clone)]
pub struct BufferReturner {
    returned: Arc<Mutex<Vec<(SrqKind, u32)>>>,
}

impl BufferReturner {
    pub(crate) fn new() -> Self {
        Self {
            returned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, srq: SrqKind, index: u32) {
        self.returned.lock().push((srq, index));
    }

    /// Take everything returned since the last drain.
    pub(crate) fn drain(&self) -> Vec<(SrqKind, u32)> {
        std::mem::take(&mut *self.returned.lock())
    }
}

/// A span of a receive buffer out on loan to a message.
///
/// Dropping the chunk returns the underlying slot to its shared receive
/// queue, exactly once, via the transport's return channel.
pub struct PayloadChunk {
    addr: u64,
    len: u32,
    srq: SrqKind,
    index: u32,
    returner: BufferReturner,
}

impl PayloadChunk {
    pub(crate) fn new(
        addr: u64,
        len: u32,
        srq: SrqKind,
        index: u32,
        returner: BufferReturner,
    ) -> Self {
        Self {
            addr,
            len,
            srq,
            index,
            returner,
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // Valid while the owning pool lives, which the transport guarantees
        // outlasts every loan it hands out.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len as usize) }
    }
}

impl Drop for PayloadChunk {
    fn drop(&mut self) {
        self.returner.push(self.srq, self.index);
    }
}

/// One chunk of a message.
pub enum Chunk {
    /// Bytes owned by the message.
    Owned(Vec<u8>),
    /// A slice of caller-owned memory, typically inside the registered log
    /// region. The caller keeps it valid for the life of the message.
    Region { addr: u64, len: u32 },
    /// A receive buffer on loan from one of the SRQs.
    Loaned(PayloadChunk),
}

impl Chunk {
    /// Bytes in this chunk.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Owned(v) => v.len(),
            Chunk::Region { len, .. } => *len as usize,
            Chunk::Loaned(p) => p.len as usize,
        }
    }

    /// The chunk's bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Owned(v) => v.as_slice(),
            Chunk::Region { addr, len } => unsafe {
                std::slice::from_raw_parts(*addr as *const u8, *len as usize)
            },
            Chunk::Loaned(p) => p.as_slice(),
        }
    }
}

/// A chunked message buffer.
///
/// Requests and responses cross the transport interface as `Buffer`s so
/// that payload bytes never have to be made contiguous: a send gathers the
/// chunks into a transmit buffer (or posts the second chunk zero-copy), and
/// a response can surface the receive buffer itself as a loaned chunk.
#[derive(Default)]
pub struct Buffer {
    chunks: Vec<Chunk>,
    total: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a copy of `bytes`.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
        self.chunks.push(Chunk::Owned(bytes.to_vec()));
    }

    /// Append an owned chunk without copying.
    pub fn append_vec(&mut self, bytes: Vec<u8>) {
        self.total += bytes.len();
        self.chunks.push(Chunk::Owned(bytes));
    }

    /// Append a reference to caller-owned memory.
    ///
    /// # Safety
    /// `addr..addr + len` must stay valid and unmodified for the life of
    /// this buffer.
    pub unsafe fn append_region(&mut self, addr: u64, len: u32) {
        self.total += len as usize;
        self.chunks.push(Chunk::Region { addr, len });
    }

    pub(crate) fn append_loaned(&mut self, chunk: PayloadChunk) {
        self.total += chunk.len as usize;
        self.chunks.push(Chunk::Loaned(chunk));
    }

    /// Total bytes across all chunks.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Whether the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk `i`, if present.
    #[inline]
    pub fn chunk(&self, i: usize) -> Option<&Chunk> {
        self.chunks.get(i)
    }

    /// Drop all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }

    /// Gather the whole message into `dst`, returning the bytes written.
    ///
    /// # Panics
    /// Panics if `dst` is shorter than `total_len()`.
    pub fn gather_into(&self, dst: &mut [u8]) -> usize {
        let mut offset = 0;
        for chunk in &self.chunks {
            let bytes = chunk.as_slice();
            dst[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        }
        offset
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// Returns false if the buffer does not cover the requested range.
    pub fn copy_out(&self, mut offset: usize, dst: &mut [u8]) -> bool {
        if offset + dst.len() > self.total {
            return false;
        }
        let mut written = 0;
        for chunk in &self.chunks {
            let bytes = chunk.as_slice();
            if offset >= bytes.len() {
                offset -= bytes.len();
                continue;
            }
            let take = (bytes.len() - offset).min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&bytes[offset..offset + take]);
            written += take;
            offset = 0;
            if written == dst.len() {
                break;
            }
        }
        written == dst.len()
    }

    /// The whole message as one owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total];
        self.gather_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::handshake::QueuePairTuple;
    use crate::verbs::{Cq, QueuePair, Srq, WorkCompletion};
    use std::cell::Cell;

    struct RegisterOnly {
        registered: Cell<usize>,
    }

    impl RegisterOnly {
        fn new() -> Self {
            Self {
                registered: Cell::new(0),
            }
        }
    }

    impl Infiniband for RegisterOnly {
        fn device_name(&self) -> &str {
            "regonly"
        }
        fn lid(&self, _port: u8) -> Result<u16> {
            unreachable!()
        }
        fn create_srq(&self, _depth: u32, _max_sge: u32) -> Result<Srq> {
            unreachable!()
        }
        fn create_cq(&self, _depth: u32) -> Result<Cq> {
            unreachable!()
        }
        fn create_queue_pair(
            &self,
            _port: u8,
            _srq: Srq,
            _tx_cq: Cq,
            _rx_cq: Cq,
            _tx_depth: u32,
            _rx_depth: u32,
        ) -> Result<QueuePair> {
            unreachable!()
        }
        fn plumb(&self, _qp: &mut QueuePair, _remote: &QueuePairTuple) -> Result<()> {
            unreachable!()
        }
        fn destroy_queue_pair(&self, _qpn: u32) {}
        fn register_memory(
            &self,
            _addr: u64,
            _len: usize,
            _access: AccessFlags,
        ) -> Result<MemoryRegion> {
            let id = self.registered.get() as u32;
            self.registered.set(self.registered.get() + 1);
            Ok(MemoryRegion { id, lkey: 0x1000 + id })
        }
        fn post_srq_receive(&self, _srq: Srq, _bd: &BufferDescriptor) -> Result<()> {
            unreachable!()
        }
        fn post_send(&self, _qp: &QueuePair, _bd: &BufferDescriptor, _len: u32) -> Result<()> {
            unreachable!()
        }
        fn post_send_zero_copy(
            &self,
            _qp: &QueuePair,
            _bd: &BufferDescriptor,
            _header_len: u32,
            _payload_addr: u64,
            _payload_len: u32,
            _payload_mr: &MemoryRegion,
        ) -> Result<()> {
            unreachable!()
        }
        fn poll_cq(&self, _cq: Cq, _completions: &mut [WorkCompletion]) -> usize {
            0
        }
    }

    #[test]
    fn test_pool_registers_once() {
        let ib = RegisterOnly::new();
        let _pool = RegisteredPool::new(&ib, 8, 1024).unwrap();
        assert_eq!(ib.registered.get(), 1);
    }

    #[test]
    fn test_pool_descriptor_addressing() {
        let ib = RegisterOnly::new();
        let pool = RegisteredPool::new(&ib, 4, 512).unwrap();

        for i in 0..4 {
            let bd = pool.descriptor(i);
            assert_eq!(bd.index, i);
            assert_eq!(bd.len, 512);
            assert_eq!(pool.index_of_addr(bd.addr), Some(i));
        }

        let bd0 = pool.descriptor(0);
        assert_eq!(pool.index_of_addr(bd0.addr + 1), None);
        assert_eq!(pool.index_of_addr(bd0.addr + 4 * 512), None);
        assert_eq!(pool.index_of_addr(bd0.addr.wrapping_sub(512)), None);
    }

    #[test]
    fn test_pool_alignment() {
        let ib = RegisterOnly::new();
        let pool = RegisteredPool::new(&ib, 2, 4096).unwrap();
        assert_eq!(pool.descriptor(0).addr as usize % POOL_ALIGN, 0);
    }

    #[test]
    fn test_buffer_gather() {
        let mut buf = Buffer::new();
        buf.append_bytes(b"hello ");
        buf.append_vec(b"world".to_vec());
        assert_eq!(buf.total_len(), 11);
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.to_vec(), b"hello world");

        let mut mid = [0u8; 5];
        assert!(buf.copy_out(3, &mut mid));
        assert_eq!(&mid, b"lo wo");
        assert!(!buf.copy_out(8, &mut [0u8; 5]));
    }

    #[test]
    fn test_buffer_region_chunk() {
        let backing = b"0123456789".to_vec();
        let mut buf = Buffer::new();
        unsafe { buf.append_region(backing.as_ptr() as u64 + 2, 4) };
        assert_eq!(buf.to_vec(), b"2345");
        drop(buf);
        drop(backing);
    }

    #[test]
    fn test_loan_returns_exactly_once() {
        let returner = BufferReturner::new();
        let backing = vec![7u8; 16];

        let mut buf = Buffer::new();
        buf.append_loaned(PayloadChunk::new(
            backing.as_ptr() as u64,
            16,
            SrqKind::Client,
            3,
            returner.clone(),
        ));
        assert_eq!(buf.to_vec(), backing);
        assert!(returner.drain().is_empty());

        drop(buf);
        assert_eq!(returner.drain(), vec![(SrqKind::Client, 3)]);
        assert!(returner.drain().is_empty());
    }
}
