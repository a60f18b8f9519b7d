//! Reliable RPC transport over Infiniband RC queue pairs.
//!
//! Handshaking runs over IP/UDP; addressing is plain IP/UDP because queue
//! pair setup is bootstrapped that way. The transport keeps common pools
//! of receive and transmit buffers pre-registered with the HCA. All
//! receive buffers sit on two shared receive queues (one serving every
//! server-role queue pair, one serving every client-role queue pair), so
//! buffers never have to be posted per pair. Each SRQ drains into its own
//! completion queue, and a single completion queue covers all transmits.
//!
//! Every buffer is sized for the largest possible RPC: the HCA will not
//! search the receive queue for a bigger posted buffer, nor scatter one
//! message across several, so an undersized buffer at the head of the
//! queue errors out both ends of the connection.
//!
//! Receive completions carry the posted buffer's address in their 64-bit
//! work-request ID, which the pools turn back into a slot handle by
//! arithmetic.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use fnv::FnvHashMap;
use log::{debug, error, warn};
use slab::Slab;

use crate::buffer::{
    Buffer, BufferDescriptor, BufferReturner, Chunk, PayloadChunk, RegisteredPool, SrqKind,
};
use crate::config::{ServiceLocator, TransportConfig};
use crate::error::{Error, Result};
use crate::handshake::{HandshakeEndpoint, QueuePairTuple};
use crate::session::{ClientRpc, ListId, RpcHandle, RpcQueue, RpcState, Session, SessionCore};
use crate::time::{Clock, MonotonicClock};
use crate::verbs::{
    AccessFlags, Cq, Infiniband, MemoryRegion, QueuePair, Srq, WcStatus, WorkCompletion,
};
use crate::wire::{MessageHeader, MESSAGE_HEADER_SIZE};
use crate::worker::{ServerRpc, WorkerManager};

/// A caller-registered memory region eligible for zero-copy sends.
struct LogRegion {
    base: u64,
    len: usize,
    mr: MemoryRegion,
}

/// The transport.
///
/// Owns the buffer pools, both shared receive queues, the three completion
/// queues, and the server-side queue-pair registry. All of that state is
/// touched only from the dispatch thread; the sole cross-thread pieces are
/// the worker manager's completed queue and the buffer return channel.
pub struct Transport {
    ib: Rc<dyn Infiniband>,
    clock: Rc<dyn Clock>,
    config: TransportConfig,
    port: u8,
    lid: u16,
    locator: Option<ServiceLocator>,
    endpoint: HandshakeEndpoint,

    server_srq: Srq,
    client_srq: Srq,
    server_rx_cq: Cq,
    client_rx_cq: Cq,
    common_tx_cq: Cq,

    rx_pool: RegisteredPool,
    tx_pool: RegisteredPool,
    free_tx_buffers: RefCell<Vec<BufferDescriptor>>,

    /// Server-side queue pairs, keyed by local QPN.
    queue_pair_map: RefCell<FnvHashMap<u32, QueuePair>>,

    rpcs: RefCell<Slab<ClientRpc>>,
    outstanding_rpcs: RefCell<RpcQueue>,
    client_send_queue: RefCell<RpcQueue>,
    /// Client SRQ buffers not currently posted: reserved by an outstanding
    /// RPC for its reply, in flight to us, or out on loan to a response.
    num_used_client_srq_buffers: Cell<usize>,

    returner: BufferReturner,
    log_region: RefCell<Option<LogRegion>>,
}

impl Transport {
    /// Construct a client-only transport (no setup socket is bound; the
    /// server-side poller stays idle).
    pub fn new(ib: Rc<dyn Infiniband>, config: TransportConfig) -> Result<Self> {
        Self::with_clock(ib, None, config, Rc::new(MonotonicClock::new()))
    }

    /// Construct a server transport listening for handshakes at the
    /// locator's UDP endpoint.
    pub fn with_locator(
        ib: Rc<dyn Infiniband>,
        locator: ServiceLocator,
        config: TransportConfig,
    ) -> Result<Self> {
        Self::with_clock(ib, Some(locator), config, Rc::new(MonotonicClock::new()))
    }

    /// Full constructor with an injected clock.
    pub fn with_clock(
        ib: Rc<dyn Infiniband>,
        locator: Option<ServiceLocator>,
        config: TransportConfig,
        clock: Rc<dyn Clock>,
    ) -> Result<Self> {
        let port = locator.as_ref().map(|sl| sl.dev_port).unwrap_or(1);

        let endpoint = match &locator {
            Some(sl) => HandshakeEndpoint::server(sl.addr)?,
            None => HandshakeEndpoint::client_only()?,
        };
        if let Some(addr) = endpoint.server_addr() {
            debug!("listening for handshakes on UDP {}", addr);
        }

        let lid = ib.lid(port)?;

        let server_srq = ib.create_srq(config.srq_depth as u32, config.srq_sge)?;
        let client_srq = ib.create_srq(config.srq_depth as u32, config.srq_sge)?;
        let server_rx_cq = ib.create_cq(config.srq_depth as u32)?;
        let client_rx_cq = ib.create_cq(config.srq_depth as u32)?;
        let common_tx_cq = ib.create_cq(config.tx_depth as u32)?;

        // Slots hold the in-band header on top of a maximum-sized payload.
        let slot_size = config.max_rpc_size + MESSAGE_HEADER_SIZE;
        let rx_pool = RegisteredPool::new(&*ib, config.srq_depth * 2, slot_size)?;
        let tx_pool = RegisteredPool::new(&*ib, config.tx_depth, slot_size)?;

        // Seed the receive pool half into each shared receive queue.
        for i in 0..config.srq_depth * 2 {
            let bd = rx_pool.descriptor(i as u32);
            let srq = if i < config.srq_depth {
                server_srq
            } else {
                client_srq
            };
            ib.post_srq_receive(srq, &bd)?;
        }

        let free_tx_buffers = (0..config.tx_depth)
            .map(|i| tx_pool.descriptor(i as u32))
            .collect();

        Ok(Self {
            ib,
            clock,
            config,
            port,
            lid,
            locator,
            endpoint,
            server_srq,
            client_srq,
            server_rx_cq,
            client_rx_cq,
            common_tx_cq,
            rx_pool,
            tx_pool,
            free_tx_buffers: RefCell::new(free_tx_buffers),
            queue_pair_map: RefCell::new(FnvHashMap::default()),
            rpcs: RefCell::new(Slab::new()),
            outstanding_rpcs: RefCell::new(RpcQueue::new(ListId::Outstanding)),
            client_send_queue: RefCell::new(RpcQueue::new(ListId::SendQueue)),
            num_used_client_srq_buffers: Cell::new(0),
            returner: BufferReturner::new(),
            log_region: RefCell::new(None),
        })
    }

    /// The locator string this transport was configured with, if any.
    pub fn service_locator(&self) -> Option<&str> {
        self.locator.as_ref().map(|sl| sl.as_str())
    }

    /// The bound setup-socket address (servers only). Useful when the
    /// locator asked for an ephemeral port.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.endpoint.server_addr()
    }

    /// Whether this transport services incoming RPCs.
    pub fn is_server(&self) -> bool {
        self.endpoint.is_server()
    }

    /// The maximum RPC payload size in either direction.
    pub fn max_rpc_size(&self) -> usize {
        self.config.max_rpc_size
    }

    /// Register a span of caller-owned memory for zero-copy sends.
    ///
    /// The transport treats the region as read-only. Requests whose second
    /// chunk lies inside it are transmitted without copying the payload.
    pub fn register_log_memory(&self, base: u64, len: usize) -> Result<()> {
        let mr = self.ib.register_memory(base, len, AccessFlags::empty())?;
        *self.log_region.borrow_mut() = Some(LogRegion { base, len, mr });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session setup
    // ------------------------------------------------------------------

    /// Open a session to the server whose setup socket is at `server`.
    ///
    /// Blocks through the UDP handshake (driving our own setup handler so
    /// a self-connect can resolve) and fails with `HandshakeTimeout` once
    /// the retry budget is spent.
    pub fn open_session(self: &Rc<Self>, server: SocketAddr) -> Result<Session> {
        let qp = self.client_setup_queue_pair(server)?;
        Ok(Session::new(
            Rc::clone(self),
            Rc::new(SessionCore::new(qp)),
        ))
    }

    fn client_setup_queue_pair(&self, server: SocketAddr) -> Result<QueuePair> {
        let mut qp = self.ib.create_queue_pair(
            self.port,
            self.client_srq,
            self.common_tx_cq,
            self.client_rx_cq,
            self.config.tx_depth as u32,
            self.config.srq_depth as u32,
        )?;

        for _ in 0..self.config.exchange_max_timeouts {
            let outgoing = QueuePairTuple {
                lid: self.lid,
                qpn: qp.local_qpn,
                psn: qp.initial_psn,
                nonce: rand::random(),
            };

            let exchanged = self.endpoint.try_exchange(
                server,
                &outgoing,
                self.config.exchange_usec_timeout,
                &*self.clock,
                &mut || self.handle_setup_requests(),
            );

            match exchanged {
                Ok(Some(incoming)) => {
                    if let Err(e) = self.ib.plumb(&mut qp, &incoming) {
                        self.ib.destroy_queue_pair(qp.local_qpn);
                        return Err(e);
                    }
                    return Ok(qp);
                }
                Ok(None) => {
                    warn!("timed out waiting for handshake response; retrying");
                }
                Err(e) => {
                    self.ib.destroy_queue_pair(qp.local_qpn);
                    return Err(e);
                }
            }
        }

        warn!(
            "failed to exchange with server {} within allotted {} microseconds ({} attempts)",
            server,
            self.config.exchange_usec_timeout * u64::from(self.config.exchange_max_timeouts),
            self.config.exchange_max_timeouts,
        );
        self.ib.destroy_queue_pair(qp.local_qpn);
        Err(Error::HandshakeTimeout {
            attempts: self.config.exchange_max_timeouts,
        })
    }

    /// Service pending setup requests on the server socket: build a
    /// server-side queue pair per request, plumb it with the client's
    /// tuple, reply with ours, and register it by QPN.
    ///
    /// A reply that is lost on the wire leaves the queue pair here
    /// half-open; nothing at this layer reaps it.
    fn handle_setup_requests(&self) {
        if !self.endpoint.is_server() {
            return;
        }
        while let Some((incoming, from)) = self.endpoint.recv_setup_request() {
            let mut qp = match self.ib.create_queue_pair(
                self.port,
                self.server_srq,
                self.common_tx_cq,
                self.server_rx_cq,
                self.config.tx_depth as u32,
                self.config.srq_depth as u32,
            ) {
                Ok(qp) => qp,
                Err(e) => {
                    error!("failed to create server queue pair: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.ib.plumb(&mut qp, &incoming) {
                error!("failed to plumb server queue pair: {}", e);
                self.ib.destroy_queue_pair(qp.local_qpn);
                continue;
            }

            let outgoing = QueuePairTuple {
                lid: self.lid,
                qpn: qp.local_qpn,
                psn: qp.initial_psn,
                nonce: incoming.nonce,
            };
            if !self.endpoint.send_setup_reply(from, &outgoing) {
                self.ib.destroy_queue_pair(qp.local_qpn);
                continue;
            }

            debug!("plumbed server queue pair {} for {}", qp.local_qpn, from);
            self.queue_pair_map.borrow_mut().insert(qp.local_qpn, qp);
        }
    }

    // ------------------------------------------------------------------
    // Client send path
    // ------------------------------------------------------------------

    pub(crate) fn client_send(
        &self,
        core: &Rc<SessionCore>,
        request: Buffer,
    ) -> Result<RpcHandle> {
        if let Some(reason) = core.aborted.borrow().as_ref() {
            return Err(Error::SessionAborted(reason.clone()));
        }
        if core.qp.borrow().is_none() {
            return Err(Error::SessionAborted("session released".into()));
        }
        if request.total_len() > self.config.max_rpc_size {
            return Err(Error::RpcTooLarge {
                size: request.total_len(),
                max: self.config.max_rpc_size,
            });
        }

        let nonce = rand::random();
        let idx = self
            .rpcs
            .borrow_mut()
            .insert(ClientRpc::new(Rc::clone(core), nonce, request));
        self.send_or_queue(idx);
        Ok(RpcHandle(idx))
    }

    /// Admit the RPC to the wire if a receive buffer can be reserved for
    /// its reply, otherwise park it at the tail of the send queue.
    fn send_or_queue(&self, idx: usize) {
        debug_assert_eq!(self.rpcs.borrow()[idx].state, RpcState::Pending);

        if self.num_used_client_srq_buffers.get() < self.config.srq_depth {
            match self.transmit_request(idx) {
                Ok(()) => {
                    let mut rpcs = self.rpcs.borrow_mut();
                    self.outstanding_rpcs.borrow_mut().push_back(&mut rpcs, idx);
                    self.num_used_client_srq_buffers
                        .set(self.num_used_client_srq_buffers.get() + 1);
                    let rpc = &mut rpcs[idx];
                    rpc.state = RpcState::RequestSent;
                    debug!("sent request with nonce {:016x}", rpc.nonce);
                }
                Err(e) => {
                    self.fail_rpc(idx, &format!("send failed: {}", e));
                }
            }
        } else {
            let mut rpcs = self.rpcs.borrow_mut();
            self.client_send_queue.borrow_mut().push_back(&mut rpcs, idx);
            let rpc = &mut rpcs[idx];
            rpc.state = RpcState::Queued;
            debug!("queued send request with nonce {:016x}", rpc.nonce);
        }
    }

    fn transmit_request(&self, idx: usize) -> Result<()> {
        let rpcs = self.rpcs.borrow();
        let rpc = &rpcs[idx];
        let nonce = rpc.nonce;
        let session = Rc::clone(&rpc.session);
        let request = rpc
            .request
            .as_ref()
            .expect("request stays with the RPC until it is terminal");

        let qp_slot = session.qp.borrow();
        let qp = qp_slot
            .as_ref()
            .ok_or_else(|| Error::SessionAborted("session released".into()))?;

        if self.try_zero_copy(qp, nonce, request)? {
            return Ok(());
        }

        let bd = self.get_transmit_buffer()?;
        let total = request.total_len();
        unsafe {
            let dst = self.tx_pool.slot_ptr(bd.index);
            let header = MessageHeader { nonce }.to_bytes();
            std::ptr::copy_nonoverlapping(header.as_ptr(), dst, MESSAGE_HEADER_SIZE);
            let payload = std::slice::from_raw_parts_mut(
                dst.add(MESSAGE_HEADER_SIZE),
                self.tx_pool.slot_size() - MESSAGE_HEADER_SIZE,
            );
            request.gather_into(payload);
        }
        self.ib
            .post_send(qp, &bd, (MESSAGE_HEADER_SIZE + total) as u32)
    }

    /// Zero-copy send of a request whose payload already lives in the
    /// registered log region: the header chunk is copied into a transmit
    /// buffer and the payload is posted as a second scatter-gather entry.
    ///
    /// Eligible only when the request is exactly two chunks and the second
    /// lies fully inside the region; anything else takes the copy path.
    fn try_zero_copy(&self, qp: &QueuePair, nonce: u64, request: &Buffer) -> Result<bool> {
        let region_slot = self.log_region.borrow();
        let region = match region_slot.as_ref() {
            Some(r) => r,
            None => return Ok(false),
        };
        if request.chunk_count() != 2 {
            return Ok(false);
        }
        let (addr, len) = match request.chunk(1) {
            Some(Chunk::Region { addr, len }) => (*addr, *len),
            _ => return Ok(false),
        };
        if addr < region.base || addr + u64::from(len) > region.base + region.len as u64 {
            return Ok(false);
        }

        let first = request.chunk(0).expect("two chunks checked").as_slice();
        let bd = self.get_transmit_buffer()?;
        unsafe {
            let dst = self.tx_pool.slot_ptr(bd.index);
            let header = MessageHeader { nonce }.to_bytes();
            std::ptr::copy_nonoverlapping(header.as_ptr(), dst, MESSAGE_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(first.as_ptr(), dst.add(MESSAGE_HEADER_SIZE), first.len());
        }
        debug!("sending zero-copy request with nonce {:016x}", nonce);
        self.ib.post_send_zero_copy(
            qp,
            &bd,
            (MESSAGE_HEADER_SIZE + first.len()) as u32,
            addr,
            len,
            &region.mr,
        )?;
        Ok(true)
    }

    /// Pop a free transmit buffer, draining the transmit completion queue
    /// until one comes back if the pool is dry.
    ///
    /// Errors from previous transmissions surface here and are logged;
    /// the buffer is reclaimed either way and no RPC is notified (the
    /// reliable queue pair either delivered in order or the failure shows
    /// up on the receive side).
    fn get_transmit_buffer(&self) -> Result<BufferDescriptor> {
        loop {
            if let Some(bd) = self.free_tx_buffers.borrow_mut().pop() {
                return Ok(bd);
            }

            let mut completions = vec![WorkCompletion::default(); self.config.tx_depth];
            let n = self.ib.poll_cq(self.common_tx_cq, &mut completions);
            let mut free = self.free_tx_buffers.borrow_mut();
            for wc in &completions[..n] {
                match self.tx_pool.index_of_addr(wc.wr_id) {
                    Some(index) => free.push(self.tx_pool.descriptor(index)),
                    None => {
                        error!("transmit completion for unknown buffer {:#x}", wc.wr_id);
                        continue;
                    }
                }
                if wc.status != WcStatus::Success {
                    error!("transmit failed: {}", wc.status.as_str());
                }
            }
            drop(free);
            if n == 0 {
                std::hint::spin_loop();
            }
        }
    }

    // ------------------------------------------------------------------
    // Poller
    // ------------------------------------------------------------------

    /// One dispatch tick: return loaned buffers, service the setup socket,
    /// then drain the client and server receive completion queues. Never
    /// blocks; does a bounded amount of work and relies on re-entry.
    pub fn poll(&self, workers: &WorkerManager) {
        self.drain_returned_buffers();
        self.handle_setup_requests();
        self.poll_client_rx();
        self.poll_server_rx(workers);
    }

    fn drain_returned_buffers(&self) {
        for (kind, index) in self.returner.drain() {
            self.post_srq_receive_and_kick(kind, self.rx_pool.descriptor(index));
        }
    }

    /// Put a receive buffer back on its shared receive queue. Returning a
    /// client-SRQ buffer releases one reply reservation, so if a request
    /// was parked behind backpressure this kicks the head of the send
    /// queue back through `send_or_queue`.
    fn post_srq_receive_and_kick(&self, kind: SrqKind, bd: BufferDescriptor) {
        let srq = match kind {
            SrqKind::Client => self.client_srq,
            SrqKind::Server => self.server_srq,
        };
        if let Err(e) = self.ib.post_srq_receive(srq, &bd) {
            error!("failed to repost receive buffer: {}", e);
            return;
        }

        if kind == SrqKind::Client {
            let used = self.num_used_client_srq_buffers.get();
            debug_assert!(used > 0, "returned more client buffers than were used");
            self.num_used_client_srq_buffers.set(used.saturating_sub(1));

            let next = {
                let mut rpcs = self.rpcs.borrow_mut();
                let popped = self.client_send_queue.borrow_mut().pop_front(&mut rpcs);
                if let Some(idx) = popped {
                    let rpc = &mut rpcs[idx];
                    debug!("dequeued request with nonce {:016x}", rpc.nonce);
                    rpc.state = RpcState::Pending;
                }
                popped
            };
            if let Some(idx) = next {
                self.send_or_queue(idx);
            }
        }
    }

    fn poll_client_rx(&self) {
        if self.outstanding_rpcs.borrow().is_empty() {
            return;
        }
        let mut wc = [WorkCompletion::default()];
        while self.ib.poll_cq(self.client_rx_cq, &mut wc) > 0 {
            self.process_client_completion(wc[0]);
        }
    }

    fn process_client_completion(&self, wc: WorkCompletion) {
        let index = match self.rx_pool.index_of_addr(wc.wr_id) {
            Some(i) => i,
            None => {
                error!("client receive completion for unknown buffer {:#x}", wc.wr_id);
                return;
            }
        };
        let bd = self.rx_pool.descriptor(index);
        let slot = self.rx_pool.slot_slice(index);

        if wc.status != WcStatus::Success {
            error!(
                "client receive completion failed: {}",
                wc.status.as_str()
            );
            // If the buffer still carries a legible nonce, fail its owner.
            let casualty = MessageHeader::from_bytes(slot)
                .and_then(|h| self.find_outstanding(h.nonce));
            self.post_srq_receive_and_kick(SrqKind::Client, bd);
            if let Some(idx) = casualty {
                self.fail_rpc(idx, "receive completion failed");
            }
            return;
        }

        if (wc.byte_len as usize) < MESSAGE_HEADER_SIZE {
            warn!("dropped runt response ({} bytes)", wc.byte_len);
            self.post_srq_receive_and_kick(SrqKind::Client, bd);
            return;
        }

        let header = MessageHeader::from_bytes(slot).expect("slot holds at least a header");
        debug!("received response with nonce {:016x}", header.nonce);

        let idx = match self.find_outstanding(header.nonce) {
            Some(idx) => idx,
            None => {
                warn!(
                    "dropped packet because no nonce matched {:016x}",
                    header.nonce
                );
                self.post_srq_receive_and_kick(SrqKind::Client, bd);
                return;
            }
        };

        {
            let mut rpcs = self.rpcs.borrow_mut();
            self.outstanding_rpcs.borrow_mut().remove(&mut rpcs, idx);
        }

        let len = wc.byte_len as usize - MESSAGE_HEADER_SIZE;
        if self.num_used_client_srq_buffers.get() >= self.config.srq_depth / 2 {
            // Low on receive buffers; pay for a copy to return this one now.
            debug!("copy and immediately return client receive buffer");
            let payload = slot[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + len].to_vec();
            {
                let mut rpcs = self.rpcs.borrow_mut();
                let rpc = &mut rpcs[idx];
                rpc.response
                    .as_mut()
                    .expect("response present until taken")
                    .append_vec(payload);
                rpc.state = RpcState::ResponseReceived;
            }
            self.post_srq_receive_and_kick(SrqKind::Client, bd);
        } else {
            // The response hangs onto the SRQ buffer until it is dropped.
            debug!("hanging onto client receive buffer");
            let chunk = PayloadChunk::new(
                bd.addr + MESSAGE_HEADER_SIZE as u64,
                len as u32,
                SrqKind::Client,
                bd.index,
                self.returner.clone(),
            );
            let mut rpcs = self.rpcs.borrow_mut();
            let rpc = &mut rpcs[idx];
            rpc.response
                .as_mut()
                .expect("response present until taken")
                .append_loaned(chunk);
            rpc.state = RpcState::ResponseReceived;
        }
    }

    fn find_outstanding(&self, nonce: u64) -> Option<usize> {
        let rpcs = self.rpcs.borrow();
        self.outstanding_rpcs
            .borrow()
            .indices(&rpcs)
            .into_iter()
            .find(|&i| rpcs[i].nonce == nonce)
    }

    fn poll_server_rx(&self, workers: &WorkerManager) {
        if !self.endpoint.is_server() {
            return;
        }
        let mut wc = [WorkCompletion::default()];
        while self.ib.poll_cq(self.server_rx_cq, &mut wc) > 0 {
            self.process_server_completion(wc[0], workers);
        }
    }

    fn process_server_completion(&self, wc: WorkCompletion, workers: &WorkerManager) {
        let index = match self.rx_pool.index_of_addr(wc.wr_id) {
            Some(i) => i,
            None => {
                error!("server receive completion for unknown buffer {:#x}", wc.wr_id);
                return;
            }
        };
        let bd = self.rx_pool.descriptor(index);

        if !self.queue_pair_map.borrow().contains_key(&wc.qp_num) {
            error!("dropped request: no registered queue pair {}", wc.qp_num);
            self.post_srq_receive_and_kick(SrqKind::Server, bd);
            return;
        }

        if wc.status != WcStatus::Success {
            error!(
                "server receive completion failed: {}",
                wc.status.as_str()
            );
            self.post_srq_receive_and_kick(SrqKind::Server, bd);
            return;
        }

        let slot = self.rx_pool.slot_slice(index);
        let header = MessageHeader::from_bytes(slot).expect("slot holds at least a header");
        debug!("received request with nonce {:016x}", header.nonce);

        let len = (wc.byte_len as usize).saturating_sub(MESSAGE_HEADER_SIZE);
        let mut request = Buffer::new();
        request.append_loaned(PayloadChunk::new(
            bd.addr + MESSAGE_HEADER_SIZE as u64,
            len as u32,
            SrqKind::Server,
            bd.index,
            self.returner.clone(),
        ));

        let rpc = ServerRpc::new(wc.qp_num, header.nonce, request);
        workers.handle_rpc(self, rpc);
    }

    // ------------------------------------------------------------------
    // Reply path
    // ------------------------------------------------------------------

    /// Transmit the reply for a serviced RPC on the queue pair its request
    /// arrived on. Consumes the RPC; dropping it returns the request's
    /// receive buffer to the server SRQ.
    pub fn send_reply(&self, rpc: ServerRpc) -> Result<()> {
        let total = rpc.reply.total_len();
        if total > self.config.max_rpc_size {
            return Err(Error::RpcTooLarge {
                size: total,
                max: self.config.max_rpc_size,
            });
        }

        let map = self.queue_pair_map.borrow();
        let qp = map.get(&rpc.qpn).ok_or(Error::QpNotFound(rpc.qpn))?;

        let bd = self.get_transmit_buffer()?;
        unsafe {
            let dst = self.tx_pool.slot_ptr(bd.index);
            let header = MessageHeader { nonce: rpc.nonce }.to_bytes();
            std::ptr::copy_nonoverlapping(header.as_ptr(), dst, MESSAGE_HEADER_SIZE);
            let payload = std::slice::from_raw_parts_mut(
                dst.add(MESSAGE_HEADER_SIZE),
                self.tx_pool.slot_size() - MESSAGE_HEADER_SIZE,
            );
            rpc.reply.gather_into(payload);
        }
        self.ib
            .post_send(qp, &bd, (MESSAGE_HEADER_SIZE + total) as u32)?;
        debug!("sent response with nonce {:016x}", rpc.nonce);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client RPC lifecycle
    // ------------------------------------------------------------------

    /// Current state of an RPC, or None if the handle was already reaped.
    pub fn rpc_state(&self, handle: RpcHandle) -> Option<RpcState> {
        let rpcs = self.rpcs.borrow();
        rpcs.get(handle.0).map(|rpc| rpc.state)
    }

    /// Failure message for an RPC in the FAILED state.
    pub fn rpc_error(&self, handle: RpcHandle) -> Option<String> {
        let rpcs = self.rpcs.borrow();
        rpcs.get(handle.0).and_then(|rpc| rpc.error.clone())
    }

    /// Reap a finished RPC, returning its response if one was received.
    /// Returns None while the RPC is still in flight.
    pub fn take_response(&self, handle: RpcHandle) -> Option<Buffer> {
        let mut rpcs = self.rpcs.borrow_mut();
        let finished = rpcs
            .get(handle.0)
            .map(|rpc| rpc.state.is_finished())
            .unwrap_or(false);
        if !finished {
            return None;
        }
        let rpc = rpcs.remove(handle.0);
        match rpc.state {
            RpcState::ResponseReceived => rpc.response,
            _ => None,
        }
    }

    /// Cancel an RPC. A request already on the wire is not recalled; its
    /// late reply is dropped as an unmatched nonce.
    pub(crate) fn cancel_rpc(&self, handle: RpcHandle) {
        let mut rpcs = self.rpcs.borrow_mut();
        if !rpcs.contains(handle.0) {
            return;
        }
        match RpcQueue::membership(&rpcs, handle.0) {
            Some(ListId::Outstanding) => {
                self.outstanding_rpcs.borrow_mut().remove(&mut rpcs, handle.0);
            }
            Some(ListId::SendQueue) => {
                self.client_send_queue.borrow_mut().remove(&mut rpcs, handle.0);
            }
            None => {}
        }
        let rpc = &mut rpcs[handle.0];
        if !rpc.state.is_finished() {
            debug!("cancelled rpc with nonce {:016x}", rpc.nonce);
            rpc.state = RpcState::Cancelled;
        }
    }

    fn fail_rpc(&self, idx: usize, message: &str) {
        let mut rpcs = self.rpcs.borrow_mut();
        match RpcQueue::membership(&rpcs, idx) {
            Some(ListId::Outstanding) => {
                self.outstanding_rpcs.borrow_mut().remove(&mut rpcs, idx);
            }
            Some(ListId::SendQueue) => {
                self.client_send_queue.borrow_mut().remove(&mut rpcs, idx);
            }
            None => {}
        }
        let rpc = &mut rpcs[idx];
        warn!("rpc with nonce {:016x} failed: {}", rpc.nonce, message);
        rpc.state = RpcState::Failed;
        rpc.error = Some(message.to_string());
    }

    pub(crate) fn abort_session(&self, core: &Rc<SessionCore>, reason: &str) {
        *core.aborted.borrow_mut() = Some(reason.to_string());
        let victims: Vec<usize> = {
            let rpcs = self.rpcs.borrow();
            let mut v = self.outstanding_rpcs.borrow().indices(&rpcs);
            v.extend(self.client_send_queue.borrow().indices(&rpcs));
            v.retain(|&i| Rc::ptr_eq(&rpcs[i].session, core));
            v
        };
        for idx in victims {
            self.fail_rpc(idx, reason);
        }
    }

    pub(crate) fn release_session(&self, core: &Rc<SessionCore>) {
        self.abort_session(core, "session released");
        if let Some(qp) = core.qp.borrow_mut().take() {
            self.ib.destroy_queue_pair(qp.local_qpn);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Client SRQ buffers currently reserved, in flight, or on loan.
    pub fn num_used_client_srq_buffers(&self) -> usize {
        self.num_used_client_srq_buffers.get()
    }

    /// RPCs waiting for their reply.
    pub fn outstanding_rpc_count(&self) -> usize {
        self.outstanding_rpcs.borrow().len()
    }

    /// RPCs parked behind receive-buffer backpressure.
    pub fn queued_rpc_count(&self) -> usize {
        self.client_send_queue.borrow().len()
    }

    /// Transmit buffers on the free list right now.
    pub fn free_transmit_buffer_count(&self) -> usize {
        self.free_tx_buffers.borrow().len()
    }

    /// Server-side queue pairs currently registered.
    pub fn registered_qp_count(&self) -> usize {
        self.queue_pair_map.borrow().len()
    }
}
