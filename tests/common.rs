//! Common test utilities: an in-process verbs provider and cluster
//! builders that run the whole transport stack without RDMA hardware.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use infrc::buffer::BufferDescriptor;
use infrc::handshake::QueuePairTuple;
use infrc::verbs::{AccessFlags, Cq, MemoryRegion, QpState, QueuePair, Srq, WcStatus};
use infrc::{
    Buffer, Dispatch, Infiniband, Result, Service, ServiceLocator, ServiceRpc, Transport,
    TransportConfig, WorkCompletion, WorkerManager,
};

/// Endpoint bookkeeping for one queue pair.
#[derive(Clone, Copy)]
struct QpEndpoint {
    srq: u32,
    tx_cq: u32,
    rx_cq: u32,
}

#[derive(Default)]
struct LoopbackState {
    next_qpn: u32,
    next_id: u32,
    srqs: HashMap<u32, VecDeque<BufferDescriptor>>,
    cqs: HashMap<u32, VecDeque<WorkCompletion>>,
    qps: HashMap<u32, QpEndpoint>,
    zero_copy_sends: u32,
}

/// An in-process verbs provider.
///
/// Queue pairs created on the same provider can talk to each other: a
/// posted send pops a receive from the peer's SRQ, copies the bytes
/// between the real pool slots, and enqueues completions on both ends.
pub struct LoopbackIb {
    lid: u16,
    state: RefCell<LoopbackState>,
}

impl LoopbackIb {
    pub fn new(lid: u16) -> Self {
        Self {
            lid,
            state: RefCell::new(LoopbackState {
                next_qpn: 100,
                ..Default::default()
            }),
        }
    }

    /// How many zero-copy (two-SGE) sends have been posted.
    pub fn zero_copy_sends(&self) -> u32 {
        self.state.borrow().zero_copy_sends
    }

    /// Completions sitting in all completion queues, unconsumed.
    pub fn total_cq_backlog(&self) -> usize {
        self.state.borrow().cqs.values().map(|q| q.len()).sum()
    }

    fn deliver(
        &self,
        qp: &QueuePair,
        segments: &[(u64, u32)],
        tx_wr_id: u64,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let total: u32 = segments.iter().map(|&(_, len)| len).sum();
        let tx_cq = qp.tx_cq.0;

        let peer = state.qps.get(&qp.remote_qpn).copied();
        let peer = match peer {
            Some(peer) => peer,
            None => {
                state.cqs.get_mut(&tx_cq).unwrap().push_back(WorkCompletion {
                    wr_id: tx_wr_id,
                    status: WcStatus::WorkRequestFlushed,
                    byte_len: 0,
                    qp_num: qp.local_qpn,
                });
                return Ok(());
            }
        };

        let recv = state.srqs.get_mut(&peer.srq).unwrap().pop_front();
        match recv {
            None => {
                state.cqs.get_mut(&tx_cq).unwrap().push_back(WorkCompletion {
                    wr_id: tx_wr_id,
                    status: WcStatus::RemoteInvalidRequestError,
                    byte_len: 0,
                    qp_num: qp.local_qpn,
                });
            }
            Some(rbd) => {
                assert!(total <= rbd.len, "receive buffer too small for message");
                let mut offset = 0usize;
                for &(addr, len) in segments {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            addr as *const u8,
                            (rbd.addr as *mut u8).add(offset),
                            len as usize,
                        );
                    }
                    offset += len as usize;
                }
                state.cqs.get_mut(&peer.rx_cq).unwrap().push_back(WorkCompletion {
                    wr_id: rbd.addr,
                    status: WcStatus::Success,
                    byte_len: total,
                    qp_num: qp.remote_qpn,
                });
                state.cqs.get_mut(&tx_cq).unwrap().push_back(WorkCompletion {
                    wr_id: tx_wr_id,
                    status: WcStatus::Success,
                    byte_len: total,
                    qp_num: qp.local_qpn,
                });
            }
        }
        Ok(())
    }
}

impl Infiniband for LoopbackIb {
    fn device_name(&self) -> &str {
        "loopback"
    }

    fn lid(&self, _port: u8) -> Result<u16> {
        Ok(self.lid)
    }

    fn create_srq(&self, _depth: u32, _max_sge: u32) -> Result<Srq> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.srqs.insert(id, VecDeque::new());
        Ok(Srq(id))
    }

    fn create_cq(&self, _depth: u32) -> Result<Cq> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.cqs.insert(id, VecDeque::new());
        Ok(Cq(id))
    }

    fn create_queue_pair(
        &self,
        port: u8,
        srq: Srq,
        tx_cq: Cq,
        rx_cq: Cq,
        _tx_depth: u32,
        _rx_depth: u32,
    ) -> Result<QueuePair> {
        let mut state = self.state.borrow_mut();
        let qpn = state.next_qpn;
        state.next_qpn += 1;
        state.qps.insert(
            qpn,
            QpEndpoint {
                srq: srq.0,
                tx_cq: tx_cq.0,
                rx_cq: rx_cq.0,
            },
        );
        Ok(QueuePair {
            local_qpn: qpn,
            initial_psn: qpn.wrapping_mul(7) + 1,
            port,
            srq,
            tx_cq,
            rx_cq,
            state: QpState::Init,
            remote_lid: 0,
            remote_qpn: 0,
            remote_psn: 0,
        })
    }

    fn plumb(&self, qp: &mut QueuePair, remote: &QueuePairTuple) -> Result<()> {
        assert!(self.state.borrow().qps.contains_key(&qp.local_qpn));
        qp.remote_lid = remote.lid;
        qp.remote_qpn = remote.qpn;
        qp.remote_psn = remote.psn;
        qp.state = QpState::Plumbed;
        Ok(())
    }

    fn destroy_queue_pair(&self, qpn: u32) {
        self.state.borrow_mut().qps.remove(&qpn);
    }

    fn register_memory(
        &self,
        _addr: u64,
        _len: usize,
        _access: AccessFlags,
    ) -> Result<MemoryRegion> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        Ok(MemoryRegion {
            id,
            lkey: 0x4000 + id,
        })
    }

    fn post_srq_receive(&self, srq: Srq, bd: &BufferDescriptor) -> Result<()> {
        self.state
            .borrow_mut()
            .srqs
            .get_mut(&srq.0)
            .expect("srq exists")
            .push_back(*bd);
        Ok(())
    }

    fn post_send(&self, qp: &QueuePair, bd: &BufferDescriptor, len: u32) -> Result<()> {
        self.deliver(qp, &[(bd.addr, len)], bd.addr)
    }

    fn post_send_zero_copy(
        &self,
        qp: &QueuePair,
        bd: &BufferDescriptor,
        header_len: u32,
        payload_addr: u64,
        payload_len: u32,
        _payload_mr: &MemoryRegion,
    ) -> Result<()> {
        self.state.borrow_mut().zero_copy_sends += 1;
        self.deliver(
            qp,
            &[(bd.addr, header_len), (payload_addr, payload_len)],
            bd.addr,
        )
    }

    fn poll_cq(&self, cq: Cq, completions: &mut [WorkCompletion]) -> usize {
        let mut state = self.state.borrow_mut();
        let queue = state.cqs.get_mut(&cq.0).expect("cq exists");
        let mut n = 0;
        while n < completions.len() {
            match queue.pop_front() {
                Some(wc) => {
                    completions[n] = wc;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

/// A server transport, its worker manager, and the provider they share.
pub struct TestCluster {
    pub ib: Rc<LoopbackIb>,
    pub dispatch: Dispatch,
}

impl TestCluster {
    /// Build a server cluster with an ephemeral localhost setup socket.
    pub fn server(service: Arc<dyn Service>, config: TransportConfig) -> Self {
        let ib = Rc::new(LoopbackIb::new(7));
        let dyn_ib: Rc<dyn Infiniband> = ib.clone();
        let locator = ServiceLocator::parse("kind=infrc,host=127.0.0.1,port=0").unwrap();
        let transport =
            Rc::new(Transport::with_locator(dyn_ib, locator, config).expect("transport"));
        let workers = WorkerManager::new(service);
        Self {
            ib,
            dispatch: Dispatch::new(transport, workers),
        }
    }

    /// Open a session to this cluster's own setup socket. The handshake
    /// resolves because the exchange drives our setup handler.
    pub fn open_self_session(&self) -> infrc::Session {
        let addr = self
            .dispatch
            .transport()
            .server_addr()
            .expect("server transport has a setup socket");
        self.dispatch
            .transport()
            .open_session(addr)
            .expect("self-connect handshake")
    }

    /// Poll the dispatch loop until `done` or the timeout expires.
    pub fn poll_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while !done() {
            self.dispatch.poll();
            if start.elapsed() > timeout {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }
}

/// Small pool sizes so backpressure is easy to hit.
pub fn small_config() -> TransportConfig {
    TransportConfig::default()
        .with_max_rpc_size(2048)
        .with_srq_depth(4)
        .with_tx_depth(4)
        .with_exchange_usec_timeout(200_000)
        .with_exchange_max_timeouts(5)
}

/// Build a request buffer with the given opcode and body.
pub fn request(opcode: u16, body: &[u8]) -> Buffer {
    let mut buf = Buffer::new();
    let mut head = opcode.to_le_bytes().to_vec();
    head.extend_from_slice(body);
    buf.append_vec(head);
    buf
}

/// Echoes the whole request back as the reply.
pub struct EchoService;

impl Service for EchoService {
    fn handle_rpc(&self, rpc: &mut ServiceRpc<'_>) {
        rpc.reply.append_vec(rpc.request.to_vec());
    }
}

/// Records every serviced request (and its epoch) in arrival order.
pub struct RecordingService {
    pub served: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
}

impl RecordingService {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<(u64, Vec<u8>)>>>) {
        let served = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                served: served.clone(),
            }),
            served,
        )
    }
}

impl Service for RecordingService {
    fn handle_rpc(&self, rpc: &mut ServiceRpc<'_>) {
        self.served
            .lock()
            .unwrap()
            .push((rpc.epoch, rpc.request.to_vec()));
        rpc.reply.append_vec(rpc.request.to_vec());
    }
}

/// Counting gate workers must pass before servicing; lets tests hold
/// workers in flight and release them one at a time.
pub struct Gate {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn release(&self) {
        *self.permits.lock().unwrap() += 1;
        self.cv.notify_one();
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

/// Service that blocks on a gate, then records and echoes.
pub struct GatedService {
    pub gate: Arc<Gate>,
    pub served: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Service for GatedService {
    fn handle_rpc(&self, rpc: &mut ServiceRpc<'_>) {
        self.gate.acquire();
        self.served.lock().unwrap().push(rpc.request.to_vec());
        rpc.reply.append_vec(rpc.request.to_vec());
    }
}
