//! Worker management for incoming RPCs.
//!
//! The transport hands each fully-received request to `handle_rpc` on the
//! dispatch thread. Requests with a missing header or an out-of-range
//! opcode get a canonical error reply immediately; everything else is
//! serviced by a worker thread, one RPC per worker, in FIFO arrival order
//! when workers have to be deferred. Workers communicate completion back
//! through a mutex-guarded queue that the dispatch thread drains each
//! tick, transmitting replies and promoting waiters one per completion.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::transport::Transport;
use crate::wire::{RequestHeader, Status, MAX_OPCODE, REQUEST_HEADER_SIZE};

/// One request/reply exchange as seen by a service.
pub struct ServiceRpc<'a> {
    /// Opcode from the request header.
    pub opcode: u16,
    /// Epoch stamped on the RPC when its worker started.
    pub epoch: u64,
    /// The request payload.
    pub request: &'a Buffer,
    /// Reply payload; the service must fill this before returning.
    pub reply: &'a mut Buffer,
}

/// The service dispatcher invoked by worker threads.
///
/// `handle_rpc` must fill the reply and return. A panic out of it is
/// fatal to the process: services are failure-isolated upstream of this
/// layer.
pub trait Service: Send + Sync + 'static {
    fn handle_rpc(&self, rpc: &mut ServiceRpc<'_>);
}

/// A server-side RPC in flight.
///
/// Created by the transport poller when a request completion arrives and
/// consumed by `send_reply`. The request buffer's sole chunk is the SRQ
/// receive buffer on loan; dropping the RPC returns it.
pub struct ServerRpc {
    /// Queue pair the request arrived on.
    pub(crate) qpn: u32,
    /// Nonce echoed back in the reply.
    pub nonce: u64,
    /// Dispatcher-assigned identifier.
    pub id: u64,
    /// Epoch stamp taken when a worker picked the RPC up.
    pub epoch: u64,
    /// Request payload.
    pub request: Buffer,
    /// Reply payload, filled by the service.
    pub reply: Buffer,
}

impl ServerRpc {
    pub(crate) fn new(qpn: u32, nonce: u64, request: Buffer) -> Self {
        Self {
            qpn,
            nonce,
            id: 0,
            epoch: 0,
            request,
            reply: Buffer::new(),
        }
    }
}

/// Build the canonical reply for a request that never reaches a service.
pub fn prepare_error_response(reply: &mut Buffer, status: Status) {
    reply.clear();
    reply.append_bytes(&status.to_bytes());
}

type CompletedQueue = Mutex<VecDeque<ServerRpc>>;

/// FIFO intake and completion shepherding for server-side RPCs.
///
/// Lives on the dispatch thread. The only state shared with workers is
/// the completed queue (and the epoch cell); everything else is plain
/// single-threaded state.
pub struct WorkerManager {
    service: Arc<dyn Service>,
    completed_rpcs: Arc<CompletedQueue>,
    waiting_rpcs: RefCell<VecDeque<ServerRpc>>,
    num_outstanding_rpcs: Cell<usize>,
    next_rpc_id: Cell<u64>,
    epoch: Arc<AtomicU64>,

    testing_save_rpcs: Cell<bool>,
    test_rpcs: RefCell<VecDeque<ServerRpc>>,
    testing_fail_spawns: Cell<u32>,
}

impl WorkerManager {
    /// Create a manager dispatching into `service`.
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            completed_rpcs: Arc::new(Mutex::new(VecDeque::new())),
            waiting_rpcs: RefCell::new(VecDeque::new()),
            num_outstanding_rpcs: Cell::new(0),
            next_rpc_id: Cell::new(0),
            epoch: Arc::new(AtomicU64::new(0)),
            testing_save_rpcs: Cell::new(false),
            test_rpcs: RefCell::new(VecDeque::new()),
            testing_fail_spawns: Cell::new(0),
        }
    }

    /// Intake for a fully-received request. Runs on the dispatch thread.
    ///
    /// Invalid requests are answered immediately with a canonical error
    /// reply and never reach the service or a worker.
    pub fn handle_rpc(&self, transport: &Transport, mut rpc: ServerRpc) {
        let mut raw = [0u8; REQUEST_HEADER_SIZE];
        let header = if rpc.request.copy_out(0, &mut raw) {
            RequestHeader::from_bytes(&raw)
        } else {
            None
        };

        let header = match header {
            None => {
                warn!(
                    "incoming rpc contains no header (message length {})",
                    rpc.request.total_len()
                );
                prepare_error_response(&mut rpc.reply, Status::MessageTooShort);
                if let Err(e) = transport.send_reply(rpc) {
                    warn!("failed to send error reply: {}", e);
                }
                return;
            }
            Some(header) if header.opcode >= MAX_OPCODE => {
                warn!("incoming rpc contained unknown opcode {}", header.opcode);
                prepare_error_response(&mut rpc.reply, Status::UnimplementedRequest);
                if let Err(e) = transport.send_reply(rpc) {
                    warn!("failed to send error reply: {}", e);
                }
                return;
            }
            Some(header) => header,
        };

        if self.testing_save_rpcs.get() {
            self.test_rpcs.borrow_mut().push_back(rpc);
            return;
        }

        self.num_outstanding_rpcs
            .set(self.num_outstanding_rpcs.get() + 1);
        rpc.id = self.next_rpc_id.get();
        self.next_rpc_id.set(rpc.id + 1);
        trace!("handling rpc {} with opcode {}", rpc.id, header.opcode);

        // Earlier arrivals waiting for a worker keep their place in line.
        if !self.waiting_rpcs.borrow().is_empty() {
            self.waiting_rpcs.borrow_mut().push_back(rpc);
            trace!("rpc deferred; workers busy");
            return;
        }

        if let Err(rpc) = self.spawn_worker(rpc) {
            self.waiting_rpcs.borrow_mut().push_back(rpc);
            trace!("rpc deferred; worker creation failed");
        }
    }

    /// Launch a worker thread for `rpc`, handing the RPC back on failure.
    fn spawn_worker(&self, rpc: ServerRpc) -> std::result::Result<(), ServerRpc> {
        if self.testing_fail_spawns.get() > 0 {
            self.testing_fail_spawns
                .set(self.testing_fail_spawns.get() - 1);
            return Err(rpc);
        }

        let service = Arc::clone(&self.service);
        let completed = Arc::clone(&self.completed_rpcs);
        let epoch = Arc::clone(&self.epoch);
        let slot = Arc::new(Mutex::new(Some(rpc)));
        let thread_slot = Arc::clone(&slot);

        let spawned = thread::Builder::new()
            .name("infrc-worker".into())
            .spawn(move || {
                let rpc = thread_slot
                    .lock()
                    .take()
                    .expect("rpc is handed to exactly one worker");
                worker_main(service, completed, epoch, rpc);
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("failed to spawn worker thread: {}", e);
                let rpc = slot
                    .lock()
                    .take()
                    .expect("spawn failed before the closure could run");
                Err(rpc)
            }
        }
    }

    /// Drain completed RPCs: promote at most one waiter per completion
    /// (FIFO), then transmit the reply. Runs on the dispatch thread each
    /// tick; the queue's lock is never held across `send_reply`.
    pub fn poll(&self, transport: &Transport) -> usize {
        let mut found = 0;
        loop {
            let rpc = self.completed_rpcs.lock().pop_front();
            let rpc = match rpc {
                Some(rpc) => rpc,
                None => break,
            };
            found += 1;

            trace!("dispatch thread completing rpc {}", rpc.id);
            let waiter = self.waiting_rpcs.borrow_mut().pop_front();
            if let Some(waiter) = waiter {
                if let Err(waiter) = self.spawn_worker(waiter) {
                    self.waiting_rpcs.borrow_mut().push_front(waiter);
                }
            }

            if let Err(e) = transport.send_reply(rpc) {
                warn!("failed to send reply: {}", e);
            }
            self.num_outstanding_rpcs
                .set(self.num_outstanding_rpcs.get() - 1);
        }
        found
    }

    /// True when no RPC is being serviced. A true reading also means every
    /// write made by worker threads is visible to the caller.
    pub fn idle(&self) -> bool {
        fence(Ordering::Acquire);
        self.num_outstanding_rpcs.get() == 0
    }

    /// RPCs accepted but not yet replied to.
    pub fn num_outstanding_rpcs(&self) -> usize {
        self.num_outstanding_rpcs.get()
    }

    /// RPCs waiting for a worker.
    pub fn num_waiting_rpcs(&self) -> usize {
        self.waiting_rpcs.borrow().len()
    }

    /// Set the epoch stamped on RPCs as workers pick them up.
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// The current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Test affordances
    // ------------------------------------------------------------------

    /// Park validated RPCs on an internal queue instead of dispatching
    /// them. Only useful from tests.
    pub fn set_testing_save_rpcs(&self, save: bool) {
        self.testing_save_rpcs.set(save);
    }

    /// Make the next `n` worker spawns fail. Only useful from tests.
    pub fn fail_next_spawns(&self, n: u32) {
        self.testing_fail_spawns.set(n);
    }

    /// Wait for a parked RPC, driving the transport while waiting. Gives
    /// up after `timeout`.
    pub fn wait_for_rpc(&self, transport: &Transport, timeout: Duration) -> Option<ServerRpc> {
        let start = Instant::now();
        loop {
            if let Some(rpc) = self.test_rpcs.borrow_mut().pop_front() {
                return Some(rpc);
            }
            if start.elapsed() > timeout {
                return None;
            }
            transport.poll(self);
        }
    }
}

/// Top-level worker thread routine: service one RPC, then signal the
/// dispatch thread through the completed queue and exit.
fn worker_main(
    service: Arc<dyn Service>,
    completed: Arc<CompletedQueue>,
    epoch: Arc<AtomicU64>,
    mut rpc: ServerRpc,
) {
    rpc.epoch = epoch.load(Ordering::Acquire);

    let mut raw = [0u8; REQUEST_HEADER_SIZE];
    rpc.request.copy_out(0, &mut raw);
    let opcode = u16::from_le_bytes(raw);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let ServerRpc {
            ref request,
            ref mut reply,
            epoch,
            ..
        } = rpc;
        let mut service_rpc = ServiceRpc {
            opcode,
            epoch,
            request,
            reply,
        };
        service.handle_rpc(&mut service_rpc);
    }));
    if outcome.is_err() {
        error!("worker servicing opcode {} panicked; aborting", opcode);
        std::process::abort();
    }

    completed.lock().push_back(rpc);
}
