//! The dispatch loop.
//!
//! Exactly one thread drives the transport poller and the worker manager's
//! completion poll. `Dispatch` bundles the two so that thread has a single
//! `poll` to call, plus a `run`/`wait` pair for processes that hand the
//! thread over entirely.

use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::POLL_MICROS;
use crate::error::{Error, Result};
use crate::session::{RpcHandle, RpcState};
use crate::buffer::Buffer;
use crate::transport::Transport;
use crate::worker::WorkerManager;

/// Owner of the dispatch thread's pollers.
pub struct Dispatch {
    transport: Rc<Transport>,
    workers: WorkerManager,
}

impl Dispatch {
    /// Bundle a transport with its worker manager.
    pub fn new(transport: Rc<Transport>, workers: WorkerManager) -> Self {
        Self { transport, workers }
    }

    /// The transport.
    pub fn transport(&self) -> &Rc<Transport> {
        &self.transport
    }

    /// The worker manager.
    pub fn workers(&self) -> &WorkerManager {
        &self.workers
    }

    /// One dispatch tick. Returns the number of completed server RPCs
    /// shepherded out.
    pub fn poll(&self) -> usize {
        self.transport.poll(&self.workers);
        self.workers.poll(&self.transport)
    }

    /// Poll until `stop` returns true, busy-polling for `POLL_MICROS`
    /// after the last useful tick before yielding the processor.
    pub fn run_until(&self, mut stop: impl FnMut() -> bool) {
        let mut last_work = Instant::now();
        while !stop() {
            if self.poll() > 0 {
                last_work = Instant::now();
            } else if last_work.elapsed() > Duration::from_micros(POLL_MICROS) {
                std::thread::yield_now();
            }
        }
    }

    /// Drive an RPC to a terminal state and reap it.
    ///
    /// Returns the response buffer on success. Failure and cancellation
    /// surface as `Error::RpcFailed`; `timeout` bounds the wait.
    pub fn wait(&self, rpc: RpcHandle, timeout: Duration) -> Result<Buffer> {
        let start = Instant::now();
        loop {
            self.poll();
            match self.transport.rpc_state(rpc) {
                Some(RpcState::ResponseReceived) => {
                    return self
                        .transport
                        .take_response(rpc)
                        .ok_or_else(|| Error::RpcFailed("response already taken".into()));
                }
                Some(RpcState::Failed) => {
                    let message = self
                        .transport
                        .rpc_error(rpc)
                        .unwrap_or_else(|| "unknown failure".into());
                    let _ = self.transport.take_response(rpc);
                    return Err(Error::RpcFailed(message));
                }
                Some(RpcState::Cancelled) => {
                    let _ = self.transport.take_response(rpc);
                    return Err(Error::RpcFailed("cancelled".into()));
                }
                Some(_) => {}
                None => return Err(Error::RpcFailed("unknown rpc".into())),
            }
            if start.elapsed() > timeout {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for rpc",
                )));
            }
            std::hint::spin_loop();
        }
    }
}
