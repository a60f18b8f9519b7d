//! # infrc - reliable RPC over Infiniband RC queue pairs
//!
//! A low-latency RPC transport for storage servers that talk to each other
//! in fixed-format RPCs with microsecond budgets. Reliability comes from
//! the connected queue pair; this crate supplies the bootstrap handshake,
//! buffer management, backpressure, demultiplexing, and the
//! worker-dispatch discipline on top.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Transport                               │
//! │  ┌──────────┐ ┌──────────┐ ┌─────────┐ ┌──────────────────────┐  │
//! │  │ clientSrq│ │ serverSrq│ │ tx pool │ │ QP registry          │  │
//! │  │ + rx cq  │ │ + rx cq  │ │ + tx cq │ │ FnvHashMap<QPN, QP>  │  │
//! │  └──────────┘ └──────────┘ └─────────┘ └──────────────────────┘  │
//! │        │            │                                            │
//! │   outstanding   ServerRpc ──▶ WorkerManager ──▶ worker threads   │
//! │   rpcs (nonce       ▲                │                           │
//! │   match)            │          completed_rpcs ──▶ send_reply     │
//! └─────────────────────┼────────────────────────────────────────────┘
//!                       │
//!              UDP handshake plumbs RC queue pairs
//! ```
//!
//! - **Sessions**: a client opens a session; a UDP tuple exchange plumbs a
//!   connected queue pair for it.
//! - **Shared receive queues**: one SRQ serves every client-role pair and
//!   one every server-role pair, so buffers are pooled, not per-pair.
//! - **Backpressure**: a request is only put on the wire once a receive
//!   buffer can be reserved for its reply; otherwise it queues FIFO.
//! - **Zero copy**: a request whose payload already lives in a registered
//!   region goes out as a second scatter-gather entry.
//! - **Dispatch discipline**: one thread polls everything; workers service
//!   one RPC each and signal completion through a mutex-guarded queue.
//!
//! The verbs layer is consumed through the [`verbs::Infiniband`]
//! capability, injected at construction so tests can run the whole stack
//! against an in-process provider.

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod session;
pub mod time;
pub mod transport;
pub mod verbs;
pub mod wire;
pub mod worker;

// Re-export main types
pub use buffer::{Buffer, BufferDescriptor, Chunk, RegisteredPool};
pub use config::{ServiceLocator, TransportConfig};
pub use dispatch::Dispatch;
pub use error::{Error, Result};
pub use handshake::{HandshakeEndpoint, QueuePairTuple, TUPLE_WIRE_SIZE};
pub use session::{RpcHandle, RpcState, Session};
pub use time::{Clock, MonotonicClock};
pub use transport::Transport;
pub use verbs::{AccessFlags, Infiniband, QueuePair, WcStatus, WorkCompletion};
pub use wire::{MessageHeader, RequestHeader, Status, MAX_OPCODE, MESSAGE_HEADER_SIZE};
pub use worker::{Service, ServiceRpc, ServerRpc, WorkerManager};
