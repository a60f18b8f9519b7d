//! Queue-pair handshake over UDP.
//!
//! Connected queue pairs need bootstrapping: each side must learn the
//! other's (LID, QPN, PSN) tuple before the pair can be plumbed. The
//! client sends its tuple in a single datagram and the server replies with
//! its own, echoing the client's nonce so delayed replies from earlier
//! attempts can be told apart. Datagrams can get lost; the client retries
//! on a timeout budget, and a server reply that is lost leaves a half-open
//! queue pair on the server which nothing at this layer reaps.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use log::warn;

use crate::error::{Error, Result};
use crate::time::Clock;

/// Wire size of a handshake datagram.
pub const TUPLE_WIRE_SIZE: usize = 24;

/// The tuple one end advertises during the handshake.
///
/// Wire layout, network byte order: LID at bytes 0-1, QPN at 2-5, initial
/// PSN at 6-9, nonce at 10-17, then a reserved zero trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePairTuple {
    /// Local identifier of the sender's port.
    pub lid: u16,
    /// Sender's queue-pair number.
    pub qpn: u32,
    /// Sender's initial packet sequence number.
    pub psn: u32,
    /// Exchange nonce; a reply carries the request's nonce unchanged.
    pub nonce: u64,
}

impl QueuePairTuple {
    /// Serialize to a handshake datagram.
    pub fn to_wire(&self) -> [u8; TUPLE_WIRE_SIZE] {
        let mut out = [0u8; TUPLE_WIRE_SIZE];
        out[0..2].copy_from_slice(&self.lid.to_be_bytes());
        out[2..6].copy_from_slice(&self.qpn.to_be_bytes());
        out[6..10].copy_from_slice(&self.psn.to_be_bytes());
        out[10..18].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    /// Deserialize from a handshake datagram.
    ///
    /// Returns None unless `bytes` is exactly one datagram.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TUPLE_WIRE_SIZE {
            return None;
        }
        Some(Self {
            lid: u16::from_be_bytes([bytes[0], bytes[1]]),
            qpn: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            psn: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            nonce: u64::from_be_bytes([
                bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15], bytes[16],
                bytes[17],
            ]),
        })
    }
}

/// The pair of non-blocking UDP sockets used for handshaking.
///
/// Every endpoint has an ephemeral client socket; servers additionally
/// bind a setup socket at their advertised address.
pub struct HandshakeEndpoint {
    client: UdpSocket,
    server: Option<UdpSocket>,
}

impl HandshakeEndpoint {
    /// Create a client-only endpoint.
    pub fn client_only() -> Result<Self> {
        let client = UdpSocket::bind("0.0.0.0:0")?;
        client.set_nonblocking(true)?;
        Ok(Self {
            client,
            server: None,
        })
    }

    /// Create a server endpoint bound at `addr`.
    pub fn server(addr: SocketAddr) -> Result<Self> {
        let mut endpoint = Self::client_only()?;
        let server = UdpSocket::bind(addr)?;
        server.set_nonblocking(true)?;
        endpoint.server = Some(server);
        Ok(endpoint)
    }

    /// Whether this endpoint accepts setup requests.
    #[inline]
    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    /// The bound address of the setup socket, if this is a server.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Send our tuple to `server` and wait up to `timeout_us` for a reply
    /// carrying the same nonce.
    ///
    /// Exactly one request is sent per invocation, but multiple replies may
    /// arrive (delayed replies to earlier attempts); mismatched nonces are
    /// dropped with a warning and do not consume the attempt. `drive` is
    /// called while waiting so that other handlers keep running, in
    /// particular our own setup handler, without which connecting to
    /// ourselves could never complete.
    ///
    /// Returns Ok(None) on timeout. Socket errors other than would-block
    /// surface as `Error::Io`.
    pub fn try_exchange(
        &self,
        server: SocketAddr,
        outgoing: &QueuePairTuple,
        timeout_us: u64,
        clock: &dyn Clock,
        drive: &mut dyn FnMut(),
    ) -> Result<Option<QueuePairTuple>> {
        let start = clock.now_us();
        let request = outgoing.to_wire();
        let mut have_sent = false;
        let mut reply = [0u8; TUPLE_WIRE_SIZE + 1];

        loop {
            if !have_sent {
                match self.client.send_to(&request, server) {
                    Ok(_) => have_sent = true,
                    Err(e) if retriable(&e) => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }

            match self.client.recv_from(&mut reply) {
                Ok((n, _)) => match QueuePairTuple::from_wire(&reply[..n]) {
                    Some(incoming) if incoming.nonce == outgoing.nonce => {
                        return Ok(Some(incoming));
                    }
                    Some(incoming) => {
                        warn!(
                            "received nonce doesn't match ({:#018x} != {:#018x})",
                            incoming.nonce, outgoing.nonce
                        );
                    }
                    None => {
                        warn!("handshake reply has bad length ({} bytes)", n);
                    }
                },
                Err(e) if retriable(&e) => {}
                Err(e) => return Err(Error::Io(e)),
            }

            if clock.now_us().saturating_sub(start) >= timeout_us {
                return Ok(None);
            }

            drive();
            std::hint::spin_loop();
        }
    }

    /// Receive one setup request from the server socket, if any is pending.
    ///
    /// Undersized or oversized datagrams are dropped with a warning.
    pub fn recv_setup_request(&self) -> Option<(QueuePairTuple, SocketAddr)> {
        let server = self.server.as_ref()?;
        let mut raw = [0u8; TUPLE_WIRE_SIZE + 1];
        match server.recv_from(&mut raw) {
            Ok((n, from)) => match QueuePairTuple::from_wire(&raw[..n]) {
                Some(tuple) => Some((tuple, from)),
                None => {
                    warn!("setup request has strange size: {} bytes", n);
                    None
                }
            },
            Err(e) if retriable(&e) => None,
            Err(e) => {
                warn!("setup socket recv failed: {}", e);
                None
            }
        }
    }

    /// Send a setup reply from the server socket.
    ///
    /// Returns false (with a warning) if the send did not go out; the
    /// client will retry the whole exchange.
    pub fn send_setup_reply(&self, to: SocketAddr, tuple: &QueuePairTuple) -> bool {
        let server = match &self.server {
            Some(s) => s,
            None => return false,
        };
        match server.send_to(&tuple.to_wire(), to) {
            Ok(n) if n == TUPLE_WIRE_SIZE => true,
            Ok(n) => {
                warn!("setup reply sent short: {} bytes", n);
                false
            }
            Err(e) => {
                warn!("setup reply send failed: {}", e);
                false
            }
        }
    }
}

fn retriable(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}
