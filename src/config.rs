//! Configuration for the transport.
//!
//! The constants below are the documented defaults for the tunables on the
//! transport interface; `TransportConfig` lets a process override them at
//! construction time (tests use much smaller pools than production).

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Maximum bytes per RPC in either direction.
///
/// Every receive and transmit buffer is sized to this, so a node never has
/// to scatter an incoming message over multiple posted buffers.
pub const MAX_RPC_SIZE: usize = (1 << 23) + 4096;

/// Per-SRQ receive buffer count; caps concurrent outstanding RPCs.
pub const MAX_SHARED_RX_QUEUE_DEPTH: usize = 64;

/// Scatter-gather entries per SRQ receive work request.
pub const MAX_SHARED_RX_SGE_COUNT: u32 = 8;

/// Caps concurrent in-flight transmissions across all queue pairs.
pub const MAX_TX_QUEUE_DEPTH: usize = 16;

/// Microseconds to wait for a handshake reply before resending.
pub const QP_EXCHANGE_USEC_TIMEOUT: u64 = 50_000;

/// Number of handshake attempts before giving up on a server.
pub const QP_EXCHANGE_MAX_TIMEOUTS: u32 = 10;

/// How long the dispatch loop keeps busy-polling after its last useful
/// tick before yielding the processor.
pub const POLL_MICROS: u64 = 10_000;

/// Transport configuration.
///
/// Defaults mirror the crate constants.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum bytes per RPC; also the pool slot size.
    pub max_rpc_size: usize,
    /// Depth of each shared receive queue.
    pub srq_depth: usize,
    /// Scatter-gather entries per SRQ work request.
    pub srq_sge: u32,
    /// Depth of the common transmit queue.
    pub tx_depth: usize,
    /// Per-attempt handshake timeout in microseconds.
    pub exchange_usec_timeout: u64,
    /// Handshake attempt budget.
    pub exchange_max_timeouts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_rpc_size: MAX_RPC_SIZE,
            srq_depth: MAX_SHARED_RX_QUEUE_DEPTH,
            srq_sge: MAX_SHARED_RX_SGE_COUNT,
            tx_depth: MAX_TX_QUEUE_DEPTH,
            exchange_usec_timeout: QP_EXCHANGE_USEC_TIMEOUT,
            exchange_max_timeouts: QP_EXCHANGE_MAX_TIMEOUTS,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum RPC size.
    pub fn with_max_rpc_size(mut self, max_rpc_size: usize) -> Self {
        self.max_rpc_size = max_rpc_size;
        self
    }

    /// Set the shared receive queue depth.
    pub fn with_srq_depth(mut self, srq_depth: usize) -> Self {
        self.srq_depth = srq_depth;
        self
    }

    /// Set the transmit queue depth.
    pub fn with_tx_depth(mut self, tx_depth: usize) -> Self {
        self.tx_depth = tx_depth;
        self
    }

    /// Set the per-attempt handshake timeout in microseconds.
    pub fn with_exchange_usec_timeout(mut self, usec: u64) -> Self {
        self.exchange_usec_timeout = usec;
        self
    }

    /// Set the handshake attempt budget.
    pub fn with_exchange_max_timeouts(mut self, attempts: u32) -> Self {
        self.exchange_max_timeouts = attempts;
        self
    }
}

/// Parsed Infiniband service locator.
///
/// String form: `kind=infrc,dev=<hca-name>,devport=<n>,host=<ip>,port=<udp-port>`.
/// `dev` and `devport` are optional and default to the first HCA / port 1;
/// `host` and `port` name the UDP endpoint used for queue-pair handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLocator {
    /// HCA device name, if pinned.
    pub device: Option<String>,
    /// Physical port on the HCA.
    pub dev_port: u8,
    /// UDP endpoint for handshakes.
    pub addr: SocketAddr,
    original: String,
}

impl ServiceLocator {
    /// Parse a locator string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut kind = None;
        let mut device = None;
        let mut dev_port = 1u8;
        let mut host: Option<IpAddr> = None;
        let mut port: Option<u16> = None;

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::InvalidLocator(format!("missing '=' in `{}`", part)))?;
            match key {
                "kind" => kind = Some(value.to_string()),
                "dev" => device = Some(value.to_string()),
                "devport" => {
                    dev_port = value.parse().map_err(|_| {
                        Error::InvalidLocator(format!("bad devport `{}`", value))
                    })?;
                }
                "host" => {
                    host = Some(value.parse().map_err(|_| {
                        Error::InvalidLocator(format!("bad host `{}`", value))
                    })?);
                }
                "port" => {
                    port = Some(value.parse().map_err(|_| {
                        Error::InvalidLocator(format!("bad port `{}`", value))
                    })?);
                }
                _ => {
                    return Err(Error::InvalidLocator(format!("unknown option `{}`", key)));
                }
            }
        }

        match kind.as_deref() {
            Some("infrc") => {}
            Some(other) => {
                return Err(Error::InvalidLocator(format!("unsupported kind `{}`", other)));
            }
            None => return Err(Error::InvalidLocator("missing kind".into())),
        }
        let host = host.ok_or_else(|| Error::InvalidLocator("missing host".into()))?;
        let port = port.ok_or_else(|| Error::InvalidLocator("missing port".into()))?;

        Ok(Self {
            device,
            dev_port,
            addr: SocketAddr::new(host, port),
            original: s.to_string(),
        })
    }

    /// The original locator string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::default()
            .with_max_rpc_size(4096)
            .with_srq_depth(4)
            .with_tx_depth(2)
            .with_exchange_usec_timeout(1000)
            .with_exchange_max_timeouts(3);

        assert_eq!(config.max_rpc_size, 4096);
        assert_eq!(config.srq_depth, 4);
        assert_eq!(config.tx_depth, 2);
        assert_eq!(config.exchange_usec_timeout, 1000);
        assert_eq!(config.exchange_max_timeouts, 3);
    }

    #[test]
    fn test_locator_full() {
        let sl =
            ServiceLocator::parse("kind=infrc,dev=mlx5_0,devport=2,host=10.0.0.7,port=8100")
                .unwrap();
        assert_eq!(sl.device.as_deref(), Some("mlx5_0"));
        assert_eq!(sl.dev_port, 2);
        assert_eq!(sl.addr, "10.0.0.7:8100".parse().unwrap());
    }

    #[test]
    fn test_locator_defaults() {
        let sl = ServiceLocator::parse("kind=infrc,host=127.0.0.1,port=9000").unwrap();
        assert_eq!(sl.device, None);
        assert_eq!(sl.dev_port, 1);
    }

    #[test]
    fn test_locator_rejects() {
        assert!(ServiceLocator::parse("kind=tcp,host=127.0.0.1,port=1").is_err());
        assert!(ServiceLocator::parse("host=127.0.0.1,port=1").is_err());
        assert!(ServiceLocator::parse("kind=infrc,port=1").is_err());
        assert!(ServiceLocator::parse("kind=infrc,host=127.0.0.1").is_err());
        assert!(ServiceLocator::parse("kind=infrc,host=bogus,port=1").is_err());
    }
}
