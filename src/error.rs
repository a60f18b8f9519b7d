//! Error types for the transport.

use std::fmt;

/// Error type for transport operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from a handshake socket call.
    Io(std::io::Error),
    /// The verbs layer reported a failure.
    Verbs(&'static str),
    /// The queue-pair handshake did not complete within its retry budget.
    HandshakeTimeout {
        /// Number of exchange attempts made.
        attempts: u32,
    },
    /// Payload exceeds the maximum RPC size.
    RpcTooLarge { size: usize, max: usize },
    /// No queue pair with this number is registered.
    QpNotFound(u32),
    /// The session was aborted; no further RPCs may be issued on it.
    SessionAborted(String),
    /// An RPC could not be completed.
    RpcFailed(String),
    /// A service locator string could not be parsed.
    InvalidLocator(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Verbs(msg) => write!(f, "verbs failure: {}", msg),
            Error::HandshakeTimeout { attempts } => {
                write!(f, "handshake timed out after {} attempts", attempts)
            }
            Error::RpcTooLarge { size, max } => {
                write!(f, "RPC too large: {} bytes, max {} bytes", size, max)
            }
            Error::QpNotFound(qpn) => write!(f, "queue pair {} not found", qpn),
            Error::SessionAborted(reason) => write!(f, "session aborted: {}", reason),
            Error::RpcFailed(msg) => write!(f, "RPC failed: {}", msg),
            Error::InvalidLocator(msg) => write!(f, "invalid service locator: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
