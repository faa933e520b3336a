//! Error types for ports and connections
//!
//! Would-block is the only transient error: the caller retries after the
//! next write-readiness event. Everything else needs the caller to change
//! something first.

use crate::candidate::AddressFamily;
use crate::port::PortState;
use reflex_transport::error_code;
use std::borrow::Cow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Result type for port operations
pub type Result<T> = std::result::Result<T, PortError>;

/// Errors returned by [`Port`](crate::Port) and its handle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// No UDP socket could be bound in the configured range
    #[error("Failed to bind UDP socket on {ip} in {min_port}..={max_port}: {message}")]
    Bind {
        /// Requested interface address
        ip: IpAddr,
        /// Lower port bound
        min_port: u16,
        /// Upper port bound
        max_port: u16,
        /// OS error text
        message: String,
    },

    /// Operation needs a ready port
    #[error("Port is not ready (state {0:?})")]
    NotReady(PortState),

    /// Remote address family differs from the port's
    #[error("Address family mismatch: port is {local}, remote is {remote}")]
    FamilyMismatch {
        /// Port family
        local: AddressFamily,
        /// Remote family
        remote: AddressFamily,
    },

    /// Remote candidate uses a protocol the port cannot speak
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// No connection to this remote address
    #[error("No connection to {0}")]
    UnknownConnection(SocketAddr),

    /// The port's socket is closed
    #[error("Socket closed")]
    SocketClosed,

    /// Send buffer full; retry after the next write event
    #[error("Operation would block")]
    WouldBlock,

    /// Socket I/O failed
    #[error("Socket I/O error {code}: {message}")]
    Io {
        /// OS error code, -1 when unknown
        code: i32,
        /// OS error text
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// The driver task has stopped
    #[error("Port driver is no longer running")]
    DriverGone,
}

impl PortError {
    /// Retrying the same call later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// OS error code carried by this error, if any
    #[must_use]
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Io { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for PortError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::NotConnected => Self::SocketClosed,
            _ => Self::Io {
                code: error_code(&err),
                message: err.to_string(),
            },
        }
    }
}
