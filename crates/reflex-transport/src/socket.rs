//! Asynchronous socket interface.
//!
//! Sockets never block: every send and receive either completes immediately
//! or fails with [`io::ErrorKind::WouldBlock`]. Readiness is reported as
//! [`SocketEvent`]s pushed into a single subscribed sink, so the owner learns
//! when to retry without polling the socket in a loop.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Readiness signal raised by a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Connection established; the socket is usable in both directions
    Connect,
    /// Data is available to read
    Read,
    /// Buffer space is available to write
    Write,
    /// Socket closed, carrying the OS error code (0 for an orderly close)
    Close(i32),
}

/// Sending half of a socket's event subscription
pub type SocketEventSender = mpsc::UnboundedSender<SocketEvent>;

/// Receiving half of a socket's event subscription
pub type SocketEventReceiver = mpsc::UnboundedReceiver<SocketEvent>;

/// Create a fresh event subscription channel
#[must_use]
pub fn event_channel() -> (SocketEventSender, SocketEventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection state of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Not usable
    Closed,
    /// Connection in progress
    Connecting,
    /// Usable
    Connected,
}

/// Socket options that can be passed through to the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// `SO_RCVBUF` in bytes
    RecvBufferSize,
    /// `SO_SNDBUF` in bytes
    SendBufferSize,
    /// IP time-to-live for outgoing packets
    Ttl,
    /// `SO_BROADCAST` (0 or 1)
    Broadcast,
}

/// Non-blocking socket with readiness signals.
///
/// Datagram sockets implement both the connected (`send`/`recv`) and the
/// unconnected (`send_to`/`recv_from`) calls; `send` on a socket that was
/// never connected fails with [`io::ErrorKind::NotConnected`].
pub trait AsyncSocket: Send {
    /// Local address the socket is bound to
    ///
    /// # Errors
    /// Returns an error if the address cannot be determined
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Peer address set by [`AsyncSocket::connect`]
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Current connection state
    fn state(&self) -> SocketState;

    /// Associate the socket with a single peer.
    ///
    /// Raises [`SocketEvent::Connect`] once the association is usable.
    ///
    /// # Errors
    /// Returns an error if the socket is closed or the OS rejects the peer
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// Send to the connected peer
    ///
    /// # Errors
    /// `WouldBlock` when the send buffer is full, otherwise the OS error
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Receive from the connected peer
    ///
    /// # Errors
    /// `WouldBlock` when nothing is queued, otherwise the OS error
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send a datagram to `addr`
    ///
    /// # Errors
    /// `WouldBlock` when the send buffer is full, otherwise the OS error
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive a datagram and its source address
    ///
    /// # Errors
    /// `WouldBlock` when nothing is queued, otherwise the OS error
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Set a socket option
    ///
    /// # Errors
    /// Returns the OS error if the option is rejected
    fn set_option(&mut self, opt: SocketOption, value: i32) -> io::Result<()>;

    /// Read a socket option
    ///
    /// # Errors
    /// Returns the OS error if the option cannot be read
    fn get_option(&self, opt: SocketOption) -> io::Result<i32>;

    /// Shut the socket down. Later I/O fails with `NotConnected`.
    ///
    /// # Errors
    /// Returns the OS error if shutdown fails
    fn close(&mut self) -> io::Result<()>;

    /// Register the sink readiness events are delivered to, replacing any
    /// previous one. `None` unregisters.
    fn subscribe(&mut self, sink: Option<SocketEventSender>);

    /// Drive readiness detection from an async context.
    ///
    /// Resolves after at least one event was pushed into the subscribed
    /// sink. Sockets that signal readiness by other means never resolve.
    fn poll_readiness(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
        Poll::Pending
    }
}

/// Creates bound UDP sockets
pub trait PacketSocketFactory {
    /// Bind a UDP socket on `ip` using the first free port in
    /// `min_port..=max_port`. A range of `0..=0` lets the OS choose.
    ///
    /// # Errors
    /// Returns `AddrInUse` when every port in the range is taken, or the
    /// OS error from socket creation
    fn create_udp_socket(
        &self,
        ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> io::Result<Box<dyn AsyncSocket>>;
}

/// OS error code carried by `err`, or `-1` when it has none
#[must_use]
pub fn error_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

/// Error returned by I/O on a closed socket
pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

/// Ports to try, in order, for a bind in `min_port..=max_port`
pub(crate) fn port_candidates(min_port: u16, max_port: u16) -> std::ops::RangeInclusive<u16> {
    if min_port == 0 && max_port == 0 {
        0..=0
    } else {
        min_port.max(1)..=max_port
    }
}
