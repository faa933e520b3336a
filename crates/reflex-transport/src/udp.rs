//! Tokio-backed UDP socket.
//!
//! The socket is created through `socket2` so buffer sizes can be raised
//! before binding, then handed to Tokio. Reads and writes are plain
//! non-blocking syscalls made through `socket2`, so they work before the
//! reactor has seen the socket; readiness is detected in
//! [`AsyncSocket::poll_readiness`] and reported to the subscribed sink.

use crate::socket::{
    AsyncSocket, PacketSocketFactory, SocketEvent, SocketEventSender, SocketOption, SocketState,
    error_code, not_connected, port_candidates,
};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};
use tokio::io::Interest;

/// Default kernel buffer size requested for each direction
const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Non-blocking UDP socket registered with the Tokio reactor.
///
/// Must be created from within a Tokio runtime.
pub struct UdpSocket {
    socket: tokio::net::UdpSocket,
    remote: Option<SocketAddr>,
    state: SocketState,
    sink: Option<SocketEventSender>,
    /// A send hit `WouldBlock`; watch for write readiness
    write_blocked: bool,
}

impl UdpSocket {
    /// Bind a socket to `addr`. Port 0 lets the OS choose.
    ///
    /// # Errors
    /// Returns the OS error if the socket cannot be created or bound
    ///
    /// # Examples
    /// ```no_run
    /// use reflex_transport::socket::AsyncSocket;
    /// use reflex_transport::udp::UdpSocket;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> std::io::Result<()> {
    /// let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap())?;
    /// println!("Bound to {}", socket.local_addr()?);
    /// # Ok(())
    /// # }
    /// ```
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket2 = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_nonblocking(true)?;
        socket2.set_recv_buffer_size(DEFAULT_BUFFER_SIZE)?;
        socket2.set_send_buffer_size(DEFAULT_BUFFER_SIZE)?;
        socket2.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket2.into();
        Self::from_std(std_socket)
    }

    /// Bind on `ip` using the first free port in `min_port..=max_port`
    ///
    /// # Errors
    /// `AddrInUse` when no port in the range is free, or the first error
    /// that is not `AddrInUse`
    pub fn bind_in_range(ip: IpAddr, min_port: u16, max_port: u16) -> io::Result<Self> {
        let mut last_err = None;
        for port in port_candidates(min_port, max_port) {
            match Self::bind(SocketAddr::new(ip, port)) {
                Ok(socket) => return Ok(socket),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("no free UDP port on {ip} in {min_port}..={max_port}"),
            )
        }))
    }

    /// Wrap an already-bound std socket
    ///
    /// # Errors
    /// Returns an error if the socket cannot be registered with Tokio
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: tokio::net::UdpSocket::from_std(socket)?,
            remote: None,
            state: SocketState::Connected,
            sink: None,
            write_blocked: false,
        })
    }

    fn signal(&self, event: SocketEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.state == SocketState::Closed {
            return Err(not_connected());
        }
        Ok(())
    }

    /// Make the syscall in `op` without waiting.
    ///
    /// When the reactor already reports the socket ready, the call goes
    /// through it so a `WouldBlock` clears that readiness. Otherwise the
    /// syscall is made directly.
    fn nonblocking<T>(
        &self,
        interest: Interest,
        mut op: impl FnMut(&Socket) -> io::Result<T>,
    ) -> io::Result<T> {
        let sock = SockRef::from(&self.socket);
        let mut attempted = false;
        let result = self.socket.try_io(interest, || {
            attempted = true;
            op(&sock)
        });
        match result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && !attempted => op(&sock),
            other => other,
        }
    }

    fn note_would_block<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            if e.kind() == io::ErrorKind::WouldBlock {
                self.write_blocked = true;
            }
        }
        result
    }
}

impl AsyncSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn state(&self) -> SocketState {
        self.state
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.check_open()?;
        SockRef::from(&self.socket).connect(&addr.into())?;
        self.remote = Some(addr);
        self.signal(SocketEvent::Connect);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        if self.remote.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket has no connected peer",
            ));
        }
        let result = self.nonblocking(Interest::WRITABLE, |sock| sock.send(data));
        self.note_would_block(result)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        self.nonblocking(Interest::READABLE, |mut sock| sock.read(buf))
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.check_open()?;
        let dest = addr.into();
        let result = self.nonblocking(Interest::WRITABLE, |sock| sock.send_to(data, &dest));
        self.note_would_block(result)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.check_open()?;
        self.nonblocking(Interest::READABLE, |mut sock| {
            // Sender first; the read below consumes the same datagram
            let from = sock.peek_sender()?.as_socket().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "datagram from a non-IP sender")
            })?;
            let len = sock.read(buf)?;
            Ok((len, from))
        })
    }

    fn set_option(&mut self, opt: SocketOption, value: i32) -> io::Result<()> {
        self.check_open()?;
        let value = u32::try_from(value).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("negative value {value} for {opt:?}"),
            )
        })?;
        let sock = SockRef::from(&self.socket);
        match opt {
            SocketOption::RecvBufferSize => sock.set_recv_buffer_size(value as usize),
            SocketOption::SendBufferSize => sock.set_send_buffer_size(value as usize),
            SocketOption::Ttl => self.socket.set_ttl(value),
            SocketOption::Broadcast => self.socket.set_broadcast(value != 0),
        }
    }

    fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        self.check_open()?;
        let sock = SockRef::from(&self.socket);
        let value = match opt {
            SocketOption::RecvBufferSize => sock.recv_buffer_size()?,
            SocketOption::SendBufferSize => sock.send_buffer_size()?,
            SocketOption::Ttl => self.socket.ttl()? as usize,
            SocketOption::Broadcast => usize::from(self.socket.broadcast()?),
        };
        i32::try_from(value).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "option overflow"))
    }

    fn close(&mut self) -> io::Result<()> {
        self.state = SocketState::Closed;
        self.write_blocked = false;
        Ok(())
    }

    fn subscribe(&mut self, sink: Option<SocketEventSender>) {
        self.sink = sink;
    }

    fn poll_readiness(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.state == SocketState::Closed {
            return Poll::Pending;
        }

        let mut signalled = false;
        match self.socket.poll_recv_ready(cx) {
            Poll::Ready(Ok(())) => {
                self.signal(SocketEvent::Read);
                signalled = true;
            }
            Poll::Ready(Err(e)) => {
                tracing::warn!("UDP socket failed while waiting for data: {}", e);
                self.state = SocketState::Closed;
                self.signal(SocketEvent::Close(error_code(&e)));
                return Poll::Ready(());
            }
            Poll::Pending => {}
        }

        if self.write_blocked {
            if let Poll::Ready(result) = self.socket.poll_send_ready(cx) {
                self.write_blocked = false;
                match result {
                    Ok(()) => self.signal(SocketEvent::Write),
                    Err(e) => {
                        self.state = SocketState::Closed;
                        self.signal(SocketEvent::Close(error_code(&e)));
                    }
                }
                signalled = true;
            }
        }

        if signalled { Poll::Ready(()) } else { Poll::Pending }
    }
}

/// [`PacketSocketFactory`] producing [`UdpSocket`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSocketFactory;

impl PacketSocketFactory for TokioSocketFactory {
    fn create_udp_socket(
        &self,
        ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> io::Result<Box<dyn AsyncSocket>> {
        let socket = UdpSocket::bind_in_range(ip, min_port, max_port)?;
        tracing::info!("Bound UDP socket on {}", socket.local_addr()?);
        Ok(Box::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::event_channel;
    use std::future::poll_fn;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn wait_readable(socket: &mut UdpSocket) {
        timeout(Duration::from_secs(1), poll_fn(|cx| socket.poll_readiness(cx)))
            .await
            .expect("Timeout waiting for readiness");
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let socket = UdpSocket::bind(loopback()).unwrap();
        let bound = socket.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
        assert!(bound.is_ipv4());
        assert_eq!(socket.state(), SocketState::Connected);
    }

    #[tokio::test]
    async fn test_udp_recv_would_block_when_empty() {
        let mut socket = UdpSocket::bind(loopback()).unwrap();
        let mut buf = [0u8; 64];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_udp_send_recv_with_readiness() {
        let mut server = UdpSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let (tx, mut rx) = event_channel();
        server.subscribe(Some(tx));

        let mut client = UdpSocket::bind(loopback()).unwrap();
        let sent = client.send_to(b"Hello, reflex!", server_addr).unwrap();
        assert_eq!(sent, 14);

        wait_readable(&mut server).await;
        assert_eq!(rx.try_recv().unwrap(), SocketEvent::Read);

        let mut buf = [0u8; 1500];
        let (size, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"Hello, reflex!");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_first_io_does_not_wait_for_reactor() {
        let mut server = UdpSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = UdpSocket::bind(loopback()).unwrap();

        // Neither socket has been polled, so the reactor has reported nothing
        assert_eq!(client.send_to(b"first", server_addr).unwrap(), 5);
        std::thread::sleep(Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let (size, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"first");
        assert_eq!(from, client.local_addr().unwrap());

        let err = server.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_udp_connect_signals_and_enables_send() {
        let mut server = UdpSocket::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client = UdpSocket::bind(loopback()).unwrap();
        let (tx, mut rx) = event_channel();
        client.subscribe(Some(tx));

        let err = client.send(b"early").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        client.connect(server_addr).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SocketEvent::Connect);
        assert_eq!(client.remote_addr(), Some(server_addr));
        assert_eq!(client.send(b"ping").unwrap(), 4);

        wait_readable(&mut server).await;
        let mut buf = [0u8; 16];
        let (size, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"ping");
    }

    #[tokio::test]
    async fn test_udp_bind_in_range_skips_taken_port() {
        let taken = UdpSocket::bind(loopback()).unwrap();
        let port = taken.local_addr().unwrap().port();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let err = UdpSocket::bind_in_range(ip, port, port).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_udp_bind_in_range_any_port() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let socket = UdpSocket::bind_in_range(ip, 0, 0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_udp_ttl_option_roundtrip() {
        let mut socket = UdpSocket::bind(loopback()).unwrap();
        socket.set_option(SocketOption::Ttl, 42).unwrap();
        assert_eq!(socket.get_option(SocketOption::Ttl).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_udp_negative_option_rejected() {
        let mut socket = UdpSocket::bind(loopback()).unwrap();
        let err = socket.set_option(SocketOption::Ttl, -1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_udp_close_rejects_io() {
        let mut socket = UdpSocket::bind(loopback()).unwrap();
        socket.close().unwrap();
        assert_eq!(socket.state(), SocketState::Closed);

        let err = socket.send_to(b"x", "127.0.0.1:9".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_factory_binds_loopback() {
        let socket = TokioSocketFactory
            .create_udp_socket("127.0.0.1".parse().unwrap(), 0, 0)
            .unwrap();
        assert!(socket.local_addr().unwrap().ip().is_loopback());
    }
}
