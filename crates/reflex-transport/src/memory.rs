//! In-memory sockets for tests.
//!
//! A [`MemorySocket`] behaves like a bound UDP socket but never touches the
//! network. Its paired [`MemorySocketHandle`] stays with the test and can
//! inject datagrams, inspect what was sent, force send failures and raise
//! readiness signals at will.

use crate::socket::{
    AsyncSocket, PacketSocketFactory, SocketEvent, SocketEventSender, SocketOption, SocketState,
    not_connected, port_candidates,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// First port handed out by [`MemorySocketFactory`] for "any port" binds
const EPHEMERAL_BASE: u16 = 40000;

/// How sends on a [`MemorySocket`] should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Sends report `WouldBlock`
    WouldBlock,
    /// Sends report the given OS error code
    Os(i32),
}

impl SendFailure {
    fn to_error(self) -> io::Error {
        match self {
            Self::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            Self::Os(code) => io::Error::from_raw_os_error(code),
        }
    }
}

struct Shared {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    state: SocketState,
    inbound: VecDeque<(Vec<u8>, SocketAddr)>,
    sent: Vec<(Vec<u8>, SocketAddr)>,
    send_failure: Option<SendFailure>,
    sink: Option<SocketEventSender>,
    options: HashMap<SocketOption, i32>,
    dropped: bool,
}

impl Shared {
    fn signal(&self, event: SocketEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Socket half handed to the code under test
pub struct MemorySocket {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side controller for a [`MemorySocket`]
#[derive(Clone)]
pub struct MemorySocketHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MemorySocket {
    /// Create a socket bound to `local` and its controlling handle
    #[must_use]
    pub fn new(local: SocketAddr) -> (Self, MemorySocketHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            local,
            remote: None,
            state: SocketState::Connected,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            send_failure: None,
            sink: None,
            options: HashMap::new(),
            dropped: false,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemorySocketHandle { shared },
        )
    }

    fn transmit(&mut self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let mut shared = lock(&self.shared);
        if shared.state == SocketState::Closed {
            return Err(not_connected());
        }
        if let Some(failure) = shared.send_failure {
            return Err(failure.to_error());
        }
        shared.sent.push((data.to_vec(), dest));
        Ok(data.len())
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.dropped = true;
        shared.state = SocketState::Closed;
        shared.sink = None;
    }
}

impl AsyncSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(lock(&self.shared).local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared).remote
    }

    fn state(&self) -> SocketState {
        lock(&self.shared).state
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut shared = lock(&self.shared);
        if shared.state == SocketState::Closed {
            return Err(not_connected());
        }
        shared.remote = Some(addr);
        shared.state = SocketState::Connected;
        shared.signal(SocketEvent::Connect);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let remote = lock(&self.shared).remote.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "socket has no connected peer")
        })?;
        self.transmit(data, remote)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_from(buf).map(|(len, _)| len)
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.transmit(data, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut shared = lock(&self.shared);
        if shared.state == SocketState::Closed {
            return Err(not_connected());
        }
        let (data, from) = shared
            .inbound
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn set_option(&mut self, opt: SocketOption, value: i32) -> io::Result<()> {
        let mut shared = lock(&self.shared);
        if shared.state == SocketState::Closed {
            return Err(not_connected());
        }
        if value < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("negative value {value} for {opt:?}"),
            ));
        }
        shared.options.insert(opt, value);
        Ok(())
    }

    fn get_option(&self, opt: SocketOption) -> io::Result<i32> {
        let shared = lock(&self.shared);
        if shared.state == SocketState::Closed {
            return Err(not_connected());
        }
        Ok(shared.options.get(&opt).copied().unwrap_or(0))
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.shared).state = SocketState::Closed;
        Ok(())
    }

    fn subscribe(&mut self, sink: Option<SocketEventSender>) {
        lock(&self.shared).sink = sink;
    }
}

impl MemorySocketHandle {
    /// Address the socket is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        lock(&self.shared).local
    }

    /// Queue a datagram from `from` and raise [`SocketEvent::Read`]
    pub fn inject(&self, data: &[u8], from: SocketAddr) {
        let mut shared = lock(&self.shared);
        shared.inbound.push_back((data.to_vec(), from));
        shared.signal(SocketEvent::Read);
    }

    /// Datagrams sent so far, with their destinations
    #[must_use]
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        lock(&self.shared).sent.clone()
    }

    /// Remove and return the datagrams sent so far
    pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut lock(&self.shared).sent)
    }

    /// Make every following send fail, or succeed again with `None`
    pub fn fail_sends(&self, failure: Option<SendFailure>) {
        lock(&self.shared).send_failure = failure;
    }

    /// Raise an arbitrary readiness signal
    pub fn signal(&self, event: SocketEvent) {
        lock(&self.shared).signal(event);
    }

    /// Simulate the peer or the OS closing the socket with `code`
    pub fn close_remote(&self, code: i32) {
        let mut shared = lock(&self.shared);
        shared.state = SocketState::Closed;
        shared.signal(SocketEvent::Close(code));
    }

    /// Force the reported connection state
    pub fn set_state(&self, state: SocketState) {
        lock(&self.shared).state = state;
    }

    /// The socket was closed by its owner or by [`Self::close_remote`]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).state == SocketState::Closed
    }

    /// The socket itself has been dropped
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        lock(&self.shared).dropped
    }

    /// A sink is currently registered
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        lock(&self.shared).sink.is_some()
    }

    /// Value last stored for `opt`
    #[must_use]
    pub fn option(&self, opt: SocketOption) -> Option<i32> {
        lock(&self.shared).options.get(&opt).copied()
    }
}

#[derive(Default)]
struct FactoryState {
    used: HashSet<(IpAddr, u16)>,
    next_ephemeral: u16,
    fail: Option<io::ErrorKind>,
    handles: Vec<MemorySocketHandle>,
}

/// [`PacketSocketFactory`] producing [`MemorySocket`]s.
///
/// Ports in the requested range are handed out in order and stay taken for
/// the factory's lifetime. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySocketFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MemorySocketFactory {
    /// Create an empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make following creations fail with `kind`, or succeed with `None`
    pub fn fail_with(&self, kind: Option<io::ErrorKind>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail = kind;
    }

    /// Handles of every socket created so far, oldest first
    #[must_use]
    pub fn handles(&self) -> Vec<MemorySocketHandle> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .clone()
    }

    /// Handle of the most recently created socket
    #[must_use]
    pub fn last_handle(&self) -> Option<MemorySocketHandle> {
        self.handles().pop()
    }
}

impl PacketSocketFactory for MemorySocketFactory {
    fn create_udp_socket(
        &self,
        ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> io::Result<Box<dyn AsyncSocket>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kind) = state.fail {
            return Err(io::Error::new(kind, "socket creation disabled"));
        }

        let port = if min_port == 0 && max_port == 0 {
            let port = EPHEMERAL_BASE.saturating_add(state.next_ephemeral);
            state.next_ephemeral = state.next_ephemeral.wrapping_add(1);
            Some(port)
        } else {
            port_candidates(min_port, max_port).find(|port| !state.used.contains(&(ip, *port)))
        };
        let port = port.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("no free port on {ip} in {min_port}..={max_port}"),
            )
        })?;

        state.used.insert((ip, port));
        let (socket, handle) = MemorySocket::new(SocketAddr::new(ip, port));
        state.handles.push(handle);
        Ok(Box::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::event_channel;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_inject_then_recv() {
        let (mut socket, handle) = MemorySocket::new(addr("10.0.0.1:5000"));
        let (tx, mut rx) = event_channel();
        socket.subscribe(Some(tx));

        handle.inject(b"datagram", addr("198.51.100.7:3478"));
        assert_eq!(rx.try_recv().unwrap(), SocketEvent::Read);

        let mut buf = [0u8; 32];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"datagram");
        assert_eq!(from, addr("198.51.100.7:3478"));

        let err = socket.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_sends_are_recorded() {
        let (mut socket, handle) = MemorySocket::new(addr("10.0.0.1:5000"));
        socket.send_to(b"one", addr("10.0.0.2:1")).unwrap();
        socket.send_to(b"two", addr("10.0.0.3:2")).unwrap();

        let sent = handle.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], (b"two".to_vec(), addr("10.0.0.3:2")));
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_forced_send_failure() {
        let (mut socket, handle) = MemorySocket::new(addr("10.0.0.1:5000"));
        handle.fail_sends(Some(SendFailure::Os(101)));
        let err = socket.send_to(b"x", addr("10.0.0.2:1")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(101));

        handle.fail_sends(Some(SendFailure::WouldBlock));
        let err = socket.send_to(b"x", addr("10.0.0.2:1")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        handle.fail_sends(None);
        assert_eq!(socket.send_to(b"x", addr("10.0.0.2:1")).unwrap(), 1);
    }

    #[test]
    fn test_drop_is_observable() {
        let (socket, handle) = MemorySocket::new(addr("10.0.0.1:5000"));
        assert!(!handle.is_dropped());
        drop(socket);
        assert!(handle.is_dropped());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_factory_sequential_ports_in_range() {
        let factory = MemorySocketFactory::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let a = factory.create_udp_socket(ip, 7000, 7001).unwrap();
        let b = factory.create_udp_socket(ip, 7000, 7001).unwrap();
        assert_eq!(a.local_addr().unwrap().port(), 7000);
        assert_eq!(b.local_addr().unwrap().port(), 7001);

        let err = factory.create_udp_socket(ip, 7000, 7001).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(factory.handles().len(), 2);
    }

    #[test]
    fn test_factory_forced_failure() {
        let factory = MemorySocketFactory::new();
        factory.fail_with(Some(io::ErrorKind::PermissionDenied));
        let err = factory
            .create_udp_socket("10.0.0.1".parse().unwrap(), 0, 0)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(factory.last_handle().is_none());
    }
}
