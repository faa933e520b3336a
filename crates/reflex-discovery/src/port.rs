//! UDP port: local socket, candidate gathering and packet routing.
//!
//! A [`Port`] binds one UDP socket, optionally learns its server-reflexive
//! address from a STUN server and demultiplexes incoming datagrams between
//! STUN responses and [`Connection`]s.
//!
//! The port is a plain state machine. It never waits and never reads a
//! clock: every time-dependent call takes `now`, timers are exposed through
//! [`Port::poll_timeout`], hostname lookups are requested through
//! [`Port::poll_resolve`] and results are pulled with [`Port::poll_event`].
//! [`spawn_port`](crate::spawn_port) drives one on a Tokio task.
//!
//! # Discovery
//!
//! | Policy        | Local candidate                 | Reflexive candidate       |
//! |---------------|---------------------------------|---------------------------|
//! | `LocalOnly`   | at `prepare_address`            | never                     |
//! | `PreferStun`  | at `prepare_address`            | if a server answers       |
//! | `RequireStun` | once discovery concludes        | if a server answers       |
//!
//! The fallback server is contacted only after the primary timed out or
//! could not be resolved. At most one discovery transaction is in flight.

use crate::candidate::{AddressFamily, Candidate, IceCredentials, UDP_PROTOCOL};
use crate::config::{DiscoveryPolicy, PortConfig, StunServer};
use crate::connection::Connection;
use crate::error::{PortError, Result};
use crate::resolver::pick_address;
use crate::stun::{
    RequestHost, RequestOutcome, StunMessage, StunRequestManager, TransactionId,
};
use reflex_transport::{
    AsyncSocket, PacketSocketFactory, SocketEvent, SocketEventReceiver, SocketOption, error_code,
    event_channel,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;

/// Receive buffer size; large enough for any UDP datagram
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Not yet bound
    Created,
    /// Socket bound, waiting for `prepare_address`
    Initializing,
    /// Waiting for the STUN server hostname to resolve
    ResolvingServer,
    /// Usable; discovery may still be in progress
    Ready,
    /// Socket closed; nothing more happens
    Closed,
}

/// Why server-reflexive discovery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryFailure {
    /// Server hostname did not resolve to a usable address
    Resolution,
    /// No response after every retransmission
    Timeout,
    /// Server answered with an error code
    ServerError(u16),
    /// Success response without a mapped address
    MissingMappedAddress,
    /// Socket closed with this OS error code
    SocketError(i32),
}

impl fmt::Display for DiscoveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => write!(f, "STUN server did not resolve"),
            Self::Timeout => write!(f, "STUN server did not respond"),
            Self::ServerError(code) => write!(f, "STUN server returned error {code}"),
            Self::MissingMappedAddress => write!(f, "STUN response carried no mapped address"),
            Self::SocketError(code) => write!(f, "socket closed with error {code}"),
        }
    }
}

/// Progress of server-reflexive discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    /// `prepare_address` not called yet
    NotStarted,
    /// Resolving or waiting for a response
    InProgress,
    /// Server reported this mapped address
    Succeeded(SocketAddr),
    /// Discovery ended without a mapped address
    Failed(DiscoveryFailure),
    /// Policy or configuration rules discovery out
    NotApplicable,
}

/// Something the owner of a port should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A new candidate is available
    CandidateReady(Candidate),
    /// Discovery ended without a reflexive candidate
    DiscoveryFailed(DiscoveryFailure),
    /// No further candidates will be produced
    GatheringComplete,
    /// Datagram received on a connection
    Packet {
        /// Sender
        remote: SocketAddr,
        /// Payload
        data: Vec<u8>,
    },
    /// The socket closed with this OS error code
    SocketClosed(i32),
}

/// Hostname lookup the port needs performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Token to hand back with the result
    pub token: u64,
    /// Hostname to resolve
    pub host: String,
    /// Port to attach to the result
    pub port: u16,
    /// Address family the port can use
    pub family: AddressFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerRole {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Discovery(ServerRole),
    Keepalive,
}

type Outcomes = Vec<(TransactionId, RequestKind, RequestOutcome)>;

/// The parts of a port the transaction manager may touch
struct PortIo<'a> {
    socket: &'a mut dyn AsyncSocket,
    last_error: &'a mut Option<i32>,
    outcomes: Outcomes,
}

impl RequestHost<RequestKind> for PortIo<'_> {
    fn send_raw(&mut self, dest: SocketAddr, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, dest) {
            if e.kind() == io::ErrorKind::WouldBlock {
                tracing::trace!("STUN send to {} would block, left to retransmission", dest);
            } else {
                tracing::debug!("STUN send to {} failed: {}", dest, e);
                *self.last_error = Some(error_code(&e));
            }
        }
    }

    fn on_outcome(&mut self, id: TransactionId, tag: RequestKind, outcome: RequestOutcome) {
        self.outcomes.push((id, tag, outcome));
    }
}

/// UDP port producing local and server-reflexive candidates
pub struct Port {
    config: PortConfig,
    credentials: IceCredentials,
    socket: Box<dyn AsyncSocket>,
    socket_events: SocketEventReceiver,
    stashed_events: VecDeque<SocketEvent>,
    local_addr: SocketAddr,
    local_candidate: Candidate,
    local_emitted: bool,
    state: PortState,
    discovery: DiscoveryStatus,
    requests: StunRequestManager<RequestKind>,
    server: Option<StunServer>,
    fallback_server: Option<StunServer>,
    active_role: ServerRole,
    server_addr: Option<SocketAddr>,
    keepalive: Option<TransactionId>,
    resolve_token: Option<u64>,
    pending_resolve: Option<ResolveRequest>,
    next_token: u64,
    candidates: Vec<Candidate>,
    connections: HashMap<SocketAddr, Connection>,
    events: VecDeque<PortEvent>,
    last_error: Option<i32>,
    recv_buf: Vec<u8>,
    released: bool,
}

impl Port {
    /// Bind a socket from `factory` and build a port around it.
    ///
    /// # Errors
    /// [`PortError::InvalidConfig`] for a contradictory configuration,
    /// [`PortError::Bind`] when no socket could be bound
    ///
    /// # Examples
    /// ```no_run
    /// use reflex_discovery::{Network, Port, PortConfig};
    /// use reflex_transport::TokioSocketFactory;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let network = Network::new("lo", "127.0.0.1".parse()?);
    /// let config = PortConfig::new(network).with_server("stun.example.org:3478".parse::<reflex_discovery::StunServer>()?);
    /// let port = Port::create(config, &TokioSocketFactory)?;
    /// println!("Bound to {}", port.local_address());
    /// # Ok(())
    /// # }
    /// ```
    pub fn create(config: PortConfig, factory: &dyn PacketSocketFactory) -> Result<Self> {
        config.validate()?;
        let ip = config.network.ip();
        let socket = factory
            .create_udp_socket(ip, config.min_port, config.max_port)
            .map_err(|e| PortError::Bind {
                ip,
                min_port: config.min_port,
                max_port: config.max_port,
                message: e.to_string(),
            })?;
        Self::from_socket(config, socket)
    }

    /// Build a port around an already-bound socket
    ///
    /// # Errors
    /// [`PortError::InvalidConfig`] for a contradictory configuration, or
    /// the socket's error if its local address cannot be read
    pub fn from_socket(config: PortConfig, mut socket: Box<dyn AsyncSocket>) -> Result<Self> {
        config.validate()?;
        let local_addr = socket.local_addr()?;

        let (tx, rx) = event_channel();
        socket.subscribe(Some(tx));

        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => IceCredentials {
                username: username.clone(),
                password: password.clone(),
            },
            _ => IceCredentials::random(),
        };
        let local_candidate = Candidate::local(local_addr, &config.network, &credentials);

        tracing::info!(
            "Port bound on {} ({}, policy {})",
            local_addr,
            config.network.name(),
            config.policy
        );

        Ok(Self {
            requests: StunRequestManager::new(config.retransmit),
            server: config.server.clone(),
            fallback_server: config.fallback_server.clone(),
            config,
            credentials,
            socket,
            socket_events: rx,
            stashed_events: VecDeque::new(),
            local_addr,
            local_candidate,
            local_emitted: false,
            state: PortState::Initializing,
            discovery: DiscoveryStatus::NotStarted,
            active_role: ServerRole::Primary,
            server_addr: None,
            keepalive: None,
            resolve_token: None,
            pending_resolve: None,
            next_token: 0,
            candidates: Vec::new(),
            connections: HashMap::new(),
            events: VecDeque::new(),
            last_error: None,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            released: false,
        })
    }

    /// Start gathering candidates.
    ///
    /// Only the first call does anything; later calls return `Ok` without
    /// sending again, whatever the outcome of the first.
    ///
    /// # Errors
    /// [`PortError::SocketClosed`] once the port is closed
    pub fn prepare_address(&mut self, now: Instant) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(PortError::SocketClosed);
        }
        if self.discovery != DiscoveryStatus::NotStarted {
            return Ok(());
        }

        if self.config.policy == DiscoveryPolicy::LocalOnly || self.server.is_none() {
            self.discovery = DiscoveryStatus::NotApplicable;
            self.state = PortState::Ready;
            self.emit_local();
            self.events.push_back(PortEvent::GatheringComplete);
            return Ok(());
        }

        if self.config.policy == DiscoveryPolicy::PreferStun {
            self.emit_local();
        }
        self.discovery = DiscoveryStatus::InProgress;
        self.start_server(ServerRole::Primary, now);
        Ok(())
    }

    fn start_server(&mut self, role: ServerRole, now: Instant) {
        self.active_role = role;
        let server = match role {
            ServerRole::Primary => self.server.clone(),
            ServerRole::Fallback => self.fallback_server.clone(),
        };

        match server {
            None => self.server_failed(DiscoveryFailure::Resolution, now),
            Some(StunServer::Addr(addr)) => {
                if AddressFamily::of(addr.ip()) == self.family() {
                    self.send_binding(addr, role, now);
                } else {
                    tracing::warn!("STUN server {} does not match the port's address family", addr);
                    self.server_failed(DiscoveryFailure::Resolution, now);
                }
            }
            Some(StunServer::Host { host, port }) => {
                let token = self.next_token;
                self.next_token += 1;
                tracing::debug!("Resolving STUN server {}:{}", host, port);
                self.resolve_token = Some(token);
                self.pending_resolve = Some(ResolveRequest {
                    token,
                    host,
                    port,
                    family: self.family(),
                });
                // A fallback lookup happens on a port that is already usable
                if self.state == PortState::Initializing {
                    self.state = PortState::ResolvingServer;
                }
            }
        }
    }

    /// Feed back the result of a [`ResolveRequest`].
    ///
    /// Results for a superseded token, or arriving after the port closed,
    /// are ignored.
    pub fn on_resolve_result(
        &mut self,
        token: u64,
        result: io::Result<Vec<SocketAddr>>,
        now: Instant,
    ) {
        if self.resolve_token != Some(token) {
            tracing::debug!("Ignoring stale resolution result (token {})", token);
            return;
        }
        self.resolve_token = None;
        self.pending_resolve = None;

        match result {
            Ok(addrs) => match pick_address(&addrs, self.family()) {
                Some(addr) => {
                    tracing::debug!("STUN server resolved to {}", addr);
                    self.send_binding(addr, self.active_role, now);
                }
                None => {
                    tracing::warn!("STUN server has no {} address", self.family());
                    self.server_failed(DiscoveryFailure::Resolution, now);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to resolve STUN server: {}", e);
                self.server_failed(DiscoveryFailure::Resolution, now);
            }
        }
    }

    fn send_binding(&mut self, addr: SocketAddr, role: ServerRole, now: Instant) {
        self.server_addr = Some(addr);
        self.state = PortState::Ready;
        self.with_requests(now, |requests, io| {
            requests.send(
                addr,
                StunMessage::binding_request(),
                RequestKind::Discovery(role),
                now,
                io,
            );
        });
    }

    fn server_failed(&mut self, failure: DiscoveryFailure, now: Instant) {
        if self.active_role == ServerRole::Primary && self.fallback_server.is_some() {
            tracing::info!("Primary STUN server failed ({}), trying fallback", failure);
            self.start_server(ServerRole::Fallback, now);
        } else {
            self.conclude_failure(failure);
        }
    }

    fn conclude_failure(&mut self, failure: DiscoveryFailure) {
        tracing::warn!("Server-reflexive discovery failed on {}: {}", self.local_addr, failure);
        self.discovery = DiscoveryStatus::Failed(failure);
        if self.state != PortState::Closed {
            self.state = PortState::Ready;
        }
        self.emit_local();
        self.events.push_back(PortEvent::DiscoveryFailed(failure));
        self.events.push_back(PortEvent::GatheringComplete);
    }

    fn conclude_success(&mut self, mapped: SocketAddr, now: Instant) {
        tracing::info!("Discovered server-reflexive address {} for {}", mapped, self.local_addr);
        self.discovery = DiscoveryStatus::Succeeded(mapped);
        self.emit_local();

        if mapped == self.local_addr {
            tracing::debug!("Mapped address equals local address, no NAT in the path");
        } else {
            let candidate = Candidate::server_reflexive(
                mapped,
                self.local_addr,
                &self.config.network,
                &self.credentials,
            );
            self.candidates.push(candidate.clone());
            self.events.push_back(PortEvent::CandidateReady(candidate));
        }
        self.events.push_back(PortEvent::GatheringComplete);
        self.schedule_keepalive(now);
    }

    fn emit_local(&mut self) {
        if self.local_emitted {
            return;
        }
        self.local_emitted = true;
        self.candidates.push(self.local_candidate.clone());
        self.events
            .push_back(PortEvent::CandidateReady(self.local_candidate.clone()));
    }

    fn schedule_keepalive(&mut self, now: Instant) {
        let (Some(interval), Some(addr)) = (self.config.keepalive_interval, self.server_addr) else {
            return;
        };
        if self.keepalive.is_some() || self.state == PortState::Closed {
            return;
        }
        let id = self.requests.send_delayed(
            addr,
            StunMessage::binding_request(),
            RequestKind::Keepalive,
            interval,
            now,
        );
        self.keepalive = Some(id);
    }

    /// Run `f` against the transaction manager, then act on the outcomes
    /// it reported
    fn with_requests<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut StunRequestManager<RequestKind>, &mut PortIo<'_>) -> R,
    ) -> R {
        let mut io = PortIo {
            socket: &mut *self.socket,
            last_error: &mut self.last_error,
            outcomes: Vec::new(),
        };
        let result = f(&mut self.requests, &mut io);
        let outcomes = io.outcomes;
        for (id, kind, outcome) in outcomes {
            self.handle_outcome(id, kind, outcome, now);
        }
        result
    }

    fn handle_outcome(
        &mut self,
        id: TransactionId,
        kind: RequestKind,
        outcome: RequestOutcome,
        now: Instant,
    ) {
        match kind {
            RequestKind::Discovery(role) => {
                if self.discovery != DiscoveryStatus::InProgress || role != self.active_role {
                    tracing::debug!("Ignoring outcome of superseded request {}", id);
                    return;
                }
                match outcome {
                    RequestOutcome::Success(msg) => match msg.mapped_address() {
                        Some(mapped) => self.conclude_success(mapped, now),
                        None => self.conclude_failure(DiscoveryFailure::MissingMappedAddress),
                    },
                    RequestOutcome::ErrorResponse(msg) => {
                        let code = msg.error_code().map_or(0, |(code, _)| code);
                        self.conclude_failure(DiscoveryFailure::ServerError(code));
                    }
                    RequestOutcome::Timeout => self.server_failed(DiscoveryFailure::Timeout, now),
                }
            }
            RequestKind::Keepalive => {
                self.keepalive = None;
                match outcome {
                    RequestOutcome::Success(msg) => {
                        let mapped = msg.mapped_address();
                        if let DiscoveryStatus::Succeeded(known) = self.discovery {
                            if mapped.is_some_and(|addr| addr != known) {
                                tracing::warn!(
                                    "NAT mapping for {} changed from {} to {:?}",
                                    self.local_addr,
                                    known,
                                    mapped
                                );
                            }
                        }
                    }
                    RequestOutcome::ErrorResponse(_) | RequestOutcome::Timeout => {
                        tracing::debug!("Keepalive {} to STUN server got no answer", id);
                    }
                }
                self.schedule_keepalive(now);
            }
        }
    }

    /// Handle one datagram received on the port's socket.
    ///
    /// Responses to pending STUN transactions are consumed; anything else
    /// goes to the connection for `remote`, or is dropped when there is
    /// none.
    pub fn on_read_packet(&mut self, data: &[u8], remote: SocketAddr, now: Instant) {
        if self.state == PortState::Closed {
            return;
        }
        if self.with_requests(now, |requests, io| requests.check_response(data, io)) {
            return;
        }

        match self.connections.get_mut(&remote) {
            Some(connection) => {
                connection.record_receive(data.len(), now);
                self.events.push_back(PortEvent::Packet {
                    remote,
                    data: data.to_vec(),
                });
            }
            None => {
                tracing::trace!("Dropping {} byte datagram from unknown {}", data.len(), remote);
            }
        }
    }

    /// Act on queued socket readiness events, reading every datagram
    /// available after a read signal
    pub fn process_socket_events(&mut self, now: Instant) {
        while let Some(event) = self
            .stashed_events
            .pop_front()
            .or_else(|| self.socket_events.try_recv().ok())
        {
            match event {
                SocketEvent::Read => self.drain_socket(now),
                SocketEvent::Close(code) => self.on_socket_closed(code),
                SocketEvent::Connect | SocketEvent::Write => {
                    tracing::trace!("Socket event {:?} on {}", event, self.local_addr);
                }
            }
        }
    }

    fn drain_socket(&mut self, now: Instant) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        while self.state != PortState::Closed {
            match self.socket.recv_from(&mut buf) {
                Ok((len, remote)) => self.on_read_packet(&buf[..len], remote, now),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("Receive on {} failed: {}", self.local_addr, e);
                    self.last_error = Some(error_code(&e));
                    break;
                }
            }
        }
        self.recv_buf = buf;
    }

    fn on_socket_closed(&mut self, code: i32) {
        if self.state == PortState::Closed {
            return;
        }
        tracing::warn!("Socket on {} closed with error {}", self.local_addr, code);
        if code != 0 {
            self.last_error = Some(code);
        }
        self.state = PortState::Closed;
        self.requests.clear();
        self.keepalive = None;
        self.resolve_token = None;
        self.pending_resolve = None;
        if self.discovery == DiscoveryStatus::InProgress {
            self.conclude_failure(DiscoveryFailure::SocketError(code));
        }
        self.events.push_back(PortEvent::SocketClosed(code));
    }

    /// Drive socket readiness from an async context. Resolves when a socket
    /// event is queued for [`Port::process_socket_events`].
    pub fn poll_socket(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.state == PortState::Closed {
            return Poll::Pending;
        }
        if !self.stashed_events.is_empty() {
            return Poll::Ready(());
        }
        let _ = self.socket.poll_readiness(cx);
        match self.socket_events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                self.stashed_events.push_back(event);
                Poll::Ready(())
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == PortState::Closed {
            return;
        }
        self.with_requests(now, |requests, io| requests.handle_timeout(now, io));
    }

    /// Next time [`Port::handle_timeout`] must be called
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.requests.poll_timeout()
    }

    /// Next event for the owner
    pub fn poll_event(&mut self) -> Option<PortEvent> {
        self.events.pop_front()
    }

    /// Hostname lookup to perform, at most once per request
    pub fn poll_resolve(&mut self) -> Option<ResolveRequest> {
        self.pending_resolve.take()
    }

    /// Create a connection to `remote`, or return the existing one.
    ///
    /// # Errors
    /// [`PortError::NotReady`] before the port is ready,
    /// [`PortError::UnsupportedProtocol`] for non-UDP candidates,
    /// [`PortError::FamilyMismatch`] when the port cannot reach `remote`
    pub fn create_connection(&mut self, remote: &Candidate, now: Instant) -> Result<&Connection> {
        if self.state != PortState::Ready {
            return Err(PortError::NotReady(self.state));
        }
        if remote.protocol() != UDP_PROTOCOL {
            return Err(PortError::UnsupportedProtocol(remote.protocol().to_string()));
        }
        if remote.family() != self.family() {
            return Err(PortError::FamilyMismatch {
                local: self.family(),
                remote: remote.family(),
            });
        }

        let address = remote.address();
        let connection = self.connections.entry(address).or_insert_with(|| {
            tracing::debug!("Created connection {} -> {}", self.local_addr, address);
            Connection::new(self.local_candidate.clone(), remote.clone(), now)
        });
        Ok(connection)
    }

    /// Connection to `remote`, if one exists
    #[must_use]
    pub fn connection(&self, remote: SocketAddr) -> Option<&Connection> {
        self.connections.get(&remote)
    }

    /// Every live connection
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Remove the connection to `remote`
    pub fn destroy_connection(&mut self, remote: SocketAddr) -> bool {
        self.connections.remove(&remote).is_some()
    }

    /// Send `data` on the connection to `remote`
    ///
    /// # Errors
    /// [`PortError::WouldBlock`] when the socket buffer is full (retry after
    /// the next write event), [`PortError::UnknownConnection`] without a
    /// connection, or the socket error
    pub fn send(&mut self, remote: SocketAddr, data: &[u8], now: Instant) -> Result<usize> {
        if self.state == PortState::Closed {
            return Err(PortError::SocketClosed);
        }
        let connection = self
            .connections
            .get_mut(&remote)
            .ok_or(PortError::UnknownConnection(remote))?;

        match self.socket.send_to(data, remote) {
            Ok(sent) => {
                connection.record_send(sent, now);
                Ok(sent)
            }
            Err(e) => {
                connection.record_send_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    self.last_error = Some(error_code(&e));
                }
                Err(e.into())
            }
        }
    }

    /// Set a socket option
    ///
    /// # Errors
    /// The socket's error; it is also kept for [`Port::last_error`]
    pub fn set_option(&mut self, opt: SocketOption, value: i32) -> Result<()> {
        self.socket.set_option(opt, value).map_err(|e| {
            self.last_error = Some(error_code(&e));
            PortError::from(e)
        })
    }

    /// Read a socket option
    ///
    /// # Errors
    /// The socket's error
    pub fn get_option(&self, opt: SocketOption) -> Result<i32> {
        Ok(self.socket.get_option(opt)?)
    }

    /// OS error code of the most recent failure, cleared by this call.
    ///
    /// A send that would block is not a failure and is never recorded.
    pub fn last_error(&mut self) -> Option<i32> {
        self.last_error.take()
    }

    /// Address the socket is bound to
    #[must_use]
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// Primary STUN server
    #[must_use]
    pub fn server_address(&self) -> Option<&StunServer> {
        self.server.as_ref()
    }

    /// Replace the primary STUN server.
    ///
    /// Only a port that has not started discovery uses the new server.
    /// Once `prepare_address` has run, the server already contacted stays
    /// in use for keepalives and [`Port::resolved_server_address`].
    pub fn set_server_address(&mut self, server: Option<StunServer>) {
        self.server = server;
    }

    /// Fallback STUN server
    #[must_use]
    pub fn fallback_server_address(&self) -> Option<&StunServer> {
        self.fallback_server.as_ref()
    }

    /// Replace the fallback STUN server
    pub fn set_fallback_server_address(&mut self, server: Option<StunServer>) {
        self.fallback_server = server;
    }

    /// Address of the STUN server currently in use, once known
    #[must_use]
    pub fn resolved_server_address(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Candidates emitted so far, in emission order
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// ICE credentials attached to this port's candidates
    #[must_use]
    pub fn credentials(&self) -> &IceCredentials {
        &self.credentials
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Discovery progress
    #[must_use]
    pub fn discovery_status(&self) -> DiscoveryStatus {
        self.discovery
    }

    /// Configuration the port was built with
    #[must_use]
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    fn family(&self) -> AddressFamily {
        AddressFamily::of(self.local_addr.ip())
    }

    /// Cancel every transaction, drop every connection and close the
    /// socket. Later calls do nothing.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        tracing::debug!("Closing port on {}", self.local_addr);
        self.requests.clear();
        self.connections.clear();
        self.keepalive = None;
        self.resolve_token = None;
        self.pending_resolve = None;
        self.socket.subscribe(None);
        if let Err(e) = self.socket.close() {
            tracing::debug!("Closing socket on {} failed: {}", self.local_addr, e);
        }
        self.state = PortState::Closed;
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state)
            .field("discovery", &self.discovery)
            .field("candidates", &self.candidates.len())
            .field("connections", &self.connections.len())
            .field("pending_requests", &self.requests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateType, Network};
    use crate::stun::message::peek_transaction_id;
    use crate::stun::RetransmitConfig;
    use reflex_transport::memory::{MemorySocket, MemorySocketFactory, MemorySocketHandle, SendFailure};
    use std::time::Duration;

    const LOCAL: &str = "192.168.1.10:5000";
    const SERVER: &str = "198.51.100.1:3478";
    const FALLBACK: &str = "198.51.100.2:3478";
    const MAPPED: &str = "203.0.113.5:54321";
    const PEER: &str = "192.168.1.20:6000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn base_config() -> PortConfig {
        PortConfig::new(Network::new("eth0", "192.168.1.10".parse().unwrap()))
            .with_credentials("ufrag", "password")
    }

    fn stun_config(policy: DiscoveryPolicy) -> PortConfig {
        base_config().with_policy(policy).with_server(addr(SERVER))
    }

    fn port_with(config: PortConfig) -> (Port, MemorySocketHandle) {
        let (socket, handle) = MemorySocket::new(addr(LOCAL));
        (Port::from_socket(config, Box::new(socket)).unwrap(), handle)
    }

    fn drain_events(port: &mut Port) -> Vec<PortEvent> {
        std::iter::from_fn(|| port.poll_event()).collect()
    }

    fn candidate_types(events: &[PortEvent]) -> Vec<CandidateType> {
        events
            .iter()
            .filter_map(|event| match event {
                PortEvent::CandidateReady(c) => Some(c.candidate_type()),
                _ => None,
            })
            .collect()
    }

    /// Answer the most recent request sent to `server` with `mapped`
    fn respond(port: &mut Port, handle: &MemorySocketHandle, server: &str, mapped: &str, now: Instant) -> Vec<u8> {
        let sent = handle.take_sent();
        let (request, _) = sent
            .iter()
            .rev()
            .find(|(_, dest)| *dest == addr(server))
            .expect("no request sent to server");
        let id = peek_transaction_id(request).unwrap();
        let response = StunMessage::binding_response(id, addr(mapped)).encode();
        handle.inject(&response, addr(server));
        port.process_socket_events(now);
        response
    }

    /// Step the fake clock through every timer until `until`
    fn run_timers(port: &mut Port, until: Instant) {
        while let Some(deadline) = port.poll_timeout() {
            if deadline > until {
                break;
            }
            port.handle_timeout(deadline);
        }
    }

    #[test]
    fn test_local_only_emits_local_candidate() {
        let (mut port, handle) = port_with(base_config().with_policy(DiscoveryPolicy::LocalOnly));
        assert_eq!(port.state(), PortState::Initializing);

        port.prepare_address(Instant::now()).unwrap();
        let events = drain_events(&mut port);

        assert_eq!(candidate_types(&events), vec![CandidateType::Local]);
        assert_eq!(events.last(), Some(&PortEvent::GatheringComplete));
        assert_eq!(port.state(), PortState::Ready);
        assert_eq!(port.discovery_status(), DiscoveryStatus::NotApplicable);
        assert!(handle.sent().is_empty());
        assert_eq!(port.poll_timeout(), None);
    }

    #[test]
    fn test_prefer_stun_without_server_is_local_only() {
        let (mut port, handle) = port_with(base_config());
        port.prepare_address(Instant::now()).unwrap();
        assert_eq!(port.candidates().len(), 1);
        assert_eq!(port.discovery_status(), DiscoveryStatus::NotApplicable);
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_stun_success_emits_reflexive_candidate() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();

        let early = drain_events(&mut port);
        assert_eq!(candidate_types(&early), vec![CandidateType::Local]);
        assert_eq!(port.discovery_status(), DiscoveryStatus::InProgress);
        assert_eq!(port.state(), PortState::Ready);

        let response = respond(&mut port, &handle, SERVER, MAPPED, now);
        let events = drain_events(&mut port);
        assert_eq!(candidate_types(&events), vec![CandidateType::ServerReflexive]);
        assert_eq!(events.last(), Some(&PortEvent::GatheringComplete));

        let srflx = &port.candidates()[1];
        assert_eq!(srflx.address(), addr(MAPPED));
        assert_eq!(srflx.related_address(), Some(addr(LOCAL)));
        assert_eq!(srflx.username(), "ufrag");
        assert_eq!(port.discovery_status(), DiscoveryStatus::Succeeded(addr(MAPPED)));
        assert_eq!(port.poll_timeout(), None);

        // Same transaction answered again
        handle.inject(&response, addr(SERVER));
        port.process_socket_events(now);
        assert!(drain_events(&mut port).is_empty());
        assert_eq!(port.candidates().len(), 2);
        assert_eq!(port.connections().count(), 0);
    }

    #[test]
    fn test_timeout_keeps_local_candidate() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let start = Instant::now();
        port.prepare_address(start).unwrap();
        drain_events(&mut port);

        run_timers(&mut port, start + Duration::from_millis(9499));
        assert_eq!(handle.sent().len(), 9);
        assert!(drain_events(&mut port).is_empty());

        run_timers(&mut port, start + Duration::from_millis(9500));
        let events = drain_events(&mut port);
        assert_eq!(
            events,
            vec![
                PortEvent::DiscoveryFailed(DiscoveryFailure::Timeout),
                PortEvent::GatheringComplete
            ]
        );
        assert_eq!(port.candidates().len(), 1);
        assert_eq!(port.candidates()[0].candidate_type(), CandidateType::Local);
        assert_eq!(port.discovery_status(), DiscoveryStatus::Failed(DiscoveryFailure::Timeout));
        assert_eq!(handle.sent().len(), 9);
    }

    #[test]
    fn test_fallback_tried_after_primary_timeout() {
        let config = stun_config(DiscoveryPolicy::PreferStun)
            .with_fallback_server(addr(FALLBACK))
            .with_retransmit(RetransmitConfig::default().with_max_retransmissions(1));
        let (mut port, handle) = port_with(config);
        let start = Instant::now();
        port.prepare_address(start).unwrap();

        // Primary only until it times out
        run_timers(&mut port, start + Duration::from_millis(299));
        assert!(handle.sent().iter().all(|(_, dest)| *dest == addr(SERVER)));

        run_timers(&mut port, start + Duration::from_millis(300));
        let sent = handle.sent();
        assert_eq!(sent.last().unwrap().1, addr(FALLBACK));
        assert_eq!(sent.iter().filter(|(_, dest)| *dest == addr(FALLBACK)).count(), 1);

        drain_events(&mut port);
        respond(&mut port, &handle, FALLBACK, MAPPED, start + Duration::from_millis(350));
        assert_eq!(port.discovery_status(), DiscoveryStatus::Succeeded(addr(MAPPED)));
        assert_eq!(port.resolved_server_address(), Some(addr(FALLBACK)));
    }

    #[test]
    fn test_hostname_fallback_keeps_port_ready() {
        let config = stun_config(DiscoveryPolicy::PreferStun)
            .with_fallback_server(StunServer::Host {
                host: "stun2.example.org".to_string(),
                port: 3478,
            })
            .with_retransmit(RetransmitConfig::default().with_max_retransmissions(0));
        let (mut port, handle) = port_with(config);
        let start = Instant::now();
        port.prepare_address(start).unwrap();
        assert_eq!(port.state(), PortState::Ready);

        run_timers(&mut port, start + Duration::from_secs(1));
        let request = port.poll_resolve().expect("fallback lookup not requested");
        assert_eq!(request.host, "stun2.example.org");
        assert_eq!(port.state(), PortState::Ready);
        assert_eq!(port.discovery_status(), DiscoveryStatus::InProgress);

        let remote = Candidate::remote(addr(PEER), CandidateType::Local);
        assert!(port.create_connection(&remote, start).is_ok());

        let later = start + Duration::from_secs(1);
        port.on_resolve_result(request.token, Ok(vec![addr(FALLBACK)]), later);
        assert_eq!(port.state(), PortState::Ready);
        respond(&mut port, &handle, FALLBACK, MAPPED, later);
        assert_eq!(port.discovery_status(), DiscoveryStatus::Succeeded(addr(MAPPED)));
        assert_eq!(port.candidates().len(), 2);
    }

    #[test]
    fn test_require_stun_defers_local_until_success() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::RequireStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        assert!(drain_events(&mut port).is_empty());
        assert!(port.candidates().is_empty());

        respond(&mut port, &handle, SERVER, MAPPED, now);
        let events = drain_events(&mut port);
        assert_eq!(
            candidate_types(&events),
            vec![CandidateType::Local, CandidateType::ServerReflexive]
        );
        assert_eq!(events.last(), Some(&PortEvent::GatheringComplete));
    }

    #[test]
    fn test_require_stun_failure_is_explicit() {
        let config = stun_config(DiscoveryPolicy::RequireStun)
            .with_retransmit(RetransmitConfig::default().with_max_retransmissions(0));
        let (mut port, _handle) = port_with(config);
        let start = Instant::now();
        port.prepare_address(start).unwrap();
        run_timers(&mut port, start + Duration::from_secs(1));

        let events = drain_events(&mut port);
        assert_eq!(candidate_types(&events), vec![CandidateType::Local]);
        assert_eq!(events[1], PortEvent::DiscoveryFailed(DiscoveryFailure::Timeout));
        assert_eq!(events[2], PortEvent::GatheringComplete);
    }

    #[test]
    fn test_hostname_resolution_success() {
        let config = base_config().with_server(StunServer::Host {
            host: "stun.example.org".to_string(),
            port: 3478,
        });
        let (mut port, handle) = port_with(config);
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        assert_eq!(port.state(), PortState::ResolvingServer);

        let request = port.poll_resolve().unwrap();
        assert_eq!(request.host, "stun.example.org");
        assert_eq!(request.port, 3478);
        assert_eq!(request.family, AddressFamily::V4);
        assert!(port.poll_resolve().is_none());

        let answers = vec![addr("[2001:db8::1]:3478"), addr(SERVER)];
        port.on_resolve_result(request.token, Ok(answers), now);
        assert_eq!(port.state(), PortState::Ready);
        assert_eq!(port.resolved_server_address(), Some(addr(SERVER)));
        assert_eq!(handle.sent().len(), 1);
    }

    #[test]
    fn test_resolution_failure_degrades_to_local() {
        let config = base_config().with_server(StunServer::Host {
            host: "stun.invalid".to_string(),
            port: 3478,
        });
        let (mut port, handle) = port_with(config);
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        let request = port.poll_resolve().unwrap();

        port.on_resolve_result(
            request.token,
            Err(io::Error::new(io::ErrorKind::NotFound, "no such host")),
            now,
        );

        let events = drain_events(&mut port);
        assert_eq!(candidate_types(&events), vec![CandidateType::Local]);
        assert!(events.contains(&PortEvent::DiscoveryFailed(DiscoveryFailure::Resolution)));
        assert_eq!(port.candidates().len(), 1);
        assert_eq!(port.state(), PortState::Ready);
        assert_eq!(port.poll_timeout(), None);
        assert!(handle.sent().is_empty());
    }

    #[test]
    fn test_resolution_without_matching_family_fails() {
        let config = base_config().with_server(StunServer::Host {
            host: "v6only.example.org".to_string(),
            port: 3478,
        });
        let (mut port, _handle) = port_with(config);
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        let request = port.poll_resolve().unwrap();
        port.on_resolve_result(request.token, Ok(vec![addr("[2001:db8::1]:3478")]), now);
        assert_eq!(
            port.discovery_status(),
            DiscoveryStatus::Failed(DiscoveryFailure::Resolution)
        );
    }

    #[test]
    fn test_stale_resolution_ignored() {
        let config = base_config().with_server(StunServer::Host {
            host: "stun.example.org".to_string(),
            port: 3478,
        });
        let (mut port, handle) = port_with(config);
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        let request = port.poll_resolve().unwrap();

        port.on_resolve_result(request.token + 1, Ok(vec![addr(SERVER)]), now);
        assert_eq!(port.state(), PortState::ResolvingServer);
        assert!(handle.sent().is_empty());

        port.close();
        port.on_resolve_result(request.token, Ok(vec![addr(SERVER)]), now);
        assert!(handle.sent().is_empty());
        assert_eq!(port.state(), PortState::Closed);
    }

    #[test]
    fn test_mapped_equal_to_local_adds_no_candidate() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        respond(&mut port, &handle, SERVER, LOCAL, now);

        assert_eq!(port.candidates().len(), 1);
        assert_eq!(port.discovery_status(), DiscoveryStatus::Succeeded(addr(LOCAL)));
    }

    #[test]
    fn test_error_response_fails_discovery() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();

        let (request, _) = handle.take_sent().remove(0);
        let id = peek_transaction_id(&request).unwrap();
        handle.inject(&StunMessage::binding_error(id, 500, "Server Error").encode(), addr(SERVER));
        port.process_socket_events(now);

        assert_eq!(
            port.discovery_status(),
            DiscoveryStatus::Failed(DiscoveryFailure::ServerError(500))
        );
        assert_eq!(port.candidates().len(), 1);
    }

    #[test]
    fn test_prepare_address_is_idempotent() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        port.prepare_address(now).unwrap();
        assert_eq!(handle.sent().len(), 1);

        respond(&mut port, &handle, SERVER, MAPPED, now);
        port.prepare_address(now).unwrap();
        assert!(handle.sent().is_empty());
        assert_eq!(port.candidates().len(), 2);
    }

    #[test]
    fn test_unsolicited_datagram_dropped() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        drain_events(&mut port);

        handle.inject(b"hello from nowhere", addr(PEER));
        let stranger = StunMessage::binding_response(TransactionId::random(), addr(MAPPED)).encode();
        handle.inject(&stranger, addr(SERVER));
        port.process_socket_events(now);

        assert!(drain_events(&mut port).is_empty());
        assert_eq!(port.connections().count(), 0);
        assert_eq!(port.last_error(), None);
        assert_eq!(port.discovery_status(), DiscoveryStatus::InProgress);
        assert_eq!(port.poll_timeout(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_create_connection_checks() {
        let (mut port, _handle) = port_with(base_config());
        let now = Instant::now();
        let remote = Candidate::remote(addr(PEER), CandidateType::Local);

        assert_eq!(
            port.create_connection(&remote, now).err(),
            Some(PortError::NotReady(PortState::Initializing))
        );

        port.prepare_address(now).unwrap();
        let tcp = remote.clone().with_protocol("tcp");
        assert_eq!(
            port.create_connection(&tcp, now).err(),
            Some(PortError::UnsupportedProtocol("tcp".to_string()))
        );

        let v6 = Candidate::remote(addr("[2001:db8::2]:6000"), CandidateType::Local);
        assert!(matches!(
            port.create_connection(&v6, now),
            Err(PortError::FamilyMismatch { .. })
        ));

        let created = port.create_connection(&remote, now).unwrap().created_at();
        let later = now + Duration::from_secs(1);
        assert_eq!(port.create_connection(&remote, later).unwrap().created_at(), created);
        assert_eq!(port.connections().count(), 1);
        assert_eq!(
            port.connection(addr(PEER)).unwrap().local_candidate().address(),
            addr(LOCAL)
        );
    }

    #[test]
    fn test_connection_traffic() {
        let (mut port, handle) = port_with(base_config());
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        drain_events(&mut port);
        let remote = Candidate::remote(addr(PEER), CandidateType::Local);
        port.create_connection(&remote, now).unwrap();

        assert_eq!(port.send(addr(PEER), b"ping", now).unwrap(), 4);
        assert_eq!(handle.take_sent(), vec![(b"ping".to_vec(), addr(PEER))]);

        handle.inject(b"pong", addr(PEER));
        port.process_socket_events(now);
        assert_eq!(
            port.poll_event(),
            Some(PortEvent::Packet {
                remote: addr(PEER),
                data: b"pong".to_vec()
            })
        );

        let stats = port.connection(addr(PEER)).unwrap().stats();
        assert_eq!((stats.packets_sent, stats.packets_received), (1, 1));

        assert!(port.destroy_connection(addr(PEER)));
        assert_eq!(
            port.send(addr(PEER), b"ping", now).err(),
            Some(PortError::UnknownConnection(addr(PEER)))
        );
    }

    #[test]
    fn test_send_would_block_is_transient() {
        let (mut port, handle) = port_with(base_config());
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        port.create_connection(&Candidate::remote(addr(PEER), CandidateType::Local), now)
            .unwrap();

        handle.fail_sends(Some(SendFailure::WouldBlock));
        let err = port.send(addr(PEER), b"data", now).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(port.last_error(), None);

        handle.fail_sends(Some(SendFailure::Os(101)));
        let err = port.send(addr(PEER), b"data", now).unwrap_err();
        assert_eq!(err.os_code(), Some(101));
        assert_eq!(port.last_error(), Some(101));
        assert_eq!(port.last_error(), None);
        assert_eq!(port.connection(addr(PEER)).unwrap().stats().send_errors, 2);
    }

    #[test]
    fn test_failed_stun_send_recorded() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        handle.fail_sends(Some(SendFailure::Os(113)));
        port.prepare_address(Instant::now()).unwrap();
        assert_eq!(port.last_error(), Some(113));
        assert_eq!(port.discovery_status(), DiscoveryStatus::InProgress);
    }

    #[test]
    fn test_blocked_stun_send_is_not_an_error() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        handle.fail_sends(Some(SendFailure::WouldBlock));
        port.prepare_address(now).unwrap();

        assert_eq!(port.last_error(), None);
        assert_eq!(port.poll_timeout(), Some(now + Duration::from_millis(100)));

        // The retransmission goes out once the socket drains
        handle.fail_sends(None);
        port.handle_timeout(now + Duration::from_millis(100));
        assert_eq!(handle.sent().len(), 1);
        assert_eq!(port.last_error(), None);
    }

    #[test]
    fn test_socket_options_pass_through() {
        let (mut port, handle) = port_with(base_config());
        port.set_option(SocketOption::RecvBufferSize, 1 << 20).unwrap();
        assert_eq!(handle.option(SocketOption::RecvBufferSize), Some(1 << 20));
        assert_eq!(port.get_option(SocketOption::RecvBufferSize).unwrap(), 1 << 20);

        assert!(port.set_option(SocketOption::Ttl, -1).is_err());
        assert_eq!(port.last_error(), Some(-1));
    }

    #[test]
    fn test_socket_close_event() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        let now = Instant::now();
        port.prepare_address(now).unwrap();
        drain_events(&mut port);

        handle.close_remote(104);
        port.process_socket_events(now);

        let events = drain_events(&mut port);
        assert!(events.contains(&PortEvent::DiscoveryFailed(DiscoveryFailure::SocketError(104))));
        assert_eq!(events.last(), Some(&PortEvent::SocketClosed(104)));
        assert_eq!(port.state(), PortState::Closed);
        assert_eq!(port.poll_timeout(), None);
        assert_eq!(port.last_error(), Some(104));
        assert_eq!(port.candidates().len(), 1);
    }

    #[test]
    fn test_keepalive_after_success() {
        let config = stun_config(DiscoveryPolicy::PreferStun).with_keepalive(Duration::from_secs(10));
        let (mut port, handle) = port_with(config);
        let start = Instant::now();
        port.prepare_address(start).unwrap();
        respond(&mut port, &handle, SERVER, MAPPED, start);

        assert_eq!(port.poll_timeout(), Some(start + Duration::from_secs(10)));
        port.handle_timeout(start + Duration::from_secs(10));
        assert_eq!(handle.sent().len(), 1);

        // Keepalive times out; a new one is scheduled, candidates stay
        run_timers(&mut port, start + Duration::from_secs(20));
        assert_eq!(port.candidates().len(), 2);
        assert!(port.poll_timeout().is_some());
        assert_eq!(port.discovery_status(), DiscoveryStatus::Succeeded(addr(MAPPED)));
    }

    #[test]
    fn test_server_change_after_discovery_keeps_contacted_server() {
        let config = stun_config(DiscoveryPolicy::PreferStun).with_keepalive(Duration::from_secs(10));
        let (mut port, handle) = port_with(config);
        let start = Instant::now();
        port.prepare_address(start).unwrap();
        respond(&mut port, &handle, SERVER, MAPPED, start);

        port.set_server_address(Some(StunServer::Addr(addr(FALLBACK))));
        assert_eq!(port.server_address(), Some(&StunServer::Addr(addr(FALLBACK))));
        assert_eq!(port.resolved_server_address(), Some(addr(SERVER)));

        port.handle_timeout(start + Duration::from_secs(10));
        assert_eq!(handle.sent().last().map(|(_, dest)| *dest), Some(addr(SERVER)));
    }

    #[test]
    fn test_drop_releases_socket() {
        let (mut port, handle) = port_with(stun_config(DiscoveryPolicy::PreferStun));
        port.prepare_address(Instant::now()).unwrap();
        assert!(handle.is_subscribed());

        drop(port);
        assert!(handle.is_dropped());
        assert!(!handle.is_subscribed());
    }

    #[test]
    fn test_close_rejects_operations() {
        let (mut port, handle) = port_with(base_config());
        port.close();
        assert!(handle.is_closed());
        assert_eq!(port.prepare_address(Instant::now()), Err(PortError::SocketClosed));
        assert_eq!(
            port.send(addr(PEER), b"x", Instant::now()),
            Err(PortError::SocketClosed)
        );
    }

    #[test]
    fn test_create_binds_through_factory() {
        let factory = MemorySocketFactory::new();
        let port = Port::create(base_config().with_port_range(7000, 7010), &factory).unwrap();
        assert_eq!(port.local_address(), addr("192.168.1.10:7000"));
        assert_eq!(factory.handles().len(), 1);
    }

    #[test]
    fn test_create_fails_closed_on_bind_error() {
        let factory = MemorySocketFactory::new();
        factory.fail_with(Some(io::ErrorKind::AddrInUse));
        let err = Port::create(base_config(), &factory).unwrap_err();
        assert!(matches!(err, PortError::Bind { .. }));
    }

    #[test]
    fn test_random_credentials_when_unset() {
        let config = PortConfig::new(Network::new("eth0", "192.168.1.10".parse().unwrap()));
        let (port, _handle) = port_with(config);
        assert_eq!(port.credentials().username.len(), 16);
        assert_eq!(port.credentials().password.len(), 24);
    }
}
