//! Runs a [`Port`] on a Tokio task.
//!
//! The task owns the port and reacts to socket readiness, timer deadlines,
//! hostname lookups and commands from its [`PortHandle`]. Dropping the
//! handle stops the task and closes the port.

use crate::candidate::Candidate;
use crate::connection::Connection;
use crate::error::{PortError, Result};
use crate::port::{DiscoveryStatus, Port, PortEvent, ResolveRequest};
use crate::resolver::{AsyncResolver, ResolveFuture};
use reflex_transport::SocketOption;
use std::future::{pending, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Queued commands before callers wait
const COMMAND_CAPACITY: usize = 64;

/// Driver settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Give up on a STUN server hostname after this long
    pub resolve_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    PrepareAddress(Reply<Result<()>>),
    CreateConnection(Box<Candidate>, Reply<Result<Connection>>),
    DestroyConnection(SocketAddr, Reply<bool>),
    Connection(SocketAddr, Reply<Option<Connection>>),
    Send(SocketAddr, Vec<u8>, Reply<Result<usize>>),
    SetOption(SocketOption, i32, Reply<Result<()>>),
    GetOption(SocketOption, Reply<Result<i32>>),
    LastError(Reply<Option<i32>>),
    Candidates(Reply<Vec<Candidate>>),
    DiscoveryStatus(Reply<DiscoveryStatus>),
    Close(Reply<()>),
}

struct PendingResolve {
    token: u64,
    future: ResolveFuture,
}

enum Step {
    Command(Option<Command>),
    Socket,
    Timer,
    Resolved(u64, io::Result<Vec<SocketAddr>>),
}

/// Start driving `port` on the current Tokio runtime
///
/// # Panics
/// When called outside a Tokio runtime
pub fn spawn_port(
    port: Port,
    resolver: Arc<dyn AsyncResolver>,
    config: DriverConfig,
) -> PortHandle {
    let local_addr = port.local_address();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(run(port, resolver, config, command_rx, event_tx));

    PortHandle {
        commands: command_tx,
        events: event_rx,
        local_addr,
        task,
    }
}

async fn run(
    mut port: Port,
    resolver: Arc<dyn AsyncResolver>,
    config: DriverConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<PortEvent>,
) {
    tracing::debug!("Port driver started on {}", port.local_address());
    let mut resolving: Option<PendingResolve> = None;

    loop {
        let deadline = port.poll_timeout().map(Instant::from_std);
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            () = poll_fn(|cx| port.poll_socket(cx)) => Step::Socket,
            () = wait_until(deadline) => Step::Timer,
            (token, result) = next_resolution(&mut resolving) => Step::Resolved(token, result),
        };

        let now = Instant::now().into_std();
        match step {
            Step::Command(None) => break,
            Step::Command(Some(command)) => {
                if let ControlFlow::Break(reply) = handle_command(&mut port, command, now) {
                    forward_events(&mut port, &events);
                    let _ = reply.send(());
                    break;
                }
            }
            Step::Socket | Step::Timer => {}
            Step::Resolved(token, result) => {
                resolving = None;
                port.on_resolve_result(token, result, now);
            }
        }

        port.process_socket_events(now);
        port.handle_timeout(now);
        if let Some(request) = port.poll_resolve() {
            resolving = Some(start_resolution(resolver.as_ref(), request, config.resolve_timeout));
        }
        forward_events(&mut port, &events);
    }

    tracing::debug!("Port driver on {} stopped", port.local_address());
}

fn handle_command(
    port: &mut Port,
    command: Command,
    now: std::time::Instant,
) -> ControlFlow<Reply<()>> {
    match command {
        Command::PrepareAddress(reply) => {
            let _ = reply.send(port.prepare_address(now));
        }
        Command::CreateConnection(remote, reply) => {
            let _ = reply.send(port.create_connection(&remote, now).cloned());
        }
        Command::DestroyConnection(remote, reply) => {
            let _ = reply.send(port.destroy_connection(remote));
        }
        Command::Connection(remote, reply) => {
            let _ = reply.send(port.connection(remote).cloned());
        }
        Command::Send(remote, data, reply) => {
            let _ = reply.send(port.send(remote, &data, now));
        }
        Command::SetOption(opt, value, reply) => {
            let _ = reply.send(port.set_option(opt, value));
        }
        Command::GetOption(opt, reply) => {
            let _ = reply.send(port.get_option(opt));
        }
        Command::LastError(reply) => {
            let _ = reply.send(port.last_error());
        }
        Command::Candidates(reply) => {
            let _ = reply.send(port.candidates().to_vec());
        }
        Command::DiscoveryStatus(reply) => {
            let _ = reply.send(port.discovery_status());
        }
        Command::Close(reply) => {
            port.close();
            return ControlFlow::Break(reply);
        }
    }
    ControlFlow::Continue(())
}

fn forward_events(port: &mut Port, events: &mpsc::UnboundedSender<PortEvent>) {
    while let Some(event) = port.poll_event() {
        if events.send(event).is_err() {
            tracing::trace!("Port event receiver gone");
        }
    }
}

fn start_resolution(
    resolver: &dyn AsyncResolver,
    request: ResolveRequest,
    limit: Duration,
) -> PendingResolve {
    let lookup = resolver.resolve(&request.host, request.port);
    let host = request.host;
    PendingResolve {
        token: request.token,
        future: Box::pin(async move {
            match tokio::time::timeout(limit, lookup).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("resolving {host} took longer than {limit:?}"),
                )),
            }
        }),
    }
}

async fn next_resolution(
    resolving: &mut Option<PendingResolve>,
) -> (u64, io::Result<Vec<SocketAddr>>) {
    match resolving {
        Some(lookup) => {
            let result = lookup.future.as_mut().await;
            (lookup.token, result)
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Handle to a port running on its own task.
///
/// Every method fails with [`PortError::DriverGone`] once the task has
/// stopped.
#[derive(Debug)]
pub struct PortHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<PortEvent>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PortHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| PortError::DriverGone)?;
        rx.await.map_err(|_| PortError::DriverGone)
    }

    /// Address the port's socket is bound to
    #[must_use]
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start gathering; candidates arrive through [`PortHandle::next_event`]
    ///
    /// # Errors
    /// See [`Port::prepare_address`]
    pub async fn prepare_address(&self) -> Result<()> {
        self.request(Command::PrepareAddress).await?
    }

    /// Create a connection to `remote`; returns a snapshot of it
    ///
    /// # Errors
    /// See [`Port::create_connection`]
    pub async fn create_connection(&self, remote: Candidate) -> Result<Connection> {
        self.request(|reply| Command::CreateConnection(Box::new(remote), reply))
            .await?
    }

    /// Remove the connection to `remote`
    ///
    /// # Errors
    /// [`PortError::DriverGone`]
    pub async fn destroy_connection(&self, remote: SocketAddr) -> Result<bool> {
        self.request(|reply| Command::DestroyConnection(remote, reply))
            .await
    }

    /// Snapshot of the connection to `remote`
    ///
    /// # Errors
    /// [`PortError::DriverGone`]
    pub async fn connection(&self, remote: SocketAddr) -> Result<Option<Connection>> {
        self.request(|reply| Command::Connection(remote, reply)).await
    }

    /// Send a datagram on the connection to `remote`
    ///
    /// # Errors
    /// See [`Port::send`]
    pub async fn send(&self, remote: SocketAddr, data: impl Into<Vec<u8>>) -> Result<usize> {
        let data = data.into();
        self.request(|reply| Command::Send(remote, data, reply))
            .await?
    }

    /// Set a socket option
    ///
    /// # Errors
    /// See [`Port::set_option`]
    pub async fn set_option(&self, opt: SocketOption, value: i32) -> Result<()> {
        self.request(|reply| Command::SetOption(opt, value, reply))
            .await?
    }

    /// Read a socket option
    ///
    /// # Errors
    /// See [`Port::get_option`]
    pub async fn get_option(&self, opt: SocketOption) -> Result<i32> {
        self.request(|reply| Command::GetOption(opt, reply)).await?
    }

    /// OS error code of the most recent failure, cleared by this call
    ///
    /// # Errors
    /// [`PortError::DriverGone`]
    pub async fn last_error(&self) -> Result<Option<i32>> {
        self.request(Command::LastError).await
    }

    /// Candidates emitted so far
    ///
    /// # Errors
    /// [`PortError::DriverGone`]
    pub async fn candidates(&self) -> Result<Vec<Candidate>> {
        self.request(Command::Candidates).await
    }

    /// Discovery progress
    ///
    /// # Errors
    /// [`PortError::DriverGone`]
    pub async fn discovery_status(&self) -> Result<DiscoveryStatus> {
        self.request(Command::DiscoveryStatus).await
    }

    /// Next port event; `None` once the driver has stopped and every event
    /// was taken
    pub async fn next_event(&mut self) -> Option<PortEvent> {
        self.events.recv().await
    }

    /// Collect events until gathering completes, returning every candidate
    /// seen on the way. Packets received meanwhile are discarded.
    ///
    /// # Errors
    /// [`PortError::DriverGone`] if the driver stops first,
    /// [`PortError::SocketClosed`] if the socket closes first
    pub async fn wait_for_gathering(&mut self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        loop {
            match self.next_event().await {
                Some(PortEvent::CandidateReady(candidate)) => candidates.push(candidate),
                Some(PortEvent::GatheringComplete) => return Ok(candidates),
                Some(PortEvent::SocketClosed(_)) => return Err(PortError::SocketClosed),
                Some(PortEvent::DiscoveryFailed(failure)) => {
                    tracing::debug!("Discovery failed while gathering: {}", failure);
                }
                Some(PortEvent::Packet { remote, .. }) => {
                    tracing::trace!("Discarding packet from {} while gathering", remote);
                }
                None => return Err(PortError::DriverGone),
            }
        }
    }

    /// Close the port and stop the driver
    ///
    /// # Errors
    /// [`PortError::DriverGone`] if it had already stopped
    pub async fn close(self) -> Result<()> {
        self.request(Command::Close).await?;
        let _ = self.task.await;
        Ok(())
    }
}
