//! Stream adapter over an [`AsyncSocket`].
//!
//! [`SocketStream`] owns at most one socket, subscribes to its readiness
//! signals and re-emits them as [`StreamEvent`]s. Reads and writes never
//! wait; they report [`StreamResult::Block`] instead.

use crate::socket::{
    AsyncSocket, SocketEvent, SocketEventReceiver, SocketState, error_code, event_channel,
};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::task::{Context, Poll};

/// Set of stream event flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamEvents(u8);

impl StreamEvents {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Stream became usable
    pub const OPEN: Self = Self(1);
    /// Data can be read
    pub const READ: Self = Self(1 << 1);
    /// Data can be written
    pub const WRITE: Self = Self(1 << 2);
    /// Stream closed
    pub const CLOSE: Self = Self(1 << 3);

    /// Every flag in `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// No flag is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for StreamEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for StreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::OPEN, "OPEN"),
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::CLOSE, "CLOSE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join(" | "))
        }
    }
}

/// Event delivered by a [`SocketStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    /// Which conditions occurred
    pub events: StreamEvents,
    /// OS error code for `CLOSE`, 0 otherwise
    pub error: i32,
}

impl From<SocketEvent> for StreamEvent {
    fn from(event: SocketEvent) -> Self {
        let (events, error) = match event {
            SocketEvent::Connect => (
                StreamEvents::OPEN | StreamEvents::READ | StreamEvents::WRITE,
                0,
            ),
            SocketEvent::Read => (StreamEvents::READ, 0),
            SocketEvent::Write => (StreamEvents::WRITE, 0),
            SocketEvent::Close(code) => (StreamEvents::CLOSE, code),
        };
        Self { events, error }
    }
}

/// Stream state derived from the attached socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No socket, socket closed, or [`SocketStream::close`] called
    Closed,
    /// Socket is connecting
    Opening,
    /// Socket is usable
    Open,
}

/// Outcome of a non-blocking read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResult {
    /// Bytes transferred
    Success(usize),
    /// Try again after the next readiness event
    Block,
    /// Zero-length read on a non-empty buffer
    Eos,
    /// OS error code
    Error(i32),
    /// Stream closed or nothing attached
    Closed,
}

/// Adapter turning socket readiness into stream events
pub struct SocketStream {
    socket: Option<Box<dyn AsyncSocket>>,
    events: Option<SocketEventReceiver>,
    closed: bool,
}

impl SocketStream {
    /// Create a stream wrapping `socket`
    #[must_use]
    pub fn new(socket: Box<dyn AsyncSocket>) -> Self {
        let mut stream = Self::empty();
        stream.attach(Some(socket));
        stream
    }

    /// Create a stream with nothing attached
    #[must_use]
    pub fn empty() -> Self {
        Self {
            socket: None,
            events: None,
            closed: false,
        }
    }

    /// Replace the wrapped socket. The previous socket is dropped and none
    /// of its pending events are delivered.
    pub fn attach(&mut self, socket: Option<Box<dyn AsyncSocket>>) {
        self.events = None;
        self.socket = None;
        self.closed = false;

        if let Some(mut socket) = socket {
            let (tx, rx) = event_channel();
            socket.subscribe(Some(tx));
            self.events = Some(rx);
            self.socket = Some(socket);
        }
    }

    /// Release the wrapped socket to the caller without closing it
    pub fn detach(&mut self) -> Option<Box<dyn AsyncSocket>> {
        self.events = None;
        let mut socket = self.socket.take()?;
        socket.subscribe(None);
        Some(socket)
    }

    /// Wrapped socket, if any
    #[must_use]
    pub fn socket(&self) -> Option<&dyn AsyncSocket> {
        self.socket.as_deref()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        match &self.socket {
            Some(_) if self.closed => StreamState::Closed,
            Some(socket) => match socket.state() {
                SocketState::Connected => StreamState::Open,
                SocketState::Connecting => StreamState::Opening,
                SocketState::Closed => StreamState::Closed,
            },
            None => StreamState::Closed,
        }
    }

    fn usable_socket(&mut self) -> Option<&mut Box<dyn AsyncSocket>> {
        if self.closed {
            return None;
        }
        self.socket.as_mut()
    }

    /// Read without waiting
    pub fn read(&mut self, buf: &mut [u8]) -> StreamResult {
        let Some(socket) = self.usable_socket() else {
            return StreamResult::Closed;
        };
        match socket.recv(buf) {
            Ok(0) if !buf.is_empty() => StreamResult::Eos,
            Ok(n) => StreamResult::Success(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => StreamResult::Block,
            Err(e) => StreamResult::Error(error_code(&e)),
        }
    }

    /// Write without waiting
    pub fn write(&mut self, data: &[u8]) -> StreamResult {
        let Some(socket) = self.usable_socket() else {
            return StreamResult::Closed;
        };
        match socket.send(data) {
            Ok(n) => StreamResult::Success(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => StreamResult::Block,
            Err(e) => StreamResult::Error(error_code(&e)),
        }
    }

    /// Close the wrapped socket. Later reads and writes return
    /// [`StreamResult::Closed`].
    ///
    /// # Errors
    /// Returns the socket's error if shutdown fails
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.socket.as_mut() {
            Some(socket) => socket.close(),
            None => Ok(()),
        }
    }

    /// Next queued event, if one is ready
    pub fn try_next_event(&mut self) -> Option<StreamEvent> {
        self.events
            .as_mut()?
            .try_recv()
            .ok()
            .map(StreamEvent::from)
    }

    /// Poll for the next event, driving the socket's readiness detection.
    ///
    /// Resolves to `None` when nothing is attached.
    pub fn poll_next_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let Self { socket, events, .. } = self;
        let Some(rx) = events.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            match rx.poll_recv(cx) {
                Poll::Ready(event) => return Poll::Ready(event.map(StreamEvent::from)),
                Poll::Pending => {}
            }
            let ready = socket
                .as_mut()
                .is_some_and(|socket| socket.poll_readiness(cx).is_ready());
            if !ready {
                return Poll::Pending;
            }
        }
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        poll_fn(|cx| self.poll_next_event(cx)).await
    }

    /// Drive the wrapped socket's readiness detection
    pub fn poll_readiness(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self.socket.as_mut() {
            Some(socket) => socket.poll_readiness(cx),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketStream")
            .field("attached", &self.socket.is_some())
            .field("state", &self.state())
            .finish()
    }
}
