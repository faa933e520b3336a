//! # reflex Transport
//!
//! Socket layer for reflex.
//!
//! This crate provides:
//! - The [`AsyncSocket`] interface: non-blocking I/O plus readiness events
//! - A Tokio-backed UDP socket and its [`PacketSocketFactory`]
//! - [`SocketStream`], which turns readiness into stream events
//! - In-memory sockets for tests (`test-util` feature)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod socket;
pub mod stream;
pub mod udp;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use socket::{
    AsyncSocket, PacketSocketFactory, SocketEvent, SocketEventReceiver, SocketEventSender,
    SocketOption, SocketState, error_code, event_channel,
};
pub use stream::{SocketStream, StreamEvent, StreamEvents, StreamResult, StreamState};
pub use udp::{TokioSocketFactory, UdpSocket};
