//! # reflex Discovery
//!
//! Candidate gathering for peer-to-peer connectivity.
//!
//! This crate provides:
//! - STUN binding messages (RFC 5389) and a retransmitting transaction engine
//! - [`Port`]: a UDP socket that reports its local candidate and, through a
//!   STUN server, its server-reflexive candidate
//! - [`Connection`]s from a port to remote candidates
//! - [`spawn_port`], which drives a port on a Tokio task
//!
//! ## Discovery
//!
//! A port sends a Binding request to its STUN server and retransmits it at
//! 100 ms, doubling up to 1.6 s, for 8 retransmissions. The mapped address
//! in the response becomes a server-reflexive candidate. A port that cannot
//! reach its server still offers its local candidate unless the policy is
//! [`DiscoveryPolicy::RequireStun`].
//!
//! The [`Port`] itself never blocks or reads a clock, so it can be stepped
//! by hand in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use reflex_discovery::{DriverConfig, Network, Port, PortConfig, TokioResolver, spawn_port};
//! use reflex_transport::TokioSocketFactory;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Network::new("any", "0.0.0.0".parse()?);
//! let config = PortConfig::new(network).with_server("stun.l.google.com:19302".parse::<reflex_discovery::StunServer>()?);
//! let port = Port::create(config, &TokioSocketFactory)?;
//!
//! let mut handle = spawn_port(port, Arc::new(TokioResolver), DriverConfig::default());
//! handle.prepare_address().await?;
//! for candidate in handle.wait_for_gathering().await? {
//!     println!("{candidate}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candidate;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod port;
pub mod resolver;
pub mod stun;

pub use candidate::{AddressFamily, Candidate, CandidateType, IceCredentials, Network};
pub use config::{DEFAULT_STUN_PORT, DiscoveryPolicy, PortConfig, StunServer};
pub use connection::{Connection, ConnectionStats};
pub use driver::{DriverConfig, PortHandle, spawn_port};
pub use error::{PortError, Result};
pub use port::{DiscoveryFailure, DiscoveryStatus, Port, PortEvent, PortState, ResolveRequest};
pub use resolver::{AsyncResolver, ResolveFuture, TokioResolver};
pub use stun::{RetransmitConfig, StunError, StunMessage, TransactionId};
