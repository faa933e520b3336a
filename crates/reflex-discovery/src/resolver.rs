//! Hostname resolution for STUN servers

use crate::candidate::AddressFamily;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

/// Pending resolution yielding every address found
pub type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;

/// Asynchronous hostname resolver
pub trait AsyncResolver: Send + Sync {
    /// Resolve `host`, attaching `port` to each address
    fn resolve(&self, host: &str, port: u16) -> ResolveFuture;
}

/// Resolver backed by the system resolver through Tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioResolver;

impl AsyncResolver for TokioResolver {
    fn resolve(&self, host: &str, port: u16) -> ResolveFuture {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
            Ok(addrs.collect())
        })
    }
}

/// First address of the wanted family
#[must_use]
pub fn pick_address(addrs: &[SocketAddr], family: AddressFamily) -> Option<SocketAddr> {
    addrs
        .iter()
        .copied()
        .find(|addr| AddressFamily::of(addr.ip()) == family)
}
