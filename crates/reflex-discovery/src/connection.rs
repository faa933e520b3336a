//! Connections from a port's local candidate to one remote candidate.
//!
//! A [`Connection`] is owned by its [`Port`](crate::Port) and keyed by the
//! remote address; all traffic goes through the port's socket.

use crate::candidate::Candidate;
use std::net::SocketAddr;
use std::time::Instant;

/// Traffic counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Sends that failed, would-block included
    pub send_errors: u64,
}

impl ConnectionStats {
    fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }
}

/// Pairing of the port's local candidate with a remote candidate
#[derive(Debug, Clone)]
pub struct Connection {
    local: Candidate,
    remote: Candidate,
    created_at: Instant,
    last_send: Option<Instant>,
    last_receive: Option<Instant>,
    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(local: Candidate, remote: Candidate, now: Instant) -> Self {
        Self {
            local,
            remote,
            created_at: now,
            last_send: None,
            last_receive: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Local candidate the connection sends from
    #[must_use]
    pub fn local_candidate(&self) -> &Candidate {
        &self.local
    }

    /// Remote candidate the connection sends to
    #[must_use]
    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote
    }

    /// Remote transport address
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.remote.address()
    }

    /// When the connection was created
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last successful send
    #[must_use]
    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    /// Time of the last received datagram
    #[must_use]
    pub fn last_receive(&self) -> Option<Instant> {
        self.last_receive
    }

    /// Traffic counters
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub(crate) fn record_send(&mut self, bytes: usize, now: Instant) {
        self.stats.record_send(bytes);
        self.last_send = Some(now);
    }

    pub(crate) fn record_send_error(&mut self) {
        self.stats.send_errors += 1;
    }

    pub(crate) fn record_receive(&mut self, bytes: usize, now: Instant) {
        self.stats.record_recv(bytes);
        self.last_receive = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateType, IceCredentials, Network};
    use std::time::Duration;

    fn connection(now: Instant) -> Connection {
        let network = Network::new("lo", "127.0.0.1".parse().unwrap());
        let local = Candidate::local(
            "127.0.0.1:5000".parse().unwrap(),
            &network,
            &IceCredentials::random(),
        );
        let remote = Candidate::remote("127.0.0.1:6000".parse().unwrap(), CandidateType::Local);
        Connection::new(local, remote, now)
    }

    #[test]
    fn test_new_connection() {
        let now = Instant::now();
        let conn = connection(now);
        assert_eq!(conn.remote_address(), "127.0.0.1:6000".parse().unwrap());
        assert_eq!(conn.created_at(), now);
        assert_eq!(conn.last_send(), None);
        assert_eq!(conn.last_receive(), None);
        assert_eq!(conn.stats(), ConnectionStats::default());
    }

    #[test]
    fn test_traffic_accounting() {
        let start = Instant::now();
        let mut conn = connection(start);

        for i in 1..=3u64 {
            conn.record_send(100, start + Duration::from_millis(i));
        }
        conn.record_receive(40, start + Duration::from_millis(10));
        conn.record_send_error();

        let stats = conn.stats();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.bytes_sent, 300);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 40);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(conn.last_send(), Some(start + Duration::from_millis(3)));
        assert_eq!(conn.last_receive(), Some(start + Duration::from_millis(10)));
    }
}
