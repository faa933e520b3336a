//! Connectivity candidates
//!
//! Addresses a port offers to peers, in the shape ICE expects: type,
//! priority, foundation and credentials.

use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Protocol name carried by every UDP candidate
pub const UDP_PROTOCOL: &str = "udp";

/// Length of a generated ICE username fragment
pub const ICE_UFRAG_LENGTH: usize = 16;

/// Length of a generated ICE password
pub const ICE_PWD_LENGTH: usize = 24;

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Address of the local socket
    Local,
    /// Address observed by a STUN server
    ServerReflexive,
}

impl CandidateType {
    /// RFC 8445 type preference
    #[must_use]
    pub const fn preference(self) -> u32 {
        match self {
            Self::Local => 126,
            Self::ServerReflexive => 100,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "host"),
            Self::ServerReflexive => write!(f, "srflx"),
        }
    }
}

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// Family of `ip`
    #[must_use]
    pub const fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Local interface a port is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Network {
    name: String,
    ip: IpAddr,
}

impl Network {
    /// Create a network named `name` with address `ip`
    #[must_use]
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    /// Interface name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interface address
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Address family of the interface
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(self.ip)
    }
}

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    /// Username fragment
    pub username: String,
    /// Password
    pub password: String,
}

impl IceCredentials {
    /// Random alphanumeric credentials
    #[must_use]
    pub fn random() -> Self {
        Self {
            username: random_token(ICE_UFRAG_LENGTH),
            password: random_token(ICE_PWD_LENGTH),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Connectivity candidate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    component: u32,
    protocol: String,
    candidate_type: CandidateType,
    address: SocketAddr,
    related_address: Option<SocketAddr>,
    priority: u32,
    username: String,
    password: String,
    network_name: String,
    generation: u32,
    foundation: String,
}

impl Candidate {
    /// Candidate for the local socket address
    #[must_use]
    pub fn local(address: SocketAddr, network: &Network, credentials: &IceCredentials) -> Self {
        Self::build(CandidateType::Local, address, None, network.name(), credentials)
    }

    /// Server-reflexive candidate whose base is the local socket `base`
    #[must_use]
    pub fn server_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        network: &Network,
        credentials: &IceCredentials,
    ) -> Self {
        Self::build(
            CandidateType::ServerReflexive,
            address,
            Some(base),
            network.name(),
            credentials,
        )
    }

    /// Candidate learned from a peer. Credentials and network are unknown.
    #[must_use]
    pub fn remote(address: SocketAddr, candidate_type: CandidateType) -> Self {
        let credentials = IceCredentials {
            username: String::new(),
            password: String::new(),
        };
        Self::build(candidate_type, address, None, "", &credentials)
    }

    fn build(
        candidate_type: CandidateType,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
        network_name: &str,
        credentials: &IceCredentials,
    ) -> Self {
        let base_ip = related_address.unwrap_or(address).ip();
        Self {
            component: 1,
            protocol: UDP_PROTOCOL.to_string(),
            candidate_type,
            address,
            related_address,
            priority: compute_priority(candidate_type, 65535, 1),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            network_name: network_name.to_string(),
            generation: 0,
            foundation: compute_foundation(candidate_type, UDP_PROTOCOL, base_ip),
        }
    }

    /// Replace the transport protocol name
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Replace the ICE credentials
    #[must_use]
    pub fn with_credentials(mut self, credentials: &IceCredentials) -> Self {
        self.username.clone_from(&credentials.username);
        self.password.clone_from(&credentials.password);
        self
    }

    /// Component id
    #[must_use]
    pub fn component(&self) -> u32 {
        self.component
    }

    /// Transport protocol name
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Candidate type
    #[must_use]
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// Transport address
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Base address for reflexive candidates
    #[must_use]
    pub fn related_address(&self) -> Option<SocketAddr> {
        self.related_address
    }

    /// RFC 8445 priority
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// ICE username fragment
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// ICE password
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Name of the network the candidate was gathered on
    #[must_use]
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Candidate generation
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Foundation shared by candidates of the same type, protocol and base
    #[must_use]
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Address family of the transport address
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(self.address.ip())
    }

    /// Format as an SDP `candidate:` line
    #[must_use]
    pub fn to_sdp_string(&self) -> String {
        let mut s = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        );
        if let Some(related) = self.related_address {
            s.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        s.push_str(&format!(" generation {}", self.generation));
        s
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.candidate_type, self.address)
    }
}

/// Priority = 2^24 * type preference + 2^8 * local preference + (256 - component)
fn compute_priority(candidate_type: CandidateType, local_pref: u32, component: u32) -> u32 {
    (candidate_type.preference() << 24) + (local_pref << 8) + (256 - component)
}

fn compute_foundation(candidate_type: CandidateType, protocol: &str, base_ip: IpAddr) -> String {
    let mut hasher = DefaultHasher::new();
    candidate_type.hash(&mut hasher);
    protocol.hash(&mut hasher);
    base_ip.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}
