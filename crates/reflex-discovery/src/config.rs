//! Port configuration

use crate::candidate::Network;
use crate::error::{PortError, Result};
use crate::stun::RetransmitConfig;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default STUN server port
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// How a port treats server-reflexive discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryPolicy {
    /// Never contact a STUN server
    LocalOnly,
    /// Emit the local candidate at once and add a reflexive one if a
    /// configured server answers
    #[default]
    PreferStun,
    /// Hold the local candidate back until discovery concludes, then
    /// report success or an explicit failure
    RequireStun,
}

impl fmt::Display for DiscoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalOnly => write!(f, "local-only"),
            Self::PreferStun => write!(f, "prefer-stun"),
            Self::RequireStun => write!(f, "require-stun"),
        }
    }
}

impl FromStr for DiscoveryPolicy {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local-only" => Ok(Self::LocalOnly),
            "prefer-stun" => Ok(Self::PreferStun),
            "require-stun" => Ok(Self::RequireStun),
            other => Err(PortError::InvalidConfig(
                format!("unknown discovery policy '{other}'").into(),
            )),
        }
    }
}

/// STUN server location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StunServer {
    /// Literal address; no resolution needed
    Addr(SocketAddr),
    /// Hostname resolved before use
    Host {
        /// DNS name
        host: String,
        /// UDP port
        port: u16,
    },
}

impl StunServer {
    /// Literal address, if no resolution is needed
    #[must_use]
    pub fn literal(&self) -> Option<SocketAddr> {
        match self {
            Self::Addr(addr) => Some(*addr),
            Self::Host { .. } => None,
        }
    }
}

impl From<SocketAddr> for StunServer {
    fn from(addr: SocketAddr) -> Self {
        Self::Addr(addr)
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for StunServer {
    type Err = PortError;

    /// Parse `host`, `host:port`, `ip`, `ip:port` or `[ipv6]:port`. The
    /// port defaults to 3478.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Addr(addr));
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(Self::Addr(SocketAddr::new(ip, DEFAULT_STUN_PORT)));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    PortError::InvalidConfig(format!("invalid STUN server port in '{s}'").into())
                })?;
                (host, port)
            }
            None => (s, DEFAULT_STUN_PORT),
        };

        if host.is_empty() || host.contains(':') || host.contains(char::is_whitespace) {
            return Err(PortError::InvalidConfig(
                format!("invalid STUN server '{s}'").into(),
            ));
        }
        Ok(Self::Host {
            host: host.to_string(),
            port,
        })
    }
}

/// Port configuration
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Interface to bind on
    pub network: Network,
    /// Lowest local port to try (0 with `max_port` 0: any port)
    pub min_port: u16,
    /// Highest local port to try
    pub max_port: u16,
    /// ICE username fragment; generated when unset
    pub username: Option<String>,
    /// ICE password; generated when unset
    pub password: Option<String>,
    /// Discovery policy
    pub policy: DiscoveryPolicy,
    /// Primary STUN server
    pub server: Option<StunServer>,
    /// Server tried after the primary times out
    pub fallback_server: Option<StunServer>,
    /// Retransmission schedule for binding requests
    pub retransmit: RetransmitConfig,
    /// Refresh the NAT binding this often once discovery succeeded
    pub keepalive_interval: Option<Duration>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new(Network::new("any", IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

impl PortConfig {
    /// Configuration binding any port on `network`, without a STUN server
    #[must_use]
    pub fn new(network: Network) -> Self {
        Self {
            network,
            min_port: 0,
            max_port: 0,
            username: None,
            password: None,
            policy: DiscoveryPolicy::default(),
            server: None,
            fallback_server: None,
            retransmit: RetransmitConfig::default(),
            keepalive_interval: None,
        }
    }

    /// Set the local port range
    #[must_use]
    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Set the ICE credentials
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the discovery policy
    #[must_use]
    pub fn with_policy(mut self, policy: DiscoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the primary STUN server
    #[must_use]
    pub fn with_server(mut self, server: impl Into<StunServer>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the fallback STUN server
    #[must_use]
    pub fn with_fallback_server(mut self, server: impl Into<StunServer>) -> Self {
        self.fallback_server = Some(server.into());
        self
    }

    /// Set the retransmission schedule
    #[must_use]
    pub fn with_retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.retransmit = retransmit;
        self
    }

    /// Enable NAT keepalives
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Check the configuration for contradictions
    ///
    /// # Errors
    /// [`PortError::InvalidConfig`] describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            return Err(PortError::InvalidConfig(
                format!("min_port {} > max_port {}", self.min_port, self.max_port).into(),
            ));
        }
        if self.policy == DiscoveryPolicy::RequireStun && self.server.is_none() {
            return Err(PortError::InvalidConfig(
                "require-stun policy needs a STUN server".into(),
            ));
        }
        if self.keepalive_interval == Some(Duration::ZERO) {
            return Err(PortError::InvalidConfig(
                "keepalive interval must be non-zero".into(),
            ));
        }
        if self.retransmit.initial_interval.is_zero() {
            return Err(PortError::InvalidConfig(
                "retransmit initial interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_server() {
        let server: StunServer = "198.51.100.1:3479".parse().unwrap();
        assert_eq!(server, StunServer::Addr("198.51.100.1:3479".parse().unwrap()));
        assert!(server.literal().is_some());
    }

    #[test]
    fn test_parse_default_port() {
        let server: StunServer = "198.51.100.1".parse().unwrap();
        assert_eq!(server, StunServer::Addr("198.51.100.1:3478".parse().unwrap()));

        let server: StunServer = "stun.example.org".parse().unwrap();
        assert_eq!(
            server,
            StunServer::Host {
                host: "stun.example.org".to_string(),
                port: 3478
            }
        );
    }

    #[test]
    fn test_parse_ipv6_server() {
        let server: StunServer = "[2001:db8::1]:19302".parse().unwrap();
        assert_eq!(server, StunServer::Addr("[2001:db8::1]:19302".parse().unwrap()));

        let server: StunServer = "2001:db8::1".parse().unwrap();
        assert_eq!(server, StunServer::Addr("[2001:db8::1]:3478".parse().unwrap()));
    }

    #[test]
    fn test_parse_hostname_with_port() {
        let server: StunServer = "stun.l.google.com:19302".parse().unwrap();
        assert_eq!(server.to_string(), "stun.l.google.com:19302");
        assert!(server.literal().is_none());
    }

    #[test]
    fn test_parse_invalid_servers() {
        assert!("".parse::<StunServer>().is_err());
        assert!("stun.example.org:notaport".parse::<StunServer>().is_err());
        assert!("stun.example.org:70000".parse::<StunServer>().is_err());
        assert!(":3478".parse::<StunServer>().is_err());
    }

    #[test]
    fn test_policy_roundtrip_names() {
        for policy in [
            DiscoveryPolicy::LocalOnly,
            DiscoveryPolicy::PreferStun,
            DiscoveryPolicy::RequireStun,
        ] {
            assert_eq!(policy.to_string().parse::<DiscoveryPolicy>().unwrap(), policy);
        }
        assert!("stun-only".parse::<DiscoveryPolicy>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = PortConfig::default();
        assert_eq!(config.network.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!((config.min_port, config.max_port), (0, 0));
        assert_eq!(config.policy, DiscoveryPolicy::PreferStun);
        assert!(config.server.is_none());
        assert!(config.keepalive_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config = PortConfig::default().with_port_range(6000, 5000);
        assert!(matches!(config.validate(), Err(PortError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_require_stun_needs_server() {
        let config = PortConfig::default().with_policy(DiscoveryPolicy::RequireStun);
        assert!(config.validate().is_err());

        let config = config.with_server("198.51.100.1:3478".parse::<SocketAddr>().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_keepalive() {
        let config = PortConfig::default().with_keepalive(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
