//! Configuration file for the reflex CLI.

use anyhow::Context;
use reflex_discovery::{
    DiscoveryPolicy, DriverConfig, Network, PortConfig, RetransmitConfig, StunServer,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// reflex configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local port configuration
    #[serde(default)]
    pub port: PortSection,
    /// STUN server configuration
    #[serde(default)]
    pub stun: StunSection,
    /// Binding request retransmission
    #[serde(default)]
    pub retransmit: RetransmitSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSection {
    /// Interface address to bind
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Name reported in candidates
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Lowest local port (0 with max_port 0: any)
    #[serde(default)]
    pub min_port: u16,
    /// Highest local port
    #[serde(default)]
    pub max_port: u16,
    /// ICE username fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// ICE password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// STUN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunSection {
    /// Primary server, `host[:port]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Server tried when the primary does not answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// `local-only`, `prefer-stun` or `require-stun`
    #[serde(default = "default_policy")]
    pub policy: String,
    /// NAT keepalive interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,
    /// Hostname resolution limit in seconds
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,
}

/// Binding request retransmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetransmitSection {
    /// First wait in milliseconds
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    /// Wait ceiling in milliseconds
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    /// Resends before giving up
    #[serde(default = "default_max_retransmissions")]
    pub max_retransmissions: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_interface() -> String {
    "any".to_string()
}

fn default_policy() -> String {
    DiscoveryPolicy::default().to_string()
}

fn default_resolve_timeout() -> u64 {
    5
}

fn default_initial_interval() -> u64 {
    100
}

fn default_max_interval() -> u64 {
    1600
}

fn default_max_retransmissions() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PortSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            interface: default_interface(),
            min_port: 0,
            max_port: 0,
            username: None,
            password: None,
        }
    }
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            server: None,
            fallback: None,
            policy: default_policy(),
            keepalive_secs: None,
            resolve_timeout_secs: default_resolve_timeout(),
        }
    }
}

impl Default for RetransmitSection {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            max_retransmissions: default_max_retransmissions(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the defaults when it does not
    /// exist
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        if self.retransmit.initial_interval_ms == 0 {
            anyhow::bail!("Retransmit initial interval must be non-zero");
        }
        if self.stun.resolve_timeout_secs == 0 {
            anyhow::bail!("Resolve timeout must be non-zero");
        }
        self.port_config()?.validate()?;
        Ok(())
    }

    /// Discovery policy named in `[stun]`
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown policy name.
    pub fn policy(&self) -> anyhow::Result<DiscoveryPolicy> {
        self.stun
            .policy
            .parse()
            .with_context(|| format!("invalid [stun] policy '{}'", self.stun.policy))
    }

    /// Build the port configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a server address or the policy does not parse.
    pub fn port_config(&self) -> anyhow::Result<PortConfig> {
        let network = Network::new(self.port.interface.clone(), self.port.bind);
        let retransmit = RetransmitConfig::default()
            .with_initial_interval(Duration::from_millis(self.retransmit.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.retransmit.max_interval_ms))
            .with_max_retransmissions(self.retransmit.max_retransmissions);

        let mut config = PortConfig::new(network)
            .with_port_range(self.port.min_port, self.port.max_port)
            .with_policy(self.policy()?)
            .with_retransmit(retransmit);

        if let (Some(username), Some(password)) = (&self.port.username, &self.port.password) {
            config = config.with_credentials(username.clone(), password.clone());
        }
        if let Some(server) = &self.stun.server {
            config = config.with_server(parse_server(server)?);
        }
        if let Some(fallback) = &self.stun.fallback {
            config = config.with_fallback_server(parse_server(fallback)?);
        }
        if let Some(secs) = self.stun.keepalive_secs {
            config = config.with_keepalive(Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// Build the driver configuration
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            resolve_timeout: Duration::from_secs(self.stun.resolve_timeout_secs),
        }
    }
}

fn parse_server(server: &str) -> anyhow::Result<StunServer> {
    server
        .parse()
        .with_context(|| format!("invalid STUN server '{server}'"))
}
