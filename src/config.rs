use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::relay::request::RetransmitConfig;
use crate::relay::TURN_DEFAULT_PORT;

fn default_local_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Relay client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TURN server as `host:port` or `host` (port defaults to 3478).
    /// The host may be an IP literal or a hostname; hostnames are
    /// resolved when the port prepares its address.
    pub server: String,

    /// Long-term credential username
    pub username: String,

    /// Long-term credential password
    pub password: String,

    /// Local IP to bind the UDP socket on
    #[serde(default = "default_local_ip")]
    pub local_ip: IpAddr,

    /// Lowest local port to try (0 = OS-assigned)
    #[serde(default)]
    pub min_port: u16,

    /// Highest local port to try (0 = OS-assigned)
    #[serde(default)]
    pub max_port: u16,

    /// Retransmission tuning for in-flight requests
    #[serde(default)]
    pub retransmit: RetransmitConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: String::new(),
            local_ip: default_local_ip(),
            min_port: 0,
            max_port: 0,
            retransmit: RetransmitConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a configuration for the given server and credentials,
    /// binding on an OS-assigned local port.
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Restrict the local socket to a port range
    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Validate structural settings.
    ///
    /// Credentials are deliberately not checked here: an empty
    /// username/password is a protocol-level failure reported through
    /// [`RelayEvent::AddressError`](crate::relay::RelayEvent) when the
    /// port prepares its address.
    pub fn validate(&self) -> RelayResult<()> {
        if self.server.is_empty() {
            return Err(RelayError::Configuration(
                "server address is empty".to_string(),
            ));
        }
        if (self.min_port == 0) != (self.max_port == 0) {
            return Err(RelayError::Configuration(
                "port range must set both ends or neither".to_string(),
            ));
        }
        if self.min_port > self.max_port {
            return Err(RelayError::Configuration(format!(
                "invalid port range {}-{}",
                self.min_port, self.max_port
            )));
        }
        Ok(())
    }

    /// Split `server` into host and port, applying the default TURN port
    /// when none is given. IPv6 literals use bracket notation
    /// (`[2001:db8::1]:3478`).
    pub fn server_host_port(&self) -> (String, u16) {
        let s = self.server.as_str();

        if let Some(rest) = s.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(TURN_DEFAULT_PORT);
                return (host.to_string(), port);
            }
        }

        match s.rsplit_once(':') {
            // A second ':' means an unbracketed IPv6 literal, not host:port.
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (s.to_string(), TURN_DEFAULT_PORT),
            },
            _ => (s.to_string(), TURN_DEFAULT_PORT),
        }
    }
}
