//! Server addresses.
//!
//! Accepted forms:
//!
//! ```text
//! host            -> port 3301
//! host:port
//! [ipv6]:port
//! [ipv6]          -> port 3301
//! ::1             -> bare IPv6 literal, port 3301
//! user:pass@host:port   (credentials are discarded)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::error::{ClientError, Result};

/// Port used when an address string carries none.
pub const DEFAULT_PORT: u16 = 3301;

/// A single server endpoint. Immutable and compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Creates an address from its parts.
    ///
    /// Fails when the host is empty or the port is zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(ClientError::InvalidAddress("host must not be empty".to_string()));
        }
        if port == 0 {
            return Err(ClientError::InvalidAddress(format!(
                "port must be in range 1..=65535, got 0 for host '{}'",
                host
            )));
        }
        Ok(Self { host, port })
    }

    /// Parses one of the accepted address forms.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ClientError::InvalidAddress("empty address".to_string()));
        }

        // Credentials are never kept; the last '@' separates them from the endpoint.
        let endpoint = match trimmed.rfind('@') {
            Some(pos) => &trimmed[pos + 1..],
            None => trimmed,
        };

        let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(|| {
                ClientError::InvalidAddress(format!("unterminated IPv6 literal in '{}'", input))
            })?;
            let host = &rest[..close];
            let tail = &rest[close + 1..];
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, input)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(ClientError::InvalidAddress(format!(
                        "unexpected characters after IPv6 literal in '{}'",
                        input
                    )))
                }
            };
            (host, port)
        } else {
            match endpoint.matches(':').count() {
                0 => (endpoint, DEFAULT_PORT),
                1 => {
                    let (host, port) = endpoint.split_at(endpoint.find(':').unwrap_or(0));
                    (host, parse_port(&port[1..], input)?)
                }
                // Unbracketed IPv6 literal: no port can be expressed.
                _ => (endpoint, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(ClientError::InvalidAddress(format!("missing host in '{}'", input)));
        }

        Self::new(host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the address to socket addresses.
    ///
    /// DNS lookups run on the runtime's blocking pool, so awaiting this never
    /// stalls a worker thread.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ClientError::Connection(format!("Invalid address '{}': {}", self, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ClientError::Connection(format!(
                "Address '{}' did not resolve to any socket address",
                self
            )));
        }
        Ok(addrs)
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16> {
    let value: u32 = port.parse().map_err(|_| {
        ClientError::InvalidAddress(format!("invalid port '{}' in '{}'", port, input))
    })?;
    if value == 0 || value > u16::MAX as u32 {
        return Err(ClientError::InvalidAddress(format!(
            "port must be in range 1..=65535, got {} in '{}'",
            value, input
        )));
    }
    Ok(value as u16)
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ServerAddress {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl Serialize for ServerAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ServerAddress::parse(&raw).map_err(serde::de::Error::custom)
    }
}
