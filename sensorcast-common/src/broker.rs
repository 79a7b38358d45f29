//! Broker address parsing and client identifiers.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default MQTT port (unencrypted).
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// A resolved broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BrokerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_broker(s)
    }
}

/// Parse a broker address.
///
/// Accepts `host`, `host:port`, `mqtt://host[:port]` and `tcp://host[:port]`.
/// IPv6 literals must be bracketed, as in `[::1]:1883`. The port defaults to
/// 1883 when omitted.
pub fn parse_broker(input: &str) -> Result<BrokerAddress> {
    let trimmed = input.trim();

    let rest = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::InvalidBroker(format!(
                "unsupported scheme '{}' in '{}'",
                scheme, input
            )));
        }
        None => trimmed,
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(Error::InvalidBroker(format!("missing host in '{}'", input)));
    }
    if rest.contains('/') {
        return Err(Error::InvalidBroker(format!(
            "unexpected path in '{}'",
            input
        )));
    }

    let (host, port) = match rest.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by ":port"
        Some(bracketed) => {
            let (host, after) = bracketed.split_once(']').ok_or_else(|| {
                Error::InvalidBroker(format!("unterminated IPv6 literal in '{}'", input))
            })?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(Error::InvalidBroker(format!(
                    "invalid IPv6 address '{}' in '{}'",
                    host, input
                )));
            }
            let port = match after {
                "" => DEFAULT_MQTT_PORT,
                _ => match after.strip_prefix(':') {
                    Some(port) => parse_port(port, input)?,
                    None => {
                        return Err(Error::InvalidBroker(format!(
                            "unexpected '{}' after IPv6 literal in '{}'",
                            after, input
                        )));
                    }
                },
            };
            (host, port)
        }
        None => match rest.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(Error::InvalidBroker(format!(
                    "IPv6 address must be enclosed in brackets in '{}'",
                    input
                )));
            }
            Some((host, port)) => (host, parse_port(port, input)?),
            None => (rest, DEFAULT_MQTT_PORT),
        },
    };

    if host.is_empty() {
        return Err(Error::InvalidBroker(format!("missing host in '{}'", input)));
    }

    Ok(BrokerAddress::new(host, port))
}

fn parse_port(port: &str, input: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::InvalidBroker(format!("invalid port '{}' in '{}'", port, input)))
}

/// Generate a unique MQTT client identifier with the given prefix.
pub fn generate_client_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}
