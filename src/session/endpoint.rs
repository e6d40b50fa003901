//! Egress endpoint addresses and reattempt selection.
//!
//! The egress service returns up to one IPv4 and one IPv6 endpoint.
//! The first connect uses the first usable endpoint in response order;
//! every reattempt switches to the opposite family when both are
//! usable, so repeated failures probe both paths.

use crate::platform::{AddressFamily, NetworkInfo};
use crate::status::Status;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A parsed egress endpoint. The original sockaddr string is preserved
/// for telemetry and debug output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    sockaddr: String,
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    /// Parse `"host:port"` for IPv4 or `"[host]:port"` for IPv6.
    pub fn parse(sockaddr: &str) -> Result<Self, Status> {
        let parsed: SocketAddr = sockaddr.parse().map_err(|_| {
            Status::invalid_argument(format!("malformed egress sockaddr: {}", sockaddr))
        })?;
        Ok(Self {
            sockaddr: sockaddr.to_string(),
            ip: parsed.ip(),
            port: parsed.port(),
        })
    }

    /// The original sockaddr string as received.
    pub fn sockaddr(&self) -> &str {
        &self.sockaddr
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sockaddr)
    }
}

/// Chooses which egress endpoint each (re)attempt should target.
#[derive(Debug, Default)]
pub struct EndpointSelector {
    /// Usable endpoints in response order, at most one per family.
    candidates: Vec<Endpoint>,
    /// Family of the endpoint handed out last.
    last_family: Option<AddressFamily>,
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reinstall the endpoint set, filtered down to what the active
    /// network can reach. Clears the alternation state.
    pub fn reset(
        &mut self,
        endpoints: &[Endpoint],
        network: Option<&NetworkInfo>,
        ipv6_enabled: bool,
    ) {
        self.candidates.clear();
        self.last_family = None;
        for endpoint in endpoints {
            let usable = match endpoint.family() {
                AddressFamily::V4 => {
                    network.map(|n| n.address_family.supports_v4()).unwrap_or(true)
                }
                AddressFamily::V6 => {
                    ipv6_enabled
                        && network.map(|n| n.address_family.supports_v6()).unwrap_or(true)
                }
                // A parsed endpoint always has exactly one family.
                AddressFamily::V4V6 => false,
            };
            if usable && !self.candidates.iter().any(|c| c.family() == endpoint.family()) {
                self.candidates.push(endpoint.clone());
            }
        }
    }

    /// Endpoint for the next attempt: first usable endpoint initially,
    /// then the opposite family of the previous attempt when present.
    pub fn next_endpoint(&mut self) -> Result<Endpoint, Status> {
        let chosen = match self.last_family {
            None => self.candidates.first(),
            Some(family) => self
                .candidates
                .iter()
                .find(|c| c.family() != family)
                .or_else(|| self.candidates.iter().find(|c| c.family() == family)),
        };
        let endpoint = chosen
            .cloned()
            .ok_or_else(|| Status::failed_precondition("no usable egress endpoints"))?;
        self.last_family = Some(endpoint.family());
        Ok(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
