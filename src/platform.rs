//! Platform collaborator seams: networks, tunnels, OAuth.
//!
//! The engine never creates tunnel fds or talks to account services
//! itself. The embedding platform implements [`VpnService`] and
//! [`OAuthTokenProvider`]; the engine drives them and reacts to the
//! results.

use crate::session::endpoint::Endpoint;
use crate::status::Status;
use async_trait::async_trait;

/// Address families a network or endpoint can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    V4V6,
}

impl AddressFamily {
    /// Whether IPv6 destinations are reachable on this family.
    pub fn supports_v6(&self) -> bool {
        matches!(self, AddressFamily::V6 | AddressFamily::V4V6)
    }

    /// Whether IPv4 destinations are reachable on this family.
    pub fn supports_v4(&self) -> bool {
        matches!(self, AddressFamily::V4 | AddressFamily::V4V6)
    }
}

/// Physical network classification, as reported by the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    Cellular,
    #[default]
    Unknown,
}

/// A platform network the datapath can bind to.
#[derive(Clone, Debug)]
pub struct NetworkInfo {
    /// Platform-assigned network identifier.
    pub network_id: u64,
    pub network_type: NetworkType,
    pub address_family: AddressFamily,
}

impl NetworkInfo {
    pub fn new(network_id: u64, network_type: NetworkType) -> Self {
        Self {
            network_id,
            network_type,
            address_family: AddressFamily::V4V6,
        }
    }

    pub fn with_address_family(mut self, family: AddressFamily) -> Self {
        self.address_family = family;
        self
    }
}

/// An IP range assigned to or routed through the tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelIpRange {
    pub family: AddressFamily,
    /// Address portion, without the prefix.
    pub address: String,
    pub prefix: Option<u8>,
}

impl TunnelIpRange {
    pub fn v4(address: impl Into<String>, prefix: u8) -> Self {
        Self {
            family: AddressFamily::V4,
            address: address.into(),
            prefix: Some(prefix),
        }
    }

    pub fn v6(address: impl Into<String>, prefix: u8) -> Self {
        Self {
            family: AddressFamily::V6,
            address: address.into(),
            prefix: Some(prefix),
        }
    }
}

/// Everything the platform needs to build (or rebuild) the tunnel fd.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunFdData {
    /// Tunnel interface MTU; `None` leaves the platform default.
    pub mtu: Option<u16>,
    pub is_metered: bool,
    pub tunnel_ip_addresses: Vec<TunnelIpRange>,
    pub tunnel_dns_addresses: Vec<TunnelIpRange>,
}

impl TunFdData {
    /// The tunnel-local addresses, used to decide whether an existing
    /// tunnel can be reused after a network switch.
    pub fn tunnel_ips(&self) -> &[TunnelIpRange] {
        &self.tunnel_ip_addresses
    }
}

/// File descriptor handed out by the platform.
pub type TunnelFd = i32;

/// IPsec parameters the platform applies to a protected socket.
#[derive(Clone, Debug)]
pub struct IpsecConfig {
    pub uplink_spi: u32,
    pub downlink_spi: u32,
    pub network_fd: TunnelFd,
}

/// The platform VPN service.
///
/// `create_tunnel` with `force` true replaces an existing tunnel even
/// when its parameters are unchanged. Tunnel-create failures carrying
/// the revoked-permission detail are treated as permanent by the
/// session.
#[async_trait]
pub trait VpnService: Send + Sync {
    async fn create_tunnel(&self, tun_fd_data: TunFdData, force: bool) -> Result<(), Status>;

    /// Tear down the tunnel. With `force_fail_open` the platform must
    /// not leave a blocking tunnel behind.
    async fn close_tunnel(&self, force_fail_open: bool);

    fn is_tunnel_active(&self) -> bool;

    fn get_tunnel_fd(&self) -> Result<TunnelFd, Status>;

    /// Create a socket bound to `network`, protected from being routed
    /// back into the tunnel, optionally connected to `endpoint`.
    async fn create_protected_socket(
        &self,
        network: &NetworkInfo,
        endpoint: Option<&Endpoint>,
    ) -> Result<TunnelFd, Status>;

    /// Apply IPsec transform state to a protected socket.
    async fn configure_ipsec(&self, config: &IpsecConfig) -> Result<(), Status>;
}

/// OAuth and attestation collaborator.
#[async_trait]
pub trait OAuthTokenProvider: Send + Sync {
    async fn get_oauth_token(&self) -> Result<String, Status>;

    /// Produce platform attestation bound to the server nonce.
    async fn get_attestation_data(&self, nonce: &str) -> Result<Vec<u8>, Status>;

    /// Invalidate a token the backend rejected with 401.
    fn clear_oauth_token(&self, token: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_family_support() {
        assert!(AddressFamily::V4V6.supports_v4());
        assert!(AddressFamily::V4V6.supports_v6());
        assert!(AddressFamily::V4.supports_v4());
        assert!(!AddressFamily::V4.supports_v6());
        assert!(!AddressFamily::V6.supports_v4());
    }

    #[test]
    fn test_tunnel_ip_range_builders() {
        let v4 = TunnelIpRange::v4("10.2.2.123", 32);
        assert_eq!(v4.family, AddressFamily::V4);
        assert_eq!(v4.prefix, Some(32));

        let v6 = TunnelIpRange::v6("fec2:0001::3", 64);
        assert_eq!(v6.family, AddressFamily::V6);
    }
}
