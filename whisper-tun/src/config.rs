//! Tunnel interface request configuration

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::{Error, Result};
use crate::{DEFAULT_MTU, MIN_MTU};

/// IPv4 address configuration for a tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    /// The IPv4 address to assign to the interface
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
}

impl Ipv4Config {
    /// Create a new IPv4 configuration
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Get the network mask as an Ipv4Addr
    pub fn netmask(&self) -> Ipv4Addr {
        if self.prefix_len == 0 {
            return Ipv4Addr::new(0, 0, 0, 0);
        }
        if self.prefix_len >= 32 {
            return Ipv4Addr::new(255, 255, 255, 255);
        }
        let mask = !((1u32 << (32 - self.prefix_len)) - 1);
        Ipv4Addr::from(mask)
    }

    /// Get the network address
    pub fn network(&self) -> Ipv4Addr {
        let addr: u32 = self.address.into();
        let mask: u32 = self.netmask().into();
        Ipv4Addr::from(addr & mask)
    }
}

/// Everything the OS needs to establish a tunnel interface
///
/// Mirrors what a mobile VPN builder takes: one local address, the route
/// directives to send into the tunnel, DNS servers, MTU, blocking mode and
/// the applications whose traffic must bypass the tunnel.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (None for system-assigned)
    pub name: Option<String>,
    /// Local IPv4 address and subnet size
    pub ipv4: Option<Ipv4Config>,
    /// Networks routed into the interface
    pub routes: Vec<Ipv4Net>,
    /// DNS servers announced for the interface
    pub dns_servers: Vec<IpAddr>,
    /// Maximum transmission unit
    pub mtu: u16,
    /// Whether reads on the descriptor block
    pub blocking: bool,
    /// Applications excluded from the tunnel
    pub excluded_apps: Vec<String>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            ipv4: None,
            routes: Vec::new(),
            dns_servers: Vec::new(),
            mtu: DEFAULT_MTU,
            blocking: false,
            excluded_apps: Vec::new(),
        }
    }
}

impl TunConfig {
    /// Create a new configuration builder
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let ipv4 = self
            .ipv4
            .as_ref()
            .ok_or_else(|| Error::Config("an IPv4 address must be configured".into()))?;

        if ipv4.prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                ipv4.prefix_len
            )));
        }

        if self.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, MIN_MTU
            )));
        }

        if let Some(ref name) = self.name {
            if name.is_empty() || name.len() >= 16 {
                return Err(Error::Config(format!("invalid interface name '{}'", name)));
            }
        }

        Ok(())
    }

    /// Whether any route directive covers the whole IPv4 space
    pub fn routes_all_traffic(&self) -> bool {
        self.routes.iter().any(|net| net.prefix_len() == 0)
    }
}

/// Builder for TunConfig
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    config: TunConfig,
}

impl TunConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the local address and prefix length
    pub fn address(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Set the local address from CIDR notation (e.g., "10.0.0.2/24")
    pub fn address_cidr(self, cidr: &str) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| Error::InvalidAddress(cidr.to_string()))?;
        Ok(self.address(net.addr(), net.prefix_len()))
    }

    /// Add a route directive
    pub fn route(mut self, network: Ipv4Net) -> Self {
        self.config.routes.push(network);
        self
    }

    /// Add a route directive from CIDR notation (e.g., "0.0.0.0/0")
    pub fn route_cidr(self, cidr: &str) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| Error::InvalidPrefix(cidr.to_string()))?;
        Ok(self.route(net))
    }

    /// Add a DNS server
    pub fn dns_server(mut self, server: IpAddr) -> Self {
        self.config.dns_servers.push(server);
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set blocking mode for the interface descriptor
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.config.blocking = blocking;
        self
    }

    /// Exclude an application from the tunnel
    pub fn exclude_app(mut self, app: impl Into<String>) -> Self {
        self.config.excluded_apps.push(app.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
