//! Route management for tunnel interfaces
//!
//! [`Route`] is platform independent. [`RouteManager`] installs routes through
//! the `net-route` crate and is only built on Linux.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};

/// Convert an interface name to its index
#[cfg(target_os = "linux")]
fn get_interface_index(name: &str) -> Result<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::Route(format!(
            "interface '{}' not found (os error {})",
            name,
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        )));
    }

    Ok(index)
}

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for direct/interface routes)
    pub gateway: Option<IpAddr>,
    /// Interface name
    pub interface: Option<String>,
}

impl Route {
    /// Create a new IPv4 route
    pub fn ipv4(dest_addr: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Result<Self> {
        let destination = Ipv4Net::new(dest_addr, prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;

        Ok(Self {
            destination: IpNet::V4(destination),
            gateway: gateway.map(IpAddr::V4),
            interface: None,
        })
    }

    /// Create an interface route (no gateway, traffic goes directly to interface)
    pub fn interface_route(destination: IpNet, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: Some(interface.into()),
        }
    }

    /// Set the interface for this route
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Expand a route directive into the routes to install on `interface`
    ///
    /// A default route is split into two /1 routes so it takes precedence
    /// over the existing default route without replacing it.
    pub fn for_directive(network: Ipv4Net, interface: &str) -> Result<Vec<Route>> {
        if network.prefix_len() == 0 {
            return Ok(vec![
                Route::ipv4(Ipv4Addr::new(0, 0, 0, 0), 1, None)?.with_interface(interface),
                Route::ipv4(Ipv4Addr::new(128, 0, 0, 0), 1, None)?.with_interface(interface),
            ]);
        }
        Ok(vec![Route::interface_route(IpNet::V4(network.trunc()), interface)])
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Installs routes for a new interface
///
/// Uses the `net-route` crate. Requires root or `CAP_NET_ADMIN`.
#[cfg(target_os = "linux")]
pub struct RouteManager {
    handle: net_route::Handle,
}

#[cfg(target_os = "linux")]
impl RouteManager {
    /// Create a new route manager
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;

        Ok(Self { handle })
    }

    /// Add a route to the routing table
    pub async fn add(&self, route: &Route) -> Result<()> {
        let mut net_route =
            net_route::Route::new(route.destination.addr(), route.destination.prefix_len());

        if let Some(gw) = route.gateway {
            net_route = net_route.with_gateway(gw);
        }

        if let Some(ref iface) = route.interface {
            let ifindex = get_interface_index(iface)?;
            net_route = net_route.with_ifindex(ifindex);
        }

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
            }
            Err(e) => {
                let err_str = e.to_string();
                // EEXIST: an identical route is already installed
                if err_str.contains("File exists") || err_str.contains("os error 17") {
                    log::debug!("Route already exists: {}", route);
                } else {
                    return Err(Error::Route(format!("failed to add route {}: {}", route, e)));
                }
            }
        }

        Ok(())
    }
}
