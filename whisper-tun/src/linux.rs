//! Linux tunnel interface provider
//!
//! Creates the tun device with `tun-rs`, duplicates its descriptor into a
//! [`TunHandle`], applies the blocking mode and installs the route
//! directives. The interface lives as long as some copy of the descriptor is
//! open, so routes bound to it vanish together with it.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;

use crate::config::TunConfig;
use crate::error::{Error, Result};
use crate::handle::TunHandle;
use crate::provider::TunProvider;
use crate::route::{Route, RouteManager};

/// Interface provider backed by `/dev/net/tun`
#[derive(Debug, Default)]
pub struct LinuxTunProvider;

impl LinuxTunProvider {
    /// Create a new provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TunProvider for LinuxTunProvider {
    async fn establish(&self, config: &TunConfig) -> Result<Option<TunHandle>> {
        config.validate()?;
        let ipv4 = config
            .ipv4
            .as_ref()
            .ok_or_else(|| Error::Config("an IPv4 address must be configured".into()))?;

        let mut builder = tun_rs::DeviceBuilder::new();
        if let Some(ref name) = config.name {
            builder = builder.name(name);
        }
        builder = builder
            .ipv4(ipv4.address, ipv4.prefix_len, None)
            .mtu(config.mtu);

        let device = builder.build_sync().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(e.to_string())
            } else {
                Error::DeviceCreation(e.to_string())
            }
        })?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        // The device closes its own descriptor on drop; keep a private copy
        let fd = duplicate(device.as_raw_fd())?;
        drop(device);

        set_nonblocking(fd.as_raw_fd(), !config.blocking)?;

        log::info!(
            "Created tun interface {} ({}/{}, MTU {})",
            name,
            ipv4.address,
            ipv4.prefix_len,
            config.mtu
        );

        let manager = RouteManager::new()?;
        for directive in &config.routes {
            for route in Route::for_directive(*directive, &name)? {
                manager.add(&route).await?;
            }
        }

        for dns in &config.dns_servers {
            log::info!(
                "DNS server {} announced for {}; point the system resolver at it to use it",
                dns,
                name
            );
        }

        for app in &config.excluded_apps {
            log::warn!(
                "Per-application exclusion is not supported on Linux; traffic from '{}' is not excluded",
                app
            );
        }

        Ok(Some(TunHandle::new(fd, name, config.mtu)))
    }
}

fn duplicate(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: `fd` is a valid descriptor owned by the live tun device
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: `dup` was just returned by fcntl and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Set or clear `O_NONBLOCK` on a descriptor
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    // SAFETY: F_GETFL/F_SETFL only touch the status flags of `fd`
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
