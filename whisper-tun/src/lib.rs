//! Virtual network interface management for the whisper tunnel
//!
//! This crate owns everything the session manager needs from the operating
//! system's tun facility:
//!
//! - **Interface requests**: [`TunConfig`] describes the interface to establish
//!   (address, route directive, DNS server, MTU, blocking mode, excluded apps)
//! - **Handles**: [`TunHandle`] owns the interface descriptor and hands it off
//!   exactly once through [`TunHandle::detach_fd`]
//! - **Providers**: [`TunProvider`] is the seam to the OS; [`platform_provider`]
//!   returns the implementation for the current platform
//! - **Routes**: [`Route`] and (on Linux) `RouteManager` install the route
//!   directive for the new interface
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! Other platforms get a provider that refuses every request with
//! [`Error::NotSupported`]; the rest of the crate is platform independent.
//!
//! # Example
//!
//! ```ignore
//! use whisper_tun::{platform_provider, TunConfig};
//!
//! let config = TunConfig::builder()
//!     .name("whisper")
//!     .address("10.0.0.2".parse()?, 24)
//!     .route("0.0.0.0/0".parse()?)
//!     .dns_server("10.0.0.144".parse()?)
//!     .mtu(1500)
//!     .build()?;
//!
//! let provider = platform_provider();
//! if let Some(mut handle) = provider.establish(&config).await? {
//!     let fd = handle.detach_fd()?;
//!     // `fd` now belongs to the packet-routing engine
//! }
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod provider;
pub mod route;

#[cfg(target_os = "linux")]
pub mod linux;

pub use config::{TunConfig, TunConfigBuilder};
pub use error::{Error, Result};
pub use handle::TunHandle;
pub use provider::{platform_provider, TunProvider, UnsupportedProvider};
pub use route::Route;

#[cfg(target_os = "linux")]
pub use linux::LinuxTunProvider;
#[cfg(target_os = "linux")]
pub use route::RouteManager;

/// Default MTU for tunnel interfaces
pub const DEFAULT_MTU: u16 = 1500;

/// Smallest MTU an IPv4 host is required to accept
pub const MIN_MTU: u16 = 576;
