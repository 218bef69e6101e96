//! OS virtual-interface providers

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TunConfig;
use crate::error::{Error, Result};
use crate::handle::TunHandle;

/// Source of tunnel interfaces
///
/// `establish` returns `Ok(None)` when the OS declines to hand out an
/// interface without reporting an error (for example when the user has not
/// granted VPN permission).
#[async_trait]
pub trait TunProvider: Send + Sync {
    /// Request a new interface described by `config`
    async fn establish(&self, config: &TunConfig) -> Result<Option<TunHandle>>;
}

/// Provider for platforms without tun support in this crate
#[derive(Debug, Default)]
pub struct UnsupportedProvider;

#[async_trait]
impl TunProvider for UnsupportedProvider {
    async fn establish(&self, _config: &TunConfig) -> Result<Option<TunHandle>> {
        Err(Error::NotSupported(format!(
            "tunnel interfaces are not supported on {}",
            std::env::consts::OS
        )))
    }
}

/// Get the provider for the current platform
pub fn platform_provider() -> Arc<dyn TunProvider> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(crate::linux::LinuxTunProvider::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedProvider)
    }
}
