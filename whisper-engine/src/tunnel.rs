//! Tunnel interface management
//!
//! Requests the virtual interface from the OS provider and hands its
//! descriptor over exactly once.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use whisper_tun::{TunHandle, TunProvider};

use crate::config::InterfaceConfig;
use crate::error::{Error, Result};
use crate::fault::contain;

/// Owns the interface request and the OS provider
pub struct TunInterfaceManager {
    provider: Arc<dyn TunProvider>,
    config: InterfaceConfig,
}

impl TunInterfaceManager {
    pub fn new(provider: Arc<dyn TunProvider>, config: InterfaceConfig) -> Self {
        Self { provider, config }
    }

    /// Interface MTU requested from the OS
    pub fn mtu(&self) -> u16 {
        self.config.mtu
    }

    /// Establish the interface
    ///
    /// A provider that declines (returns no handle) counts as a failure, as
    /// does any error or panic raised by the provider.
    pub async fn establish(&self) -> Result<TunHandle> {
        let excluded = current_app();
        let request = self
            .config
            .to_tun_config(excluded.as_deref())
            .map_err(|e| Error::InterfaceEstablishFailed(e.to_string()))?;

        log::info!(
            "Requesting interface: address={}, route={}, dns={}, mtu={}",
            self.config.address,
            self.config.route,
            self.config.dns,
            self.config.mtu
        );

        match contain(self.provider.establish(&request)).await {
            Ok(Some(handle)) => {
                log::info!("Interface {} established", handle.name());
                Ok(handle)
            }
            Ok(None) => Err(Error::InterfaceEstablishFailed(
                "the OS declined to create the interface".into(),
            )),
            Err(fault) => Err(Error::InterfaceEstablishFailed(fault.to_string())),
        }
    }

    /// Detach the descriptor for hand-off to the routing engine
    ///
    /// Fails with an already-detached error on the second call for a handle.
    pub fn detach(&self, handle: &mut TunHandle) -> Result<OwnedFd> {
        Ok(handle.detach_fd()?)
    }
}

/// Name of the running executable, excluded from the tunnel
fn current_app() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use whisper_tun::TunConfig;

    struct Declining;

    #[async_trait]
    impl TunProvider for Declining {
        async fn establish(&self, _config: &TunConfig) -> whisper_tun::Result<Option<TunHandle>> {
            Ok(None)
        }
    }

    struct NullProvider;

    #[async_trait]
    impl TunProvider for NullProvider {
        async fn establish(&self, config: &TunConfig) -> whisper_tun::Result<Option<TunHandle>> {
            assert!(!config.blocking);
            let file = std::fs::File::open("/dev/null")?;
            Ok(Some(TunHandle::new(OwnedFd::from(file), "null0", config.mtu)))
        }
    }

    #[tokio::test]
    async fn test_declined_is_failure() {
        let manager = TunInterfaceManager::new(Arc::new(Declining), InterfaceConfig::default());
        assert!(matches!(
            manager.establish().await,
            Err(Error::InterfaceEstablishFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_twice() {
        let manager = TunInterfaceManager::new(Arc::new(NullProvider), InterfaceConfig::default());
        let mut handle = manager.establish().await.unwrap();
        assert_eq!(handle.mtu(), 1500);

        let _fd = manager.detach(&mut handle).unwrap();
        let err = manager.detach(&mut handle).unwrap_err();
        assert!(err.is_already_detached());
    }
}
