//! Local port reservation for the proxy bridge

use std::net::{Ipv4Addr, TcpListener};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Source of a free local TCP port
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Reserve one currently unused port on the loopback interface
    async fn reserve(&self) -> Result<u16>;
}

/// Lets the OS pick an ephemeral port
///
/// Binds a listener on port 0, reads the assigned port and closes the
/// listener again so the bridge can bind it. Another process may grab the
/// port in between; a later bridge start failure covers that case.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralPortAllocator;

#[async_trait]
impl PortAllocator for EphemeralPortAllocator {
    async fn reserve(&self) -> Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|e| Error::PortUnavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::PortUnavailable(e.to_string()))?
            .port();
        drop(listener);

        log::debug!("Reserved local port {}", port);
        Ok(port)
    }
}
