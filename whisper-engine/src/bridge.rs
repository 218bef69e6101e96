//! Proxy bridge control
//!
//! The bridge speaks the remote tunneling protocol and exposes a SOCKS proxy
//! on `127.0.0.1:port`. [`ProxyBridge`] is the collaborator boundary,
//! [`BridgeController`] the adapter the session uses, and [`ProcessBridge`]
//! the default collaborator that runs the bridge as a child process.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::fault::{contain, Fault};
use crate::router::stop_child;

/// Interval between readiness probes of a starting bridge
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A local SOCKS bridge to a remote tunnel endpoint
#[async_trait]
pub trait ProxyBridge: Send + Sync {
    /// Start the bridge; on success it listens on `127.0.0.1:port`
    async fn start(&self, remote_url: &str, port: u16, resolver_url: &str) -> Result<()>;

    /// Stop the bridge
    async fn stop(&self) -> Result<()>;
}

/// Adapter normalizing every bridge failure into [`Error::BridgeStartFailed`]
pub struct BridgeController {
    bridge: Arc<dyn ProxyBridge>,
}

impl BridgeController {
    pub fn new(bridge: Arc<dyn ProxyBridge>) -> Self {
        Self { bridge }
    }

    /// Start the bridge for one session
    pub async fn start(&self, remote_url: &str, port: u16, resolver_url: &str) -> Result<()> {
        log::info!(
            "Starting bridge: remote={}, listen=127.0.0.1:{}, resolver={}",
            remote_url,
            port,
            resolver_url
        );

        contain(self.bridge.start(remote_url, port, resolver_url))
            .await
            .map_err(|fault| match fault {
                Fault::Error(Error::BridgeStartFailed(message)) => {
                    Error::BridgeStartFailed(message)
                }
                other => Error::BridgeStartFailed(other.to_string()),
            })
    }

    /// Stop the bridge; failures are logged
    pub async fn stop(&self) {
        match contain(self.bridge.stop()).await {
            Ok(()) => log::info!("Bridge stopped"),
            Err(fault) => log::warn!("Failed to stop bridge: {}", fault),
        }
    }
}

/// Runs the bridge executable as a child process
pub struct ProcessBridge {
    config: BridgeConfig,
    child: Mutex<Option<Child>>,
}

impl ProcessBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    async fn wait_ready(child: &mut Child, port: u16) -> Result<()> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(Error::BridgeStartFailed(format!(
                    "bridge exited during startup ({})",
                    status
                )));
            }

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProxyBridge for ProcessBridge {
    async fn start(&self, remote_url: &str, port: u16, resolver_url: &str) -> Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(Error::BridgeStartFailed("service is already running".into()));
            }
        }

        let args = self.config.render_args(remote_url, port, resolver_url);
        log::debug!("Spawning bridge: {} {}", self.config.command, args.join(" "));

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::BridgeStartFailed(format!(
                    "failed to launch '{}': {}",
                    self.config.command, e
                ))
            })?;

        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        let ready = match tokio::time::timeout(timeout, Self::wait_ready(&mut child, port)).await {
            Ok(result) => result,
            Err(_) => Err(Error::BridgeStartFailed(format!(
                "bridge did not accept connections on port {} within {:?}",
                port, timeout
            ))),
        };

        if let Err(e) = ready {
            if let Err(kill_err) = child.kill().await {
                log::debug!("Failed to kill half-started bridge: {}", kill_err);
            }
            return Err(e);
        }

        log::info!("Bridge listening on 127.0.0.1:{}", port);
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            log::debug!("Bridge not running");
            return Ok(());
        };

        stop_child(&mut child, "Bridge").await
    }
}
