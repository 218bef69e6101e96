//! Packet-routing engine control
//!
//! The routing engine reads packets from the tunnel interface and relays
//! them through the bridge's SOCKS endpoint. It is configured with an
//! [`EngineKey`] built fresh for every session; the key owns the interface
//! descriptor until the engine process inherits it.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fault::{contain, Fault};

/// Immutable routing engine configuration for one session
///
/// The descriptor is closed once the last clone of the key is dropped.
#[derive(Debug, Clone)]
pub struct EngineKey {
    device: Arc<OwnedFd>,
    mark: u32,
    mtu: u16,
    interface: String,
    log_level: String,
    proxy: String,
    rest_api: String,
    tcp_send_buffer_size: String,
    tcp_receive_buffer_size: String,
    tcp_moderate_receive_buffer: bool,
}

impl EngineKey {
    /// Build the key for a detached interface descriptor and a proxy port
    pub fn new(device: OwnedFd, mtu: u16, proxy_port: u16, config: &EngineConfig) -> Self {
        Self {
            device: Arc::new(device),
            mark: config.mark,
            mtu,
            interface: config.interface.clone(),
            log_level: config.log_level.clone(),
            proxy: format!("socks5://127.0.0.1:{}", proxy_port),
            rest_api: config.rest_api.clone().unwrap_or_default(),
            tcp_send_buffer_size: config.tcp_send_buffer_size.clone().unwrap_or_default(),
            tcp_receive_buffer_size: config.tcp_receive_buffer_size.clone().unwrap_or_default(),
            tcp_moderate_receive_buffer: config.tcp_moderate_receive_buffer,
        }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Interface source, `fd://<descriptor>`
    pub fn device(&self) -> String {
        format!("fd://{}", self.fd())
    }

    /// Outbound interface name, empty for the default
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Proxy address, `socks5://127.0.0.1:<port>`
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn rest_api(&self) -> &str {
        &self.rest_api
    }

    pub fn tcp_send_buffer_size(&self) -> &str {
        &self.tcp_send_buffer_size
    }

    pub fn tcp_receive_buffer_size(&self) -> &str {
        &self.tcp_receive_buffer_size
    }

    pub fn tcp_moderate_receive_buffer(&self) -> bool {
        self.tcp_moderate_receive_buffer
    }

    /// Descriptor named by the device source
    pub fn fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }

    /// Command-line form understood by tun2socks
    ///
    /// Unset values are omitted so the engine applies its own defaults.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-device".to_string(),
            self.device(),
            "-proxy".to_string(),
            self.proxy.clone(),
            "-mtu".to_string(),
            self.mtu.to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
        ];

        if self.mark != 0 {
            args.push("-fwmark".into());
            args.push(self.mark.to_string());
        }

        let optional = [
            ("-interface", &self.interface),
            ("-restapi", &self.rest_api),
            ("-tcp-sndbuf", &self.tcp_send_buffer_size),
            ("-tcp-rcvbuf", &self.tcp_receive_buffer_size),
        ];
        for (flag, value) in optional {
            if !value.is_empty() {
                args.push(flag.into());
                args.push(value.clone());
            }
        }

        if self.tcp_moderate_receive_buffer {
            args.push("-tcp-auto-tuning".into());
        }

        args
    }
}

/// A user-space packet-routing engine
#[async_trait]
pub trait RoutingEngine: Send + Sync {
    /// Install the configuration for the next start
    async fn insert(&self, key: EngineKey) -> Result<()>;

    /// Start routing; ownership of the key's descriptor passes to the engine
    async fn start(&self) -> Result<()>;

    /// Stop routing; a no-op when never started
    async fn stop(&self) -> Result<()>;
}

/// Adapter over the routing engine collaborator
///
/// Start and stop are serialized: a stop waits for an in-progress start, and
/// a start that arrives after the session's stop does nothing.
pub struct EngineAdapter {
    engine: Arc<dyn RoutingEngine>,
    /// Set by insert, cleared by stop
    armed: Mutex<bool>,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn RoutingEngine>) -> Self {
        Self {
            engine,
            armed: Mutex::new(false),
        }
    }

    /// Hand the session's configuration to the engine
    pub async fn insert(&self, key: EngineKey) -> Result<()> {
        log::info!(
            "Configuring routing engine: device={}, proxy={}, mtu={}",
            key.device(),
            key.proxy(),
            key.mtu()
        );

        let mut armed = self.armed.lock().await;
        contain(self.engine.insert(key))
            .await
            .map_err(normalize_start_fault)?;
        *armed = true;
        Ok(())
    }

    /// Start the engine with the inserted configuration
    ///
    /// Runs as a background task; the result only feeds logs and events.
    pub async fn start(&self) -> Result<()> {
        let armed = self.armed.lock().await;
        if !*armed {
            log::info!("Routing engine start skipped: session already stopped");
            return Ok(());
        }

        contain(self.engine.start())
            .await
            .map_err(normalize_start_fault)?;
        drop(armed);

        log::info!("Routing engine started");
        Ok(())
    }

    /// Stop the engine once per inserted configuration; failures are logged
    pub async fn stop(&self) {
        let mut armed = self.armed.lock().await;
        if !std::mem::replace(&mut *armed, false) {
            log::debug!("Routing engine already stopped");
            return;
        }

        match contain(self.engine.stop()).await {
            Ok(()) => log::info!("Routing engine stopped"),
            Err(fault) => log::warn!("Failed to stop routing engine: {}", fault),
        }
    }
}

fn normalize_start_fault(fault: Fault<Error>) -> Error {
    match fault {
        Fault::Error(Error::EngineStartFailed(message)) => Error::EngineStartFailed(message),
        other => Error::EngineStartFailed(other.to_string()),
    }
}

struct RunningEngine {
    child: Child,
    _key: EngineKey,
}

/// Runs a tun2socks-compatible executable on the handed-off descriptor
pub struct ProcessEngine {
    command: String,
    pending: Mutex<Option<EngineKey>>,
    running: Mutex<Option<RunningEngine>>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            pending: Mutex::new(None),
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RoutingEngine for ProcessEngine {
    async fn insert(&self, key: EngineKey) -> Result<()> {
        if self.pending.lock().await.replace(key).is_some() {
            log::debug!("Replaced a configuration that was never started");
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::EngineStartFailed("engine is already running".into()));
        }

        let key = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::EngineStartFailed("no configuration inserted".into()))?;
        let raw = key.fd();

        let args = key.to_args();
        log::debug!("Spawning routing engine: {} {}", self.command, args.join(" "));

        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // SAFETY: only async-signal-safe fcntl runs between fork and exec
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(raw, libc::F_SETFD, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            Error::EngineStartFailed(format!("failed to launch '{}': {}", self.command, e))
        })?;

        log::info!(
            "Routing engine running (pid {})",
            child.id().map(|id| id.to_string()).unwrap_or_else(|| "?".into())
        );
        *running = Some(RunningEngine { child, _key: key });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.pending.lock().await.take().is_some() {
            log::debug!("Dropped a configuration that was never started");
        }

        let Some(mut engine) = self.running.lock().await.take() else {
            log::debug!("Routing engine not running");
            return Ok(());
        };

        stop_child(&mut engine.child, "Routing engine").await
    }
}

/// Kill a child process unless it already exited
pub(crate) async fn stop_child(child: &mut Child, what: &str) -> Result<()> {
    if let Some(status) = child.try_wait()? {
        log::info!("{} had already exited ({})", what, status);
        return Ok(());
    }
    child.kill().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn null_fd() -> OwnedFd {
        OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
    }

    /// A descriptor plus the peer that sees EOF once it is closed
    fn watched_fd() -> (OwnedFd, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        peer.set_nonblocking(true).unwrap();
        (OwnedFd::from(ours), peer)
    }

    fn closed(peer: &mut UnixStream) -> bool {
        matches!(peer.read(&mut [0u8; 1]), Ok(0))
    }

    #[test]
    fn test_key_defaults() {
        let device = null_fd();
        let raw = device.as_raw_fd();
        let key = EngineKey::new(device, 1500, 51820, &EngineConfig::default());

        assert_eq!(key.mark(), 0);
        assert_eq!(key.mtu(), 1500);
        assert_eq!(key.device(), format!("fd://{}", raw));
        assert_eq!(key.fd(), raw);
        assert_eq!(key.interface(), "");
        assert_eq!(key.log_level(), "debug");
        assert_eq!(key.proxy(), "socks5://127.0.0.1:51820");
        assert_eq!(key.rest_api(), "");
        assert_eq!(key.tcp_send_buffer_size(), "");
        assert_eq!(key.tcp_receive_buffer_size(), "");
        assert!(!key.tcp_moderate_receive_buffer());
    }

    #[test]
    fn test_key_args() {
        let config = EngineConfig {
            mark: 7,
            interface: "eth0".into(),
            tcp_send_buffer_size: Some("1m".into()),
            tcp_moderate_receive_buffer: true,
            ..Default::default()
        };
        let key = EngineKey::new(null_fd(), 1400, 1080, &config);
        let args = key.to_args();

        let joined = args.join(" ");
        let prefix = format!("-device fd://{} -proxy socks5://127.0.0.1:1080 -mtu 1400", key.fd());
        assert!(joined.starts_with(&prefix));
        assert!(joined.contains("-fwmark 7"));
        assert!(joined.contains("-interface eth0"));
        assert!(joined.contains("-tcp-sndbuf 1m"));
        assert!(!joined.contains("-tcp-rcvbuf"));
        assert!(!joined.contains("-restapi"));
        assert!(joined.ends_with("-tcp-auto-tuning"));
    }

    #[test]
    fn test_dropping_key_closes_descriptor() {
        let (device, mut peer) = watched_fd();
        let key = EngineKey::new(device, 1500, 1080, &EngineConfig::default());
        let copy = key.clone();

        drop(key);
        assert!(!closed(&mut peer));
        drop(copy);
        assert!(closed(&mut peer));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let engine = ProcessEngine::new("tun2socks");
        assert!(engine.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_without_key_fails() {
        let engine = ProcessEngine::new("tun2socks");
        assert!(matches!(
            engine.start().await,
            Err(Error::EngineStartFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_pending_descriptor() {
        let engine = ProcessEngine::new("tun2socks");
        let (device, mut peer) = watched_fd();
        let key = EngineKey::new(device, 1500, 1080, &EngineConfig::default());

        engine.insert(key).await.unwrap();
        assert!(!closed(&mut peer));
        engine.stop().await.unwrap();
        assert!(closed(&mut peer));
    }

    #[tokio::test]
    async fn test_start_and_stop_process() {
        let engine = ProcessEngine::new("sleep");
        // `sleep` treats the flags as invalid and exits; start only reports the spawn
        let key = EngineKey::new(null_fd(), 1500, 1080, &EngineConfig::default());
        engine.insert(key).await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_adapter_normalizes_missing_executable() {
        let adapter = EngineAdapter::new(Arc::new(ProcessEngine::new("/nonexistent/tun2socks")));
        let key = EngineKey::new(null_fd(), 1500, 1080, &EngineConfig::default());

        adapter.insert(key).await.unwrap();
        let err = adapter.start().await.unwrap_err();
        assert!(matches!(err, Error::EngineStartFailed(_)));
        adapter.stop().await;
    }

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl RoutingEngine for Counting {
        async fn insert(&self, _key: EngineKey) -> Result<()> {
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_adapter_stop_waits_for_start() {
        let engine = Arc::new(Counting::default());
        let adapter = Arc::new(EngineAdapter::new(engine.clone()));
        let key = EngineKey::new(null_fd(), 1500, 1080, &EngineConfig::default());
        adapter.insert(key).await.unwrap();

        let starting = adapter.clone();
        let start = tokio::spawn(async move { starting.start().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        adapter.stop().await;
        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        start.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_adapter_start_after_stop_is_noop() {
        let engine = Arc::new(Counting::default());
        let adapter = EngineAdapter::new(engine.clone());
        let key = EngineKey::new(null_fd(), 1500, 1080, &EngineConfig::default());
        adapter.insert(key).await.unwrap();

        adapter.stop().await;
        adapter.stop().await;
        adapter.start().await.unwrap();

        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }
}
