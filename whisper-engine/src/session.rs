//! Tunnel session lifecycle
//!
//! [`SessionManager`] turns a connect request into a running session made of
//! a proxy bridge, a tunnel interface and a routing engine, and tears all
//! three down again exactly once.
//!
//! ```text
//!            connect                 setup ok
//!   Idle ─────────────▶ Starting ─────────────▶ Running
//!    ▲                     │                       │ disconnect / revoke / exit
//!    │    setup failed     │                       ▼
//!    ├─────────────────────┘                   Stopping
//!    │                                             │
//!    └─────────────────────────────────────────────┘
//!                      teardown finished
//! ```
//!
//! A disconnect that arrives while the session is Starting waits until
//! setup has either failed (nothing left to do) or reached Running.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use whisper_tun::{TunHandle, TunProvider};

use crate::bridge::{BridgeController, ProcessBridge, ProxyBridge};
use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::event::{EventHandler, LoggingEventHandler, SessionEvent, SessionState, StopReason};
use crate::fault::{contain, Fault};
use crate::pool::WorkerPool;
use crate::port::{EphemeralPortAllocator, PortAllocator};
use crate::router::{EngineAdapter, EngineKey, ProcessEngine, RoutingEngine};
use crate::shutdown::{lock, SharedRecord, ShutdownCoordinator};
use crate::tunnel::TunInterfaceManager;
use crate::url::{normalize_remote_url, normalize_resolver_url};

/// The single mutable session record
pub(crate) struct SessionRecord {
    pub(crate) state: SessionState,
    state_tx: watch::Sender<SessionState>,
    pub(crate) handle: Option<TunHandle>,
    pub(crate) pool: Option<Arc<WorkerPool>>,
    pub(crate) proxy_port: Option<u16>,
    pub(crate) remote_url: Option<String>,
    pub(crate) resolver_url: Option<String>,
    pub(crate) tun_name: Option<String>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) last_error: Option<String>,
    pub(crate) shutting_down: bool,
    /// Incremented for every accepted connect
    pub(crate) epoch: u64,
}

impl SessionRecord {
    fn new(state_tx: watch::Sender<SessionState>) -> Self {
        Self {
            state: SessionState::Idle,
            state_tx,
            handle: None,
            pool: None,
            proxy_port: None,
            remote_url: None,
            resolver_url: None,
            tun_name: None,
            started_at: None,
            last_error: None,
            shutting_down: false,
            epoch: 0,
        }
    }

    /// Change state and publish it to subscribers, returning the old state
    pub(crate) fn set_state(&mut self, new: SessionState) -> SessionState {
        let old = std::mem::replace(&mut self.state, new);
        self.state_tx.send_replace(new);
        old
    }

    /// Drop everything that belongs to the finished session
    fn reset(&mut self) -> SessionState {
        self.handle = None;
        self.pool = None;
        self.proxy_port = None;
        self.remote_url = None;
        self.resolver_url = None;
        self.tun_name = None;
        self.started_at = None;
        self.shutting_down = false;
        self.set_state(SessionState::Idle)
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub remote_url: Option<String>,
    pub resolver_url: Option<String>,
    pub proxy_port: Option<u16>,
    pub tun_name: Option<String>,
    pub uptime: Option<Duration>,
    pub last_error: Option<String>,
    pub shutting_down: bool,
}

/// Tunnel session lifecycle manager
///
/// Constructed once per process with its collaborators injected; all
/// lifecycle operations go through it. At most one session exists at a time.
pub struct SessionManager {
    record: SharedRecord,
    state_rx: watch::Receiver<SessionState>,
    ports: Arc<dyn PortAllocator>,
    bridge: Arc<BridgeController>,
    tunnel: Arc<TunInterfaceManager>,
    engine: Arc<EngineAdapter>,
    coordinator: ShutdownCoordinator,
    engine_config: EngineConfig,
    workers: usize,
    event_handler: Arc<dyn EventHandler>,
    interrupt: Notify,
}

impl SessionManager {
    /// Create a session manager with the given collaborators
    pub fn new(
        config: &Config,
        ports: Arc<dyn PortAllocator>,
        bridge: Arc<dyn ProxyBridge>,
        provider: Arc<dyn TunProvider>,
        engine: Arc<dyn RoutingEngine>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let bridge = Arc::new(BridgeController::new(bridge));
        let tunnel = Arc::new(TunInterfaceManager::new(provider, config.interface.clone()));
        let engine = Arc::new(EngineAdapter::new(engine));

        let coordinator = ShutdownCoordinator::new(
            tunnel.clone(),
            engine.clone(),
            bridge.clone(),
            Duration::from_millis(config.shutdown.grace_ms),
            Duration::from_millis(config.shutdown.force_ms),
        );

        Self {
            record: Arc::new(Mutex::new(SessionRecord::new(state_tx))),
            state_rx,
            ports,
            bridge,
            tunnel,
            engine,
            coordinator,
            engine_config: config.engine.clone(),
            workers: config.shutdown.workers,
            event_handler: Arc::new(LoggingEventHandler),
            interrupt: Notify::new(),
        }
    }

    /// Create a session manager with the process-backed collaborators
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(EphemeralPortAllocator),
            Arc::new(ProcessBridge::new(config.bridge.clone())),
            whisper_tun::platform_provider(),
            Arc::new(ProcessEngine::new(config.engine.command.clone())),
        )
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        lock(&self.record).state
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Get a snapshot of the session
    pub fn status(&self) -> SessionStatus {
        let record = lock(&self.record);
        SessionStatus {
            state: record.state,
            remote_url: record.remote_url.clone(),
            resolver_url: record.resolver_url.clone(),
            proxy_port: record.proxy_port,
            tun_name: record.tun_name.clone(),
            uptime: record.started_at.map(|t| t.elapsed()),
            last_error: record.last_error.clone(),
            shutting_down: record.shutting_down,
        }
    }

    /// Start a session
    ///
    /// Both URLs are normalized first; blank values select the built-in
    /// defaults. Rejected with [`Error::AlreadyRunning`] unless Idle.
    pub async fn connect(&self, remote_url: &str, resolver_url: &str) -> Result<()> {
        let remote_url = normalize_remote_url(remote_url);
        let resolver_url = normalize_resolver_url(resolver_url);

        {
            let mut record = lock(&self.record);
            if record.state != SessionState::Idle {
                log::warn!("Connect rejected: session is {}", record.state);
                return Err(Error::AlreadyRunning);
            }
            record.epoch += 1;
            record.remote_url = Some(remote_url.clone());
            record.resolver_url = Some(resolver_url.clone());
            record.last_error = None;
            record.set_state(SessionState::Starting);
        }
        self.state_changed(SessionState::Idle, SessionState::Starting)
            .await;

        match self.setup(&remote_url, &resolver_url).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn setup(&self, remote_url: &str, resolver_url: &str) -> Result<()> {
        let port = contain(self.ports.reserve())
            .await
            .map_err(|fault| match fault {
                Fault::Error(Error::PortUnavailable(message)) => Error::PortUnavailable(message),
                other => Error::PortUnavailable(other.to_string()),
            })?;
        lock(&self.record).proxy_port = Some(port);

        self.bridge.start(remote_url, port, resolver_url).await?;

        let mut handle = match self.tunnel.establish().await {
            Ok(handle) => handle,
            Err(e) => {
                self.bridge.stop().await;
                return Err(e);
            }
        };

        let fd = match self.tunnel.detach(&mut handle) {
            Ok(fd) => fd,
            Err(e) => {
                self.bridge.stop().await;
                return Err(Error::InterfaceEstablishFailed(e.to_string()));
            }
        };

        let key = EngineKey::new(fd, handle.mtu(), port, &self.engine_config);
        if let Err(e) = self.engine.insert(key).await {
            self.bridge.stop().await;
            return Err(e);
        }

        let tun_name = handle.name().to_string();
        let pool = Arc::new(WorkerPool::new(self.workers));
        let epoch = {
            let mut record = lock(&self.record);
            record.handle = Some(handle);
            record.pool = Some(pool.clone());
            record.tun_name = Some(tun_name.clone());
            record.epoch
        };

        let engine = self.engine.clone();
        let events = self.event_handler.clone();
        let record = self.record.clone();
        pool.spawn(async move {
            let Err(e) = engine.start().await else {
                return;
            };
            log::error!("{}", e);
            {
                let mut record = lock(&record);
                if record.epoch != epoch {
                    return;
                }
                record.last_error = Some(e.to_string());
            }
            events
                .on_event(SessionEvent::EngineFailed {
                    message: e.to_string(),
                })
                .await;
        });

        {
            let mut record = lock(&self.record);
            record.started_at = Some(Instant::now());
            record.set_state(SessionState::Running);
        }
        self.state_changed(SessionState::Starting, SessionState::Running)
            .await;

        self.event_handler
            .on_event(SessionEvent::Connected {
                remote_url: remote_url.to_string(),
                proxy_port: port,
                interface: tun_name,
            })
            .await;
        Ok(())
    }

    /// Unwind a failed connect back to Idle
    async fn abort(&self, error: &Error) {
        log::error!("Connect failed: {}", error);
        let old = {
            let mut record = lock(&self.record);
            record.last_error = Some(error.to_string());
            record.reset()
        };
        self.state_changed(old, SessionState::Idle).await;
        self.event_handler
            .on_event(SessionEvent::Error {
                message: error.to_string(),
            })
            .await;
    }

    /// Stop the session on explicit request
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(StopReason::Requested).await
    }

    /// Stop the session because the OS revoked the interface
    pub async fn revoke(&self) -> Result<()> {
        self.disconnect_with(StopReason::Revoked).await
    }

    /// Stop the session
    ///
    /// A no-op when Idle or when another teardown is in flight. Returns
    /// [`Error::TeardownInterrupted`] if [`interrupt_teardown`] cut the
    /// teardown short; the session is back in Idle either way.
    ///
    /// [`interrupt_teardown`]: SessionManager::interrupt_teardown
    pub async fn disconnect_with(&self, reason: StopReason) -> Result<()> {
        let mut state_rx = self.subscribe();
        loop {
            match self.state() {
                SessionState::Idle => {
                    log::debug!("Disconnect ignored: no session");
                    return Ok(());
                }
                SessionState::Starting => {
                    log::info!("Disconnect queued until setup finishes");
                    if state_rx
                        .wait_for(|state| *state != SessionState::Starting)
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                SessionState::Running | SessionState::Stopping => break,
            }
        }

        let interrupt = self.interrupt.notified();
        let Some(teardown) = self.coordinator.begin(&self.record) else {
            log::debug!("Disconnect ignored: teardown already in progress");
            return Ok(());
        };
        log::info!("Stopping session: {}", reason);
        self.state_changed(teardown.previous, SessionState::Stopping)
            .await;

        let result = self.coordinator.finish(teardown, interrupt).await;

        let old = lock(&self.record).reset();
        self.state_changed(old, SessionState::Idle).await;
        self.event_handler
            .on_event(SessionEvent::Disconnected { reason })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Session stopped without a complete teardown: {}", e);
                Err(e)
            }
        }
    }

    /// Cancel an in-flight teardown wait
    pub fn interrupt_teardown(&self) {
        self.interrupt.notify_waiters();
    }

    async fn state_changed(&self, old: SessionState, new: SessionState) {
        if old != new {
            self.event_handler
                .on_event(SessionEvent::StateChanged { old, new })
                .await;
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let record = lock(&self.record);
        if record.state.is_active() {
            log::warn!("Session manager dropped while {}", record.state);
        }
    }
}
