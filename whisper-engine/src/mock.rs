//! Mock collaborators for testing
//!
//! Recording, fault-injecting stand-ins for the port allocator, the proxy
//! bridge, the OS interface provider and the routing engine. They let the
//! session lifecycle run without privileges, child processes or network
//! access, and expose call counts for assertions.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use whisper_engine::mock::*;
//! use whisper_engine::{Config, SessionManager};
//!
//! async fn example() {
//!     let bridge = Arc::new(MockProxyBridge::new());
//!     let engine = Arc::new(MockRoutingEngine::new());
//!     let session = SessionManager::new(
//!         &Config::default(),
//!         Arc::new(MockPortAllocator::new(51820)),
//!         bridge.clone(),
//!         Arc::new(MockTunProvider::new()),
//!         engine.clone(),
//!     );
//!
//!     session.connect("wss://relay.test/", "").await.unwrap();
//!     session.disconnect().await.unwrap();
//!     assert_eq!(bridge.stop_calls(), 1);
//! }
//! ```

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use whisper_tun::{TunConfig, TunHandle, TunProvider};

use crate::bridge::ProxyBridge;
use crate::error::{Error, Result};
use crate::port::PortAllocator;
use crate::router::{EngineKey, RoutingEngine};

/// How a mock collaborator misbehaves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MockFailure {
    /// Behave normally
    #[default]
    None,
    /// Return an error
    Error,
    /// Panic inside the call
    Panic,
}

/// Port allocator returning a fixed port
#[derive(Debug)]
pub struct MockPortAllocator {
    port: Option<u16>,
    calls: AtomicUsize,
}

impl MockPortAllocator {
    pub fn new(port: u16) -> Self {
        Self {
            port: Some(port),
            calls: AtomicUsize::new(0),
        }
    }

    /// An allocator that never finds a port
    pub fn exhausted() -> Self {
        Self {
            port: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortAllocator for MockPortAllocator {
    async fn reserve(&self) -> Result<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.port
            .ok_or_else(|| Error::PortUnavailable("no ephemeral ports left".into()))
    }
}

/// Arguments of a bridge start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStart {
    pub remote_url: String,
    pub port: u16,
    pub resolver_url: String,
}

/// Proxy bridge that records its calls
#[derive(Debug, Default)]
pub struct MockProxyBridge {
    failure: MockFailure,
    start_delay: Duration,
    starts: Mutex<Vec<BridgeStart>>,
    stop_calls: AtomicUsize,
}

impl MockProxyBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bridge whose start fails in the given way
    pub fn failing(failure: MockFailure) -> Self {
        Self {
            failure,
            ..Self::default()
        }
    }

    /// A bridge whose start takes `delay`
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn start_calls(&self) -> usize {
        self.starts().len()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Every start call so far
    pub fn starts(&self) -> Vec<BridgeStart> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProxyBridge for MockProxyBridge {
    async fn start(&self, remote_url: &str, port: u16, resolver_url: &str) -> Result<()> {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BridgeStart {
                remote_url: remote_url.to_string(),
                port,
                resolver_url: resolver_url.to_string(),
            });

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        match self.failure {
            MockFailure::None => Ok(()),
            MockFailure::Error => Err(Error::BridgeStartFailed("remote refused".into())),
            MockFailure::Panic => panic!("bridge crashed in native code"),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What the mock interface provider does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunOutcome {
    /// Hand out a handle backed by `/dev/null`
    #[default]
    Establish,
    /// Return an error
    Fail,
    /// Return no handle, like a denied permission
    Decline,
}

/// Interface provider handing out `/dev/null` descriptors
#[derive(Debug, Default)]
pub struct MockTunProvider {
    outcome: TunOutcome,
    requests: Mutex<Vec<TunConfig>>,
}

impl MockTunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(outcome: TunOutcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }

    pub fn establish_calls(&self) -> usize {
        self.requests().len()
    }

    /// Every interface request so far
    pub fn requests(&self) -> Vec<TunConfig> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TunProvider for MockTunProvider {
    async fn establish(&self, config: &TunConfig) -> whisper_tun::Result<Option<TunHandle>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config.clone());

        match self.outcome {
            TunOutcome::Establish => {
                let file = std::fs::File::open("/dev/null")?;
                let name = config.name.clone().unwrap_or_else(|| "mock0".into());
                Ok(Some(TunHandle::new(OwnedFd::from(file), name, config.mtu)))
            }
            TunOutcome::Fail => Err(whisper_tun::Error::PermissionDenied(
                "interface request denied".into(),
            )),
            TunOutcome::Decline => Ok(None),
        }
    }
}

/// Routing engine that records its configuration and calls
///
/// Counts as running from the end of a successful start until the end of
/// the next stop.
#[derive(Debug, Default)]
pub struct MockRoutingEngine {
    keys: Mutex<Vec<EngineKey>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    running: AtomicBool,
    start_failure: MockFailure,
    insert_delay: Duration,
    start_delay: Duration,
    stop_delay: Duration,
}

impl MockRoutingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose start fails in the given way
    pub fn failing(failure: MockFailure) -> Self {
        Self {
            start_failure: failure,
            ..Self::default()
        }
    }

    /// An engine whose stop takes `delay`
    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..Self::default()
        }
    }

    /// Make insert take `delay`
    pub fn insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = delay;
        self
    }

    /// Make start take `delay` before it succeeds or fails
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Every inserted configuration so far
    pub fn keys(&self) -> Vec<EngineKey> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until start has been called, up to `timeout`
    pub async fn wait_for_start(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.start_calls() == 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[async_trait]
impl RoutingEngine for MockRoutingEngine {
    async fn insert(&self, key: EngineKey) -> Result<()> {
        if !self.insert_delay.is_zero() {
            tokio::time::sleep(self.insert_delay).await;
        }
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        match self.start_failure {
            MockFailure::None => {
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            }
            MockFailure::Error => Err(Error::EngineStartFailed("engine refused the device".into())),
            MockFailure::Panic => panic!("engine crashed in native code"),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
