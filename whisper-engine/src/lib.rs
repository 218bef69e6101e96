//! Whisper Engine
//!
//! Tunnel session lifecycle manager. Turns a connect request into a running
//! session made of a local SOCKS bridge to a remote tunnel endpoint, a
//! virtual network interface, and a packet-routing engine relaying the
//! interface's traffic through the bridge; and tears all three down exactly
//! once, whatever triggers the teardown.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   whisper-cli   │──── IPC ────▶│   ControlServer     │   │
//! │  └─────────────────┘              └──────────┬──────────┘   │
//! │                                              ▼              │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                  SessionManager                         │ │
//! │  │  connect:    PortAllocator → BridgeController           │ │
//! │  │              → TunInterfaceManager → EngineAdapter      │ │
//! │  │  disconnect: ShutdownCoordinator (detach → engine stop  │ │
//! │  │              → bridge stop) on the session WorkerPool   │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  whisper-tun: TunProvider, TunHandle, routes                │
//! │  child processes: wisp2socks bridge, tun2socks engine       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod fault;
pub mod mock;
pub mod pool;
pub mod port;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod tunnel;
pub mod url;

pub use bridge::{BridgeController, ProcessBridge, ProxyBridge};
pub use config::{
    BridgeConfig, CommonConfig, Config, EngineConfig, InterfaceConfig, SessionConfig,
    ShutdownConfig,
};
pub use control::{
    ControlClient, ControlRequest, ControlResponse, ControlServer, StatusInfo, DEFAULT_SOCKET_PATH,
};
pub use error::{Error, Result};
pub use event::{EventHandler, LoggingEventHandler, SessionEvent, SessionState, StopReason};
pub use pool::{PoolShutdown, WorkerPool};
pub use port::{EphemeralPortAllocator, PortAllocator};
pub use router::{EngineAdapter, EngineKey, ProcessEngine, RoutingEngine};
pub use session::{SessionManager, SessionStatus};
pub use shutdown::ShutdownCoordinator;
pub use tunnel::TunInterfaceManager;
pub use url::{normalize_remote_url, normalize_resolver_url, DEFAULT_REMOTE_URL, DEFAULT_RESOLVER_URL};
