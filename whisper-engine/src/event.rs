//! Session events and state

use serde::{Deserialize, Serialize};

/// Tunnel session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session
    Idle,
    /// Setup steps in progress
    Starting,
    /// Bridge, interface and routing engine are up
    Running,
    /// Teardown in progress
    Stopping,
}

impl SessionState {
    /// Check if a session exists in this state
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Starting => "Starting...",
            SessionState::Running => "Running",
            SessionState::Stopping => "Stopping...",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// What triggered a teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Explicit disconnect command
    Requested,
    /// The OS revoked the tunnel interface
    Revoked,
    /// The hosting process is going away
    ProcessExit,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "disconnect requested"),
            StopReason::Revoked => write!(f, "interface revoked"),
            StopReason::ProcessExit => write!(f, "process exiting"),
        }
    }
}

/// Events emitted by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// Session is up; a status notification should be shown
    Connected {
        /// Normalized remote endpoint
        remote_url: String,
        /// Local SOCKS port of the bridge
        proxy_port: u16,
        /// Tunnel interface name
        interface: String,
    },

    /// Session is gone; any status notification should be removed
    Disconnected {
        /// What triggered the teardown
        reason: StopReason,
    },

    /// The routing engine reported a failure after the session came up
    EngineFailed {
        /// Error message
        message: String,
    },

    /// A connect attempt failed
    Error {
        /// Error message
        message: String,
    },
}

/// Event handler trait for receiving session events
///
/// The presentation layer (status notification, foreground indicator) hooks
/// in here: it is told when the session enters Running and when it is gone.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a session event
    async fn on_event(&self, event: SessionEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { old, new } => {
                log::info!("Session state: {} -> {}", old, new);
            }
            SessionEvent::Connected {
                remote_url,
                proxy_port,
                interface,
            } => {
                log::info!(
                    "Tunnel running: remote={}, proxy=127.0.0.1:{}, interface={}",
                    remote_url,
                    proxy_port,
                    interface
                );
            }
            SessionEvent::Disconnected { reason } => {
                log::info!("Tunnel stopped: {}", reason);
            }
            SessionEvent::EngineFailed { message } => {
                log::error!("Routing engine failed: {}", message);
            }
            SessionEvent::Error { message } => {
                log::error!("Connect failed: {}", message);
            }
        }
    }
}
