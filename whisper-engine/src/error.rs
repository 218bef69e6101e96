//! Error types for the session manager

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interface error
    #[error("TUN error: {0}")]
    Tun(#[from] whisper_tun::Error),

    /// No local port could be reserved for the proxy bridge
    #[error("no local port available: {0}")]
    PortUnavailable(String),

    /// The proxy bridge did not come up
    #[error("bridge failed to start: {0}")]
    BridgeStartFailed(String),

    /// The OS did not hand out a tunnel interface
    #[error("failed to establish interface: {0}")]
    InterfaceEstablishFailed(String),

    /// The routing engine failed to start
    #[error("routing engine failed to start: {0}")]
    EngineStartFailed(String),

    /// Teardown was interrupted before it finished
    #[error("teardown interrupted")]
    TeardownInterrupted,

    /// Already running
    #[error("tunnel is already running")]
    AlreadyRunning,

    /// Control socket error
    #[error("control error: {0}")]
    Control(String),
}

impl Error {
    /// Check if this error aborted a connect during setup
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Error::PortUnavailable(_)
                | Error::BridgeStartFailed(_)
                | Error::InterfaceEstablishFailed(_)
        )
    }

    /// Check if this is a second detach of an interface handle
    pub fn is_already_detached(&self) -> bool {
        matches!(self, Error::Tun(e) if e.is_already_detached())
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_failures() {
        assert!(Error::PortUnavailable("x".into()).is_setup_failure());
        assert!(Error::BridgeStartFailed("x".into()).is_setup_failure());
        assert!(Error::InterfaceEstablishFailed("x".into()).is_setup_failure());
        assert!(!Error::EngineStartFailed("x".into()).is_setup_failure());
        assert!(!Error::AlreadyRunning.is_setup_failure());
    }

    #[test]
    fn test_already_detached_passthrough() {
        let err = Error::from(whisper_tun::Error::AlreadyDetached);
        assert!(err.is_already_detached());
        assert!(!Error::TeardownInterrupted.is_already_detached());
    }
}
