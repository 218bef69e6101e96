//! Error types for whisper-tun

use std::io;
use thiserror::Error;

/// Result type alias for whisper-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or handing off an interface
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// The handle's descriptor was already handed off
    #[error("interface descriptor already detached")]
    AlreadyDetached,
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the error reports a second detach of the same handle
    pub fn is_already_detached(&self) -> bool {
        matches!(self, Error::AlreadyDetached)
    }
}
