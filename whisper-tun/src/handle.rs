//! Owned tunnel interface handle
//!
//! A [`TunHandle`] is the ownership token for an established interface. The
//! descriptor inside it can be taken out exactly once with
//! [`TunHandle::detach_fd`]; after that the handle only carries metadata and
//! every further detach fails with [`Error::AlreadyDetached`].
//!
//! Dropping a handle that still owns its descriptor closes the descriptor,
//! which on Linux also removes a non-persistent tun interface.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Ownership token for an OS virtual-interface descriptor
pub struct TunHandle {
    fd: Option<OwnedFd>,
    name: String,
    mtu: u16,
}

impl TunHandle {
    /// Wrap an owned interface descriptor
    pub fn new(fd: OwnedFd, name: impl Into<String>, mtu: u16) -> Self {
        Self {
            fd: Some(fd),
            name: name.into(),
            mtu,
        }
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interface MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Whether the descriptor has been handed off
    pub fn is_detached(&self) -> bool {
        self.fd.is_none()
    }

    /// Peek at the descriptor without giving up ownership
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Give up ownership of the descriptor
    ///
    /// The returned descriptor is no longer closed by this handle but by
    /// whoever drops it. A second call fails with [`Error::AlreadyDetached`].
    pub fn detach_fd(&mut self) -> Result<OwnedFd> {
        let fd = self.fd.take().ok_or(Error::AlreadyDetached)?;
        log::debug!("Detached descriptor {} from {}", fd.as_raw_fd(), self.name);
        Ok(fd)
    }
}

impl std::fmt::Debug for TunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunHandle")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("fd", &self.raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_handle() -> TunHandle {
        let file = std::fs::File::open("/dev/null").unwrap();
        TunHandle::new(OwnedFd::from(file), "test0", 1500)
    }

    #[test]
    fn test_detach_once() {
        let mut handle = null_handle();
        assert!(!handle.is_detached());

        let fd = handle.detach_fd().unwrap();
        assert!(fd.as_raw_fd() >= 0);
        assert!(handle.is_detached());
        assert_eq!(handle.raw_fd(), None);
    }

    #[test]
    fn test_second_detach_fails() {
        let mut handle = null_handle();
        drop(handle.detach_fd().unwrap());

        let err = handle.detach_fd().unwrap_err();
        assert!(err.is_already_detached());
    }

    #[test]
    fn test_metadata_survives_detach() {
        let mut handle = null_handle();
        drop(handle.detach_fd().unwrap());

        assert_eq!(handle.name(), "test0");
        assert_eq!(handle.mtu(), 1500);
    }
}
