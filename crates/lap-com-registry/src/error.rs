// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for the registry core (spec.md §7).

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// All fallible outcomes the core can produce.
///
/// The core never uses panics or exceptions for control flow — every
/// fallible operation returns one of these, matching
/// `hdds::transport::shm::ShmError`'s hand-rolled `Display`/`Error` style
/// rather than a derive-macro error type.
#[derive(Debug)]
pub enum RegistryError {
    /// Service ID (or explicit slot index) outside the legal range.
    InvalidArgument(String),
    /// Public API called before `initialize()`.
    NotInitialized,
    /// `initialize()` called twice, or similar lifecycle misuse.
    InvalidState(String),
    /// Registration collision: target slot was not `IDLE`.
    SlotOccupied { service_id: u64, slot: usize },
    /// Seqlock read exhausted its retry budget.
    Unstable,
    /// Anonymous memory object creation failed.
    MemoryCreateFailed(io::Error),
    /// Resizing the memory object failed.
    MemoryResizeFailed(io::Error),
    /// Mapping the memory object failed.
    MemoryMapFailed(io::Error),
    /// Sealing the memory object failed (non-fatal in the server, surfaced
    /// for callers who want to know).
    SealFailed(io::Error),
    /// Creating the local socket failed.
    SocketCreateFailed(io::Error),
    /// Binding the local socket failed.
    SocketBindFailed(io::Error),
    /// Listening on the local socket failed.
    SocketListenFailed(io::Error),
    /// Connecting to the initializer socket failed.
    SocketConnectFailed(io::Error),
    /// Sending the ancillary FD-passing message failed.
    FdPassingFailed(io::Error),
    /// Receiving the ancillary FD-passing message failed, or no descriptor
    /// was present in the ancillary data.
    FdReceiveFailed(io::Error),
    /// ASIL table access refused by the kernel (permission bits).
    PermissionDenied(io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotInitialized => write!(f, "runtime not initialized"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::SlotOccupied { service_id, slot } => write!(
                f,
                "slot {slot} already occupied (service_id=0x{service_id:04x})"
            ),
            Self::Unstable => write!(f, "seqlock read exceeded retry budget"),
            Self::MemoryCreateFailed(e) => write!(f, "memory object creation failed: {e}"),
            Self::MemoryResizeFailed(e) => write!(f, "memory object resize failed: {e}"),
            Self::MemoryMapFailed(e) => write!(f, "memory mapping failed: {e}"),
            Self::SealFailed(e) => write!(f, "memory sealing failed: {e}"),
            Self::SocketCreateFailed(e) => write!(f, "socket creation failed: {e}"),
            Self::SocketBindFailed(e) => write!(f, "socket bind failed: {e}"),
            Self::SocketListenFailed(e) => write!(f, "socket listen failed: {e}"),
            Self::SocketConnectFailed(e) => write!(f, "socket connect failed: {e}"),
            Self::FdPassingFailed(e) => write!(f, "fd passing send failed: {e}"),
            Self::FdReceiveFailed(e) => write!(f, "fd passing receive failed: {e}"),
            Self::PermissionDenied(e) => write!(f, "permission denied: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MemoryCreateFailed(e)
            | Self::MemoryResizeFailed(e)
            | Self::MemoryMapFailed(e)
            | Self::SealFailed(e)
            | Self::SocketCreateFailed(e)
            | Self::SocketBindFailed(e)
            | Self::SocketListenFailed(e)
            | Self::SocketConnectFailed(e)
            | Self::FdPassingFailed(e)
            | Self::FdReceiveFailed(e)
            | Self::PermissionDenied(e) => Some(e),
            _ => None,
        }
    }
}
