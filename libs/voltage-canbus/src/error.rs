//! CAN Bus Error Types
//!
//! Error taxonomy shared by the registry, the bus contract and every transport.

use std::io;
use thiserror::Error;

/// Result type for voltage-canbus operations
pub type Result<T> = std::result::Result<T, CanBusError>;

/// CAN bus transport errors
#[derive(Debug, Error)]
pub enum CanBusError {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry lookup for a name nobody registered
    #[error("No such transport: {0}")]
    UnknownTransport(String),

    /// Network interface lookup failed
    #[error("Interface not found: {name}")]
    InterfaceNotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Socket creation, option or mapping failure while acquiring resources
    #[error("Failed to {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// I/O failure on an acquired resource
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The kernel accepted fewer bytes than a full wire frame
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The kernel returned a record that is not a full wire frame
    #[error("Short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    /// Frame content violates the CAN 2.0 limits
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Operation requires acquired OS resources
    #[error("Not connected")]
    NotConnected,

    /// Reception task panicked or was aborted
    #[error("Reception task failed: {0}")]
    TaskJoin(String),
}

// Helper methods for creating errors
impl CanBusError {
    pub fn config(msg: impl Into<String>) -> Self {
        CanBusError::Config(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        CanBusError::InvalidFrame(msg.into())
    }

    pub fn resource(op: &'static str, source: io::Error) -> Self {
        CanBusError::Resource { op, source }
    }

    /// Capture `errno` of the last failed libc call as a resource error
    #[cfg(target_os = "linux")]
    pub(crate) fn last_os(op: &'static str) -> Self {
        CanBusError::resource(op, io::Error::last_os_error())
    }

    /// Check whether this is a configuration-class error (never retried)
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CanBusError::Config(_)
                | CanBusError::UnknownTransport(_)
                | CanBusError::InterfaceNotFound { .. }
        )
    }

    /// Check whether a reception loop should continue after this error
    pub fn is_transient(&self) -> bool {
        match self {
            CanBusError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }
}

/// Timeout-class and interrupted syscalls are recovered inside reception loops.
///
/// A read timeout on a socket surfaces as `EAGAIN`/`EWOULDBLOCK` (and, for some
/// drivers, `EINPROGRESS`) rather than as a distinct timeout code.
pub fn is_transient_io(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => true,
        _ => {
            #[cfg(target_os = "linux")]
            {
                err.raw_os_error() == Some(libc::EINPROGRESS)
            }
            #[cfg(not(target_os = "linux"))]
            {
                false
            }
        },
    }
}
