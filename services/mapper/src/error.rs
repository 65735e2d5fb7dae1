//! Error types for the port mapper core.

use std::io;

use thiserror::Error;

/// Failure to bind a listener for one rule.
///
/// Recoverable: the rule is skipped and the remaining rules are served.
#[derive(Debug, Error)]
pub enum BindError {
    /// Another socket already listens on the port.
    #[error("port {port} is already in use")]
    AddrInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Any other failure while binding.
    #[error("failed to listen on port {port}: {source}")]
    Io {
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn from_io(port: u16, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse { port, source },
            _ => BindError::Io { port, source },
        }
    }

    /// The local port of the rule that failed to bind.
    pub fn port(&self) -> u16 {
        match self {
            BindError::AddrInUse { port, .. } | BindError::Io { port, .. } => *port,
        }
    }
}

/// Errors from the accept dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatcher was given no bound listeners.
    #[error("there are no listeners to dispatch from")]
    NoListeners,

    /// Accepting failed in a way that is not tied to a single connection.
    #[error("accept failed on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Rejections from the relay worker pool.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker slot is busy.
    #[error("worker pool saturated ({size} relays active)")]
    Saturated { size: usize },

    /// The pool no longer admits work.
    #[error("worker pool is shut down")]
    ShutDown,
}
