//! Core error types.

use nets_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Errors surfaced by servers, clients and connections.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Wraps an application error returned from a handler callback.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        NetError::Handler(err.into())
    }

    pub(crate) fn invalid_address(addr: &str, reason: impl Into<String>) -> Self {
        NetError::InvalidAddress {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Dial { .. } | NetError::Accept(_) => true,
            NetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns whether this error reports a handler panic.
    pub fn is_fault(&self) -> bool {
        matches!(self, NetError::HandlerFault(_))
    }
}
