//! Per-connection callbacks.

use crate::connection::Connection;
use crate::error::NetError;
use async_trait::async_trait;

/// Callbacks invoked by a connection's read loop.
///
/// Every callback runs inside a fault boundary: a panic is reported as
/// [`NetError::HandlerFault`] and closes the connection without taking
/// down the service.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// Called once before the connection starts reading. Returning an error
    /// closes the connection.
    async fn on_opened(&self, _conn: &Connection) -> Result<(), NetError> {
        Ok(())
    }

    /// Called after inbound bytes have been appended to the connection's
    /// buffer. Drain them with [`Connection::read`]. Returning an error
    /// closes the connection.
    async fn on_activate(&self, _conn: &Connection) -> Result<(), NetError> {
        Ok(())
    }

    /// Called exactly once after the connection has closed. `err` is the
    /// error that ended the read loop, if any.
    async fn on_closed(&self, _conn: &Connection, _err: Option<&NetError>) {}
}
