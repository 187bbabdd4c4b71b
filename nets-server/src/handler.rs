//! Server lifecycle callbacks.

use crate::server::Server;
use async_trait::async_trait;
use nets_core::{ConnHandler, NetError};
use std::time::Duration;

/// Callbacks for a [`Server`], on top of the per-connection ones.
#[async_trait]
pub trait ServerHandler: ConnHandler {
    /// Called after the listener is bound and before the first accept.
    /// Returning an error aborts `serve`.
    async fn on_boot(&self, _server: &Server) -> Result<(), NetError> {
        Ok(())
    }

    /// Called once per `shutdown`, before the listener is released.
    async fn on_shutdown(&self, _server: &Server) {}

    /// Called periodically when ticking is enabled. Returns the delay until
    /// the next call.
    async fn on_tick(&self) -> Duration {
        Duration::from_secs(1)
    }
}
