//! Client lifecycle callbacks.

use crate::client::Client;
use async_trait::async_trait;
use nets_core::{ConnHandler, NetError};
use std::time::Duration;

/// Callbacks for a [`Client`], on top of the per-connection ones.
#[async_trait]
pub trait ClientHandler: ConnHandler {
    /// Called when the client starts serving. Returning an error aborts
    /// `serve`.
    async fn on_boot(&self, _client: &Client) -> Result<(), NetError> {
        Ok(())
    }

    /// Called once per `shutdown`.
    async fn on_shutdown(&self, _client: &Client) {}

    /// Called periodically when ticking is enabled. Returns the delay until
    /// the next call.
    async fn on_tick(&self) -> Duration {
        Duration::from_secs(1)
    }
}
