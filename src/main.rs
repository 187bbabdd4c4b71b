//! nets - Echo server
//!
//! Echoes raw bytes back to each client, or in framed mode decodes packets
//! and echoes each one re-encoded.

use async_trait::async_trait;
use nets_core::{ConnHandler, Connection, NetError};
use nets_protocol::{Codec, StreamDecoder};
use nets_server::{Config, Server, ServerHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct EchoHandler {
    framed: bool,
    codec: Codec,
    tick_interval: Duration,
    server: Mutex<Option<Server>>,
}

impl EchoHandler {
    fn new(config: &Config) -> Self {
        Self {
            framed: config.protocol.framed,
            codec: Codec::default().with_max_payload(config.protocol.max_payload),
            tick_interval: config.tick.interval(),
            server: Mutex::new(None),
        }
    }

    async fn echo_raw(&self, conn: &Connection) -> Result<(), NetError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = conn.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            conn.write(&buf[..n]).await?;
        }
    }

    async fn echo_framed(&self, conn: &Connection) -> Result<(), NetError> {
        let decoder = conn
            .context::<Mutex<StreamDecoder>>()
            .ok_or_else(|| NetError::handler("connection has no decoder"))?;

        let mut replies = Vec::new();
        {
            let mut decoder = decoder.lock();
            let mut buf = [0u8; 4096];
            loop {
                let n = conn.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                decoder.extend(&buf[..n]);
            }
            loop {
                match decoder.next_packet() {
                    Ok(Some(packet)) => {
                        tracing::debug!(
                            "[{}] Packet serial={} len={}",
                            conn.peer_addr(),
                            packet.serial(),
                            packet.length()
                        );
                        replies.push(self.codec.encode(&packet)?);
                    }
                    Ok(None) => break,
                    Err(e) => tracing::warn!("[{}] Skipped corrupt frame: {}", conn.peer_addr(), e),
                }
            }
        }

        for reply in replies {
            conn.write(&reply).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnHandler for EchoHandler {
    async fn on_opened(&self, conn: &Connection) -> Result<(), NetError> {
        if self.framed {
            conn.set_context(Mutex::new(StreamDecoder::with_codec(self.codec)));
        }
        Ok(())
    }

    async fn on_activate(&self, conn: &Connection) -> Result<(), NetError> {
        if self.framed {
            self.echo_framed(conn).await
        } else {
            self.echo_raw(conn).await
        }
    }

    async fn on_closed(&self, conn: &Connection, err: Option<&NetError>) {
        match err {
            Some(e) => tracing::warn!("[{}] Client disconnected: {}", conn.peer_addr(), e),
            None => tracing::info!("[{}] Client disconnected", conn.peer_addr()),
        }
    }
}

#[async_trait]
impl ServerHandler for EchoHandler {
    async fn on_boot(&self, server: &Server) -> Result<(), NetError> {
        *self.server.lock() = Some(server.clone());
        Ok(())
    }

    async fn on_shutdown(&self, server: &Server) {
        tracing::info!("Shutting down with {} open connection(s)", server.conns());
        self.server.lock().take();
    }

    async fn on_tick(&self) -> Duration {
        let conns = self.server.lock().as_ref().map(Server::conns);
        if let Some(conns) = conns {
            tracing::info!("Live connections: {}", conns);
        }
        self.tick_interval
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if NETS_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("NETS_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("NETS_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting nets echo server");
    tracing::info!("  Address: {}", config.network.addr);
    tracing::info!(
        "  Mode: {}",
        if config.protocol.framed { "framed" } else { "raw" }
    );
    tracing::info!(
        "  Buffers: {} bytes, {} idle",
        config.buffers.capacity,
        config.buffers.max_idle
    );
    if config.tick.enabled {
        tracing::info!("  Tick: every {:?}", config.tick.interval());
    }

    let handler = Arc::new(EchoHandler::new(&config));
    let server = Server::new(config.server_config(), handler);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        if let Err(e) = shutdown_server.shutdown().await {
            tracing::warn!("Shutdown failed: {}", e);
        }
    });

    // Run server (blocks until shutdown)
    server.serve().await?;

    tracing::info!("Server stopped");
    Ok(())
}
