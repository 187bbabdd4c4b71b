//! TCP client implementation.

use crate::handler::ClientHandler;
use nets_core::{
    catch_fault, guard_callback, run_ticker, BufferPool, ConnHandler, Connection, Lifecycle,
    NetError, ProtoAddr, SocketOptions, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE,
};
use std::sync::Arc;
use std::time::Duration;

/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address to dial, `scheme://host:port`.
    pub addr: String,
    /// Upper bound on each dial attempt. `None` waits for the OS.
    pub dial_timeout: Option<Duration>,
    /// TCP keepalive idle time for dialed sockets.
    pub keepalive: Option<Duration>,
    /// Whether to set `TCP_NODELAY` on dialed sockets.
    pub nodelay: bool,
    /// Whether to run the periodic `on_tick` callback.
    pub tick: bool,
    /// Capacity of each pooled read buffer.
    pub buffer_capacity: usize,
    /// Idle buffers retained by the pool.
    pub max_idle_buffers: usize,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: Some(DEFAULT_DIAL_TIMEOUT),
            keepalive: None,
            nodelay: false,
            tick: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_idle_buffers: DEFAULT_MAX_IDLE,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_tick(mut self, tick: bool) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_max_idle_buffers(mut self, max_idle: usize) -> Self {
        self.max_idle_buffers = max_idle;
        self
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keepalive: self.keepalive,
            nodelay: self.nodelay,
        }
    }
}

struct Inner {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    conn_handler: Arc<dyn ConnHandler>,
    lifecycle: Arc<Lifecycle>,
    pool: Arc<BufferPool>,
}

/// TCP client that dials connections on demand.
///
/// Cloning is cheap; clones share the same pool, handler and lifecycle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new<H: ClientHandler>(config: ClientConfig, handler: Arc<H>) -> Self {
        let pool = Arc::new(BufferPool::with_max_idle(
            config.buffer_capacity,
            config.max_idle_buffers,
        ));
        let conn_handler: Arc<dyn ConnHandler> = handler.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                conn_handler,
                lifecycle: Arc::new(Lifecycle::new()),
                pool,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Starts the client. Connections can be dialed until
    /// [`shutdown`](Client::shutdown).
    pub async fn serve(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        inner.lifecycle.start()?;

        if let Err(e) = guard_callback(inner.handler.on_boot(self)).await {
            let _ = inner.lifecycle.stop();
            return Err(e);
        }

        if inner.config.tick {
            let handler = inner.handler.clone();
            tokio::spawn(run_ticker(inner.lifecycle.clone(), move || {
                let handler = handler.clone();
                async move { handler.on_tick().await }
            }));
        }

        tracing::debug!("Client started for {}", inner.config.addr);
        Ok(())
    }

    /// Stops the client; its connections close themselves.
    pub async fn shutdown(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        inner.lifecycle.stop()?;
        tracing::debug!("Client shutting down");
        let _ = catch_fault(inner.handler.on_shutdown(self)).await;
        Ok(())
    }

    /// Dials the configured address and starts a connection on it.
    pub async fn new_conn(&self) -> Result<Connection, NetError> {
        let inner = &self.inner;
        if !inner.lifecycle.is_running() {
            return Err(NetError::NotRunning);
        }

        let addr = ProtoAddr::parse(&inner.config.addr)?;
        let stream = nets_core::dial(&addr, inner.config.dial_timeout).await?;
        inner.config.socket_options().apply(&stream)?;

        let conn = Connection::spawn(
            stream,
            inner.conn_handler.clone(),
            inner.pool.clone(),
            inner.lifecycle.clone(),
        )?;
        tracing::debug!("[{}] Connected (id={})", conn.peer_addr(), conn.id());
        Ok(conn)
    }

    /// Number of live connections.
    pub fn conns(&self) -> usize {
        self.inner.lifecycle.conns()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.config.addr)
            .field("running", &self.is_running())
            .field("conns", &self.conns())
            .finish()
    }
}
