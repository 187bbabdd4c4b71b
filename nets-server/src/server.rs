//! TCP server implementation.

use crate::handler::ServerHandler;
use nets_core::{
    catch_fault, guard_callback, run_ticker, BufferPool, ConnHandler, Connection, Lifecycle,
    ListenControl, NetError, ProtoAddr, SocketOptions, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE,
};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

/// Default listen address.
pub const DEFAULT_ADDR: &str = "tcp://127.0.0.1:7527";

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to listen on, `scheme://host:port`.
    pub addr: String,
    /// TCP keepalive idle time for accepted sockets.
    pub keepalive: Option<Duration>,
    /// Whether to set `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,
    /// Whether to run the periodic `on_tick` callback.
    pub tick: bool,
    /// Capacity of each pooled read buffer.
    pub buffer_capacity: usize,
    /// Idle buffers retained by the pool.
    pub max_idle_buffers: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Hook run on the listening socket before bind.
    pub listen_control: Option<ListenControl>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("keepalive", &self.keepalive)
            .field("nodelay", &self.nodelay)
            .field("tick", &self.tick)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("max_idle_buffers", &self.max_idle_buffers)
            .field("backlog", &self.backlog)
            .field("listen_control", &self.listen_control.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            keepalive: None,
            nodelay: false,
            tick: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_idle_buffers: DEFAULT_MAX_IDLE,
            backlog: DEFAULT_BACKLOG,
            listen_control: None,
        }
    }
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Enables or disables the periodic tick.
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

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets a hook that can adjust the listening socket before it is bound.
    pub fn with_listen_control<F>(mut self, control: F) -> Self
    where
        F: Fn(&TcpSocket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.listen_control = Some(Arc::new(control));
        self
    }

    /// Options applied to every accepted socket.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keepalive: self.keepalive,
            nodelay: self.nodelay,
        }
    }
}

struct Inner {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    conn_handler: Arc<dyn ConnHandler>,
    lifecycle: Arc<Lifecycle>,
    pool: Arc<BufferPool>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Id of the last run whose `on_shutdown` has completed.
    released: watch::Sender<u64>,
}

/// TCP server.
///
/// Cloning is cheap; clones control the same server, so one task can await
/// [`serve`](Server::serve) while another calls [`shutdown`](Server::shutdown).
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new<H: ServerHandler>(config: ServerConfig, handler: Arc<H>) -> Self {
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
                local_addr: Mutex::new(None),
                released: watch::channel(0).0,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Binds the listener and accepts connections until shut down.
    ///
    /// Returns `Ok(())` after a clean [`shutdown`](Server::shutdown). A fatal
    /// accept error shuts the server down and is returned.
    pub async fn serve(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        let run = inner.lifecycle.start()?;

        let listener = match self.boot(run).await {
            Ok(listener) => listener,
            Err(e) => {
                *inner.local_addr.lock() = None;
                let _ = inner.lifecycle.stop();
                return Err(e);
            }
        };

        if inner.config.tick {
            let handler = inner.handler.clone();
            tokio::spawn(run_ticker(inner.lifecycle.clone(), move || {
                let handler = handler.clone();
                async move { handler.on_tick().await }
            }));
        }

        let result = self.accept_loop(&listener, run).await;
        drop(listener);
        *inner.local_addr.lock() = None;
        result
    }

    async fn boot(&self, run: u64) -> Result<TcpListener, NetError> {
        let inner = &self.inner;
        let addr = ProtoAddr::parse(&inner.config.addr)?;
        let listener = nets_core::listen(
            &addr,
            inner.config.backlog,
            inner.config.listen_control.as_ref(),
        )
        .await?;
        let local = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local);

        // Shut down while binding: the accept loop exits straight away.
        if !inner.lifecycle.in_run(run) {
            return Ok(listener);
        }

        guard_callback(inner.handler.on_boot(self)).await?;
        tracing::info!("Server listening on {}", local);
        Ok(listener)
    }

    /// Accepts until run `run` ends, then holds the listener until that
    /// run's `on_shutdown` has completed.
    async fn accept_loop(&self, listener: &TcpListener, run: u64) -> Result<(), NetError> {
        let inner = &self.inner;
        let options = inner.config.socket_options();

        loop {
            tokio::select! {
                biased;
                _ = inner.lifecycle.run_ended(run) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr, &options),
                    Err(e) if is_transient(&e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        if inner.lifecycle.stop().is_ok() {
                            let _ = catch_fault(inner.handler.on_shutdown(self)).await;
                        }
                        return Err(NetError::Accept(e));
                    }
                },
            }
        }

        let mut released = inner.released.subscribe();
        let _ = released.wait_for(|released| *released >= run).await;
        tracing::info!("Server shutting down");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr, options: &SocketOptions) {
        let inner = &self.inner;
        if let Err(e) = options.apply(&stream) {
            tracing::warn!("[{}] Failed to set socket options: {}", addr, e);
        }
        match Connection::spawn(
            stream,
            inner.conn_handler.clone(),
            inner.pool.clone(),
            inner.lifecycle.clone(),
        ) {
            Ok(conn) => tracing::info!("[{}] Client connected (id={})", addr, conn.id()),
            Err(e) => tracing::warn!("[{}] Dropping connection: {}", addr, e),
        }
    }

    /// Stops the server.
    ///
    /// Open connections close themselves; `on_shutdown` runs before the
    /// listener is released.
    pub async fn shutdown(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        let run = inner.lifecycle.stop()?;
        tracing::info!("Server shutdown requested");

        let _ = catch_fault(inner.handler.on_shutdown(self)).await;

        inner
            .released
            .send_modify(|released| *released = (*released).max(run));
        Ok(())
    }

    /// Number of live connections.
    pub fn conns(&self) -> usize {
        self.inner.lifecycle.conns()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.is_running()
    }

    /// The bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.config.addr)
            .field("local_addr", &self.local_addr())
            .field("running", &self.is_running())
            .field("conns", &self.conns())
            .finish()
    }
}

/// Accept errors that concern a single pending connection, not the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Echo {
        boots: AtomicUsize,
        shutdowns: AtomicUsize,
        ticks: AtomicUsize,
        fail_boot: bool,
    }

    #[async_trait]
    impl ConnHandler for Echo {
        async fn on_activate(&self, conn: &Connection) -> Result<(), NetError> {
            let mut buf = [0u8; 512];
            loop {
                let n = conn.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                conn.write(&buf[..n]).await?;
            }
        }
    }

    #[async_trait]
    impl ServerHandler for Echo {
        async fn on_boot(&self, _server: &Server) -> Result<(), NetError> {
            self.boots.fetch_add(1, Ordering::SeqCst);
            if self.fail_boot {
                return Err(NetError::handler("boot refused"));
            }
            Ok(())
        }

        async fn on_shutdown(&self, _server: &Server) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&self) -> Duration {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(10)
        }
    }

    async fn start(
        config: ServerConfig,
        handler: Arc<Echo>,
    ) -> (Server, tokio::task::JoinHandle<Result<(), NetError>>, SocketAddr) {
        let server = Server::new(config, handler);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        let addr = wait_for(|| server.local_addr()).await;
        (server, task, addr)
    }

    async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = probe() {
                return value;
            }
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new("tcp://127.0.0.1:0")
    }

    #[test]
    fn test_config_builders() {
        let config = ServerConfig::new("tcp://:9000")
            .with_keepalive(Duration::from_secs(30))
            .with_nodelay(true)
            .with_tick(true)
            .with_buffer_capacity(512)
            .with_max_idle_buffers(8)
            .with_backlog(64)
            .with_listen_control(|_| Ok(()));

        assert_eq!(config.addr, "tcp://:9000");
        assert_eq!(config.keepalive, Some(Duration::from_secs(30)));
        assert!(config.tick);
        assert_eq!(config.buffer_capacity, 512);
        assert_eq!(config.max_idle_buffers, 8);
        assert_eq!(config.backlog, 64);
        assert!(config.listen_control.is_some());
        assert_eq!(
            config.socket_options(),
            SocketOptions {
                keepalive: Some(Duration::from_secs(30)),
                nodelay: true,
            }
        );
    }

    #[tokio::test]
    async fn test_serve_echo_and_shutdown() {
        let handler = Arc::new(Echo::default());
        let (server, task, addr) = start(local_config(), handler.clone()).await;
        assert!(server.is_running());
        assert_eq!(handler.boots.load(Ordering::SeqCst), 1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let handler = Arc::new(Echo::default());
        let (server, task, _) = start(local_config(), handler.clone()).await;

        server.shutdown().await.unwrap();
        assert!(matches!(server.shutdown().await, Err(NetError::NotRunning)));
        task.await.unwrap().unwrap();
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_serve_rejected() {
        let (server, task, _) = start(local_config(), Arc::new(Echo::default())).await;

        assert!(matches!(server.serve().await, Err(NetError::AlreadyRunning)));
        assert!(server.is_running());

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = Server::new(local_config(), Arc::new(Echo::default()));
        assert!(matches!(server.shutdown().await, Err(NetError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let server = Server::new(ServerConfig::new("udp://127.0.0.1:0"), Arc::new(Echo::default()));
        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, NetError::InvalidAddress { .. }));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_boot_failure_resets_state() {
        let handler = Arc::new(Echo {
            fail_boot: true,
            ..Default::default()
        });
        let server = Server::new(local_config(), handler.clone());

        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, NetError::Handler(_)));
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert_eq!(handler.boots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, task, addr) = start(local_config(), Arc::new(Echo::default())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for(|| (server.conns() == 1).then_some(())).await;

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        wait_for(|| (server.conns() == 0).then_some(())).await;
    }

    #[tokio::test]
    async fn test_serve_again_after_shutdown() {
        let handler = Arc::new(Echo::default());
        let (server, task, _) = start(local_config(), handler.clone()).await;
        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        let addr = wait_for(|| server.local_addr()).await;
        TcpStream::connect(addr).await.unwrap();

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(handler.boots.load(Ordering::SeqCst), 2);
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tick_runs_while_serving() {
        let handler = Arc::new(Echo::default());
        let (server, task, _) = start(local_config().with_tick(true), handler.clone()).await;

        wait_for(|| (handler.ticks.load(Ordering::SeqCst) >= 3).then_some(())).await;

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_while_binding() {
        let handler = Arc::new(Echo::default());
        let config = local_config().with_listen_control(|_| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let server = Server::new(config, handler.clone());
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        wait_for(|| server.is_running().then_some(())).await;
        server.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("serve kept running after shutdown")
            .unwrap();
        assert!(result.is_ok());
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert_eq!(handler.boots.load(Ordering::SeqCst), 0);
        assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_tick_by_default() {
        let handler = Arc::new(Echo::default());
        let (server, task, _) = start(local_config(), handler.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 0);

        server.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
