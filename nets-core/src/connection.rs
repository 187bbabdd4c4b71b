//! Connections and their read loops.
//!
//! Each connection owns a background task that reads from the socket into a
//! pooled buffer, appends the bytes to the connection's accumulator and
//! notifies the handler. The application drains the accumulator with
//! [`Connection::read`] and replies with [`Connection::write`].

use crate::error::NetError;
use crate::fault::{catch_fault, guard_callback};
use crate::handler::ConnHandler;
use crate::lifecycle::Lifecycle;
use crate::pool::BufferPool;
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

type Context = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    run: u64,
    state: AtomicU8,
    reading: AtomicBool,
    accumulator: Mutex<Option<BytesMut>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    last_error: Mutex<Option<Arc<NetError>>>,
    context: RwLock<Option<Context>>,
    deadlines: Mutex<Deadlines>,
    /// Set once closing starts; aborts the read loop and in-flight writes.
    closing: watch::Sender<bool>,
    /// Wakes the read loop so it picks up a changed read deadline.
    rearm: Notify,
    pool: Arc<BufferPool>,
    lifecycle: Arc<Lifecycle>,
    handler: Arc<dyn ConnHandler>,
}

impl Inner {
    /// Completes once closing has started.
    async fn closing(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Completes once closing has started or the owning run has ended.
    async fn stopping(&self) {
        tokio::select! {
            _ = self.closing() => {}
            _ = self.lifecycle.run_ended(self.run) => {}
        }
    }
}

/// A live TCP connection owned by a server or client.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

enum Wake {
    Read(io::Result<usize>),
    Rearm,
    Stop,
}

impl Connection {
    /// Registers `stream` with `lifecycle` and starts its read loop. The
    /// connection belongs to the current run and closes when it ends.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        stream: TcpStream,
        handler: Arc<dyn ConnHandler>,
        pool: Arc<BufferPool>,
        lifecycle: Arc<Lifecycle>,
    ) -> io::Result<Connection> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();

        let conn = Connection {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
                run: lifecycle.run_id(),
                state: AtomicU8::new(OPEN),
                reading: AtomicBool::new(false),
                accumulator: Mutex::new(None),
                writer: tokio::sync::Mutex::new(Some(writer)),
                last_error: Mutex::new(None),
                context: RwLock::new(None),
                deadlines: Mutex::new(Deadlines::default()),
                closing: watch::channel(false).0,
                rearm: Notify::new(),
                pool,
                lifecycle,
                handler,
            }),
        };

        conn.inner.lifecycle.conn_opened();
        tokio::spawn(conn.clone().run(reader));
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns true once [`close`](Connection::close) has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    /// The error that ended the read loop, if any.
    pub fn last_error(&self) -> Option<Arc<NetError>> {
        self.inner.last_error.lock().clone()
    }

    /// Number of received bytes not yet drained by [`read`](Connection::read).
    pub fn buffered(&self) -> usize {
        self.inner
            .accumulator
            .lock()
            .as_ref()
            .map_or(0, |acc| acc.len())
    }

    /// Copies buffered inbound bytes into `dst`.
    ///
    /// Returns `Ok(0)` when nothing is buffered or another read is already
    /// in progress. Never waits for the socket.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        self.ensure_open()?;
        let _guard = match ReadGuard::acquire(&self.inner.reading) {
            Some(guard) => guard,
            None => return Ok(0),
        };

        let mut slot = self.inner.accumulator.lock();
        let Some(acc) = slot.as_mut() else {
            return Ok(0);
        };
        let n = dst.len().min(acc.len());
        dst[..n].copy_from_slice(&acc[..n]);
        acc.advance(n);

        if acc.is_empty() {
            if let Some(acc) = slot.take() {
                self.inner.pool.put_accumulator(acc);
            }
        }
        Ok(n)
    }

    /// Writes all of `src` to the socket.
    ///
    /// A write still pending when the connection closes, or when its owner
    /// shuts down, fails with [`NetError::ConnectionClosed`].
    pub async fn write(&self, src: &[u8]) -> Result<usize, NetError> {
        self.ensure_open()?;
        let inner = &self.inner;
        let deadline = inner.deadlines.lock().write;

        let mut writer = tokio::select! {
            writer = inner.writer.lock() => writer,
            _ = inner.stopping() => return Err(NetError::ConnectionClosed),
        };
        let stream = writer.as_mut().ok_or(NetError::ConnectionClosed)?;
        let pending = async {
            match deadline {
                Some(at) => match tokio::time::timeout_at(at.into(), stream.write_all(src)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write deadline exceeded",
                    )),
                },
                None => stream.write_all(src).await,
            }
        };

        tokio::select! {
            result = pending => result?,
            _ = inner.stopping() => return Err(NetError::ConnectionClosed),
        }
        Ok(src.len())
    }

    /// Closes the connection.
    ///
    /// The first call shuts the socket down, releases buffers, updates the
    /// owner's connection count and runs `on_closed`. Later calls return
    /// [`NetError::ConnectionClosed`].
    pub async fn close(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::ConnectionClosed);
        }
        inner.closing.send_replace(true);

        let writer = inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("[{}] Shutdown error: {}", inner.peer_addr, e);
            }
        }

        let acc = inner.accumulator.lock().take();
        if let Some(acc) = acc {
            inner.pool.put_accumulator(acc);
        }

        inner.lifecycle.conn_closed();
        inner.state.store(CLOSED, Ordering::Release);
        tracing::debug!("[{}] Connection {} closed", inner.peer_addr, inner.id);

        let err = self.last_error();
        // Panics are logged by the fault boundary.
        let _ = catch_fault(inner.handler.on_closed(self, err.as_deref())).await;
        Ok(())
    }

    /// Sets both read and write deadlines. `None` disables them.
    pub fn set_deadline(&self, at: Option<Instant>) -> Result<(), NetError> {
        self.ensure_open()?;
        {
            let mut deadlines = self.inner.deadlines.lock();
            deadlines.read = at;
            deadlines.write = at;
        }
        self.inner.rearm.notify_one();
        Ok(())
    }

    /// Bounds the read loop's socket reads. Expiry closes the connection
    /// with a timeout error.
    pub fn set_read_deadline(&self, at: Option<Instant>) -> Result<(), NetError> {
        self.ensure_open()?;
        self.inner.deadlines.lock().read = at;
        self.inner.rearm.notify_one();
        Ok(())
    }

    /// Bounds each subsequent [`write`](Connection::write).
    pub fn set_write_deadline(&self, at: Option<Instant>) -> Result<(), NetError> {
        self.ensure_open()?;
        self.inner.deadlines.lock().write = at;
        Ok(())
    }

    /// Attaches an application value to the connection, replacing any
    /// previous one.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.inner.context.write() = Some(Arc::new(value));
    }

    /// Returns the attached value if it has type `T`.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let ctx = self.inner.context.read().clone()?;
        ctx.downcast::<T>().ok()
    }

    pub fn clear_context(&self) {
        self.inner.context.write().take();
    }

    async fn run(self, mut reader: OwnedReadHalf) {
        tracing::debug!(
            "[{}] Connection {} opened",
            self.inner.peer_addr,
            self.inner.id
        );

        self.read_loop(&mut reader).await;
        drop(reader);

        // Already closed by the application if this fails.
        let _ = self.close().await;
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf) {
        let inner = &self.inner;
        if let Err(e) = guard_callback(inner.handler.on_opened(self)).await {
            return self.fail(e);
        }

        while inner.lifecycle.in_run(inner.run) && !self.is_closed() {
            let mut buf = inner.pool.get();
            let deadline = inner.deadlines.lock().read;

            let wake = tokio::select! {
                result = reader.read(&mut buf) => Wake::Read(result),
                _ = expire(deadline) => Wake::Read(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                ))),
                _ = inner.rearm.notified() => Wake::Rearm,
                _ = inner.closing() => Wake::Stop,
                _ = inner.lifecycle.run_ended(inner.run) => Wake::Stop,
            };

            let n = match wake {
                Wake::Read(Ok(n)) => n,
                Wake::Read(Err(e)) => {
                    inner.pool.put(buf);
                    return self.fail(e.into());
                }
                Wake::Rearm => {
                    inner.pool.put(buf);
                    continue;
                }
                Wake::Stop => {
                    inner.pool.put(buf);
                    return;
                }
            };

            if n == 0 {
                inner.pool.put(buf);
                tracing::debug!("[{}] Connection closed by peer", inner.peer_addr);
                return;
            }

            tracing::trace!("[{}] Received {} bytes", inner.peer_addr, n);
            self.append(&buf[..n]);
            inner.pool.put(buf);

            if let Err(e) = guard_callback(inner.handler.on_activate(self)).await {
                return self.fail(e);
            }
        }
    }

    /// Records the error that ends the read loop, where `close` will find it.
    fn fail(&self, e: NetError) {
        tracing::debug!(
            "[{}] Connection {} error: {}",
            self.inner.peer_addr,
            self.inner.id,
            e
        );
        *self.inner.last_error.lock() = Some(Arc::new(e));
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.is_closed() {
            Err(NetError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn append(&self, data: &[u8]) {
        let mut slot = self.inner.accumulator.lock();
        slot.get_or_insert_with(|| self.inner.pool.get_accumulator())
            .extend_from_slice(data);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            OPEN => "open",
            CLOSING => "closing",
            _ => "closed",
        };
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("state", &state)
            .finish()
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Marks the accumulator as being drained; released on drop.
struct ReadGuard<'a>(&'a AtomicBool);

impl<'a> ReadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReadGuard(flag))
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Mode {
        Echo,
        Hold,
        Fail,
        Panic,
        RejectOpen,
        PanicOpen,
    }

    struct Recorder {
        mode: Mode,
        activations: AtomicUsize,
        closed: mpsc::UnboundedSender<Option<String>>,
    }

    #[async_trait]
    impl ConnHandler for Recorder {
        async fn on_opened(&self, _conn: &Connection) -> Result<(), NetError> {
            match self.mode {
                Mode::RejectOpen => Err(NetError::handler("not welcome")),
                Mode::PanicOpen => panic!("opened exploded"),
                _ => Ok(()),
            }
        }

        async fn on_activate(&self, conn: &Connection) -> Result<(), NetError> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Echo => {
                    let mut buf = [0u8; 256];
                    loop {
                        let n = conn.read(&mut buf)?;
                        if n == 0 {
                            return Ok(());
                        }
                        conn.write(&buf[..n]).await?;
                    }
                }
                Mode::Hold | Mode::RejectOpen | Mode::PanicOpen => Ok(()),
                Mode::Fail => Err(NetError::handler("rejected")),
                Mode::Panic => panic!("activate exploded"),
            }
        }

        async fn on_closed(&self, _conn: &Connection, err: Option<&NetError>) {
            let _ = self.closed.send(err.map(|e| e.to_string()));
        }
    }

    struct Fixture {
        peer: TcpStream,
        conn: Connection,
        handler: Arc<Recorder>,
        lifecycle: Arc<Lifecycle>,
        closed: mpsc::UnboundedReceiver<Option<String>>,
    }

    async fn fixture(mode: Mode) -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let (tx, closed) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.start().unwrap();
        let handler = Arc::new(Recorder {
            mode,
            activations: AtomicUsize::new(0),
            closed: tx,
        });
        let conn = Connection::spawn(
            accepted.unwrap().0,
            handler.clone(),
            Arc::new(BufferPool::new(64)),
            lifecycle.clone(),
        )
        .unwrap();

        Fixture {
            peer: peer.unwrap(),
            conn,
            handler,
            lifecycle,
            closed,
        }
    }

    async fn next_close(rx: &mut mpsc::UnboundedReceiver<Option<String>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("on_closed not called")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let mut f = fixture(Mode::Echo).await;
        assert_eq!(f.lifecycle.conns(), 1);

        f.peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        f.peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_peer_close_runs_on_closed_once() {
        let mut f = fixture(Mode::Echo).await;
        drop(f.peer);

        assert_eq!(next_close(&mut f.closed).await, None);
        assert!(f.conn.is_closed());
        assert_eq!(f.lifecycle.conns(), 0);
        assert!(matches!(f.conn.close().await, Err(NetError::ConnectionClosed)));
        assert!(f.closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_drains_buffer() {
        let f = fixture(Mode::Hold).await;
        let mut peer = f.peer;
        peer.write_all(b"hello").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.conn.buffered() < 5 {
            assert!(Instant::now() < deadline, "bytes never arrived");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut buf = [0u8; 3];
        assert_eq!(f.conn.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(f.conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(f.conn.read(&mut buf).unwrap(), 0);
        assert_eq!(f.conn.buffered(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_closes_connection() {
        let mut f = fixture(Mode::Fail).await;
        f.peer.write_all(b"x").await.unwrap();

        let err = next_close(&mut f.closed).await.unwrap();
        assert!(err.contains("rejected"));
        assert!(matches!(
            f.conn.last_error().as_deref(),
            Some(NetError::Handler(_))
        ));

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), f.peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_handler_panic_reported_as_fault() {
        let mut f = fixture(Mode::Panic).await;
        f.peer.write_all(b"x").await.unwrap();

        let err = next_close(&mut f.closed).await.unwrap();
        assert!(err.contains("activate exploded"));
        assert!(f.conn.last_error().unwrap().is_fault());
        assert_eq!(f.lifecycle.conns(), 0);
    }

    #[tokio::test]
    async fn test_local_close() {
        let mut f = fixture(Mode::Hold).await;
        f.conn.close().await.unwrap();
        assert_eq!(next_close(&mut f.closed).await, None);

        let mut buf = [0u8; 1];
        assert!(matches!(f.conn.read(&mut buf), Err(NetError::ConnectionClosed)));
        assert!(matches!(f.conn.write(b"x").await, Err(NetError::ConnectionClosed)));
        assert!(matches!(f.conn.close().await, Err(NetError::ConnectionClosed)));
        assert!(matches!(
            f.conn.set_deadline(None),
            Err(NetError::ConnectionClosed)
        ));
        assert_eq!(f.lifecycle.conns(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_stop_closes_connection() {
        let mut f = fixture(Mode::Hold).await;
        f.lifecycle.stop().unwrap();
        assert_eq!(next_close(&mut f.closed).await, None);
        assert_eq!(f.lifecycle.conns(), 0);
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let mut f = fixture(Mode::Hold).await;
        f.conn
            .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();

        let err = next_close(&mut f.closed).await.unwrap();
        assert!(err.contains("deadline"));
        match f.conn.last_error().as_deref() {
            Some(NetError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opened_error_skips_activate() {
        let mut f = fixture(Mode::RejectOpen).await;
        let _ = f.peer.write_all(b"x").await;

        let err = next_close(&mut f.closed).await.unwrap();
        assert!(err.contains("not welcome"));
        assert!(matches!(
            f.conn.last_error().as_deref(),
            Some(NetError::Handler(_))
        ));
        assert!(f.conn.is_closed());
        assert_eq!(f.handler.activations.load(Ordering::SeqCst), 0);
        assert_eq!(f.lifecycle.conns(), 0);
    }

    #[tokio::test]
    async fn test_opened_panic_reported_as_fault() {
        let mut f = fixture(Mode::PanicOpen).await;

        let err = next_close(&mut f.closed).await.unwrap();
        assert!(err.contains("opened exploded"));
        assert!(f.conn.last_error().unwrap().is_fault());
        assert_eq!(f.handler.activations.load(Ordering::SeqCst), 0);
        assert_eq!(f.lifecycle.conns(), 0);
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_write() {
        // The peer never reads, so a large write fills both socket buffers.
        let mut f = fixture(Mode::Hold).await;
        let writer = {
            let conn = f.conn.clone();
            tokio::spawn(async move { conn.write(&vec![0u8; 64 * 1024 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(3), f.conn.close())
            .await
            .expect("close blocked behind a pending write")
            .unwrap();
        assert_eq!(f.lifecycle.conns(), 0);
        assert_eq!(next_close(&mut f.closed).await, None);

        let result = tokio::time::timeout(Duration::from_secs(3), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
        drop(f.peer);
    }

    #[tokio::test]
    async fn test_stop_aborts_stalled_write() {
        let mut f = fixture(Mode::Hold).await;
        let writer = {
            let conn = f.conn.clone();
            tokio::spawn(async move { conn.write(&vec![0u8; 64 * 1024 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        f.lifecycle.stop().unwrap();
        assert_eq!(next_close(&mut f.closed).await, None);
        assert_eq!(f.lifecycle.conns(), 0);

        let result = tokio::time::timeout(Duration::from_secs(3), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
        drop(f.peer);
    }

    #[tokio::test]
    async fn test_context_roundtrip() {
        let f = fixture(Mode::Hold).await;
        assert!(f.conn.context::<String>().is_none());

        f.conn.set_context(String::from("session-1"));
        assert_eq!(f.conn.context::<String>().unwrap().as_str(), "session-1");
        assert!(f.conn.context::<u32>().is_none());

        f.conn.clear_context();
        assert!(f.conn.context::<String>().is_none());
    }

    #[test]
    fn test_read_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = ReadGuard::acquire(&flag).unwrap();
        assert!(ReadGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(ReadGuard::acquire(&flag).is_some());
    }
}
