//! Listening, dialing and per-socket options.

use crate::addr::ProtoAddr;
use crate::error::NetError;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Hook run against the raw listening socket before it is bound.
pub type ListenControl = Arc<dyn Fn(&TcpSocket) -> io::Result<()> + Send + Sync>;

/// Options applied to every accepted or dialed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    /// TCP keepalive idle time. `None` leaves the OS default.
    pub keepalive: Option<Duration>,
    /// Disables Nagle's algorithm when set.
    pub nodelay: bool,
}

impl SocketOptions {
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        if let Some(time) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

/// Binds a listener on the first resolved address that accepts the bind.
pub async fn listen(
    addr: &ProtoAddr,
    backlog: u32,
    control: Option<&ListenControl>,
) -> Result<TcpListener, NetError> {
    let listen_err = |source| NetError::Listen {
        addr: addr.to_string(),
        source,
    };

    let mut last_err = None;
    for candidate in addr.resolve().await.map_err(listen_err)? {
        match bind(candidate, backlog, control) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!("Bind {} failed: {}", candidate, e);
                last_err = Some(e);
            }
        }
    }
    Err(listen_err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind")
    })))
}

fn bind(addr: SocketAddr, backlog: u32, control: Option<&ListenControl>) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    if let Some(control) = control {
        control(&socket)?;
    }
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connects to the first resolved address that answers.
///
/// `timeout` bounds the whole attempt, resolution included.
pub async fn dial(addr: &ProtoAddr, timeout: Option<Duration>) -> Result<TcpStream, NetError> {
    let attempt = connect_any(addr);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial timed out after {:?}", limit),
            )),
        },
        None => attempt.await,
    };
    result.map_err(|source| NetError::Dial {
        addr: addr.to_string(),
        source,
    })
}

async fn connect_any(addr: &ProtoAddr) -> io::Result<TcpStream> {
    let mut last_err = None;
    for candidate in addr.resolve().await? {
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to dial")))
}
