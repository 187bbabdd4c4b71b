//! Command execution.

use crate::Commands;
use async_trait::async_trait;
use colored::Colorize;
use nets_client::{Client, ClientConfig, ClientHandler};
use nets_core::{ConnHandler, Connection, NetError};
use nets_protocol::{Codec, Packet, StreamDecoder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Forwards received bytes to the session.
struct Inbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl ConnHandler for Inbox {
    async fn on_activate(&self, conn: &Connection) -> Result<(), NetError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = conn.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let _ = self.tx.send(buf[..n].to_vec());
        }
    }

    async fn on_closed(&self, conn: &Connection, err: Option<&NetError>) {
        match err {
            Some(e) => tracing::warn!("[{}] Connection closed: {}", conn.peer_addr(), e),
            None => tracing::debug!("[{}] Connection closed", conn.peer_addr()),
        }
    }
}

impl ClientHandler for Inbox {}

/// One connection to the server plus the bytes it has received.
pub struct Session {
    client: Client,
    conn: Connection,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    decoder: StreamDecoder,
    timeout: Duration,
}

impl Session {
    pub async fn open(addr: &str, timeout: Duration) -> Result<Self, NetError> {
        let (tx, inbox) = mpsc::unbounded_channel();
        let config = ClientConfig::new(addr)
            .with_dial_timeout(Some(timeout))
            .with_nodelay(true);
        let client = Client::new(config, Arc::new(Inbox { tx }));
        client.serve().await?;

        let conn = match client.new_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        Ok(Self {
            client,
            conn,
            inbox,
            pending: Vec::new(),
            decoder: StreamDecoder::new(),
            timeout,
        })
    }

    pub async fn close(self) {
        let _ = self.conn.close().await;
        let _ = self.client.shutdown().await;
    }

    async fn recv(&mut self) -> CommandResult<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.inbox.recv()).await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => Err("connection closed".into()),
            Err(_) => Err(format!("no reply within {:?}", self.timeout).into()),
        }
    }

    /// Sends `data` and waits for as many bytes back.
    async fn exchange_raw(&mut self, data: &[u8]) -> CommandResult<Vec<u8>> {
        self.conn.write(data).await?;
        while self.pending.len() < data.len() {
            let chunk = if self.conn.is_closed() {
                self.inbox.try_recv().map_err(|_| "connection closed")?
            } else {
                self.recv().await?
            };
            self.pending.extend_from_slice(&chunk);
        }
        Ok(self.pending.drain(..data.len()).collect())
    }

    /// Sends `packet` and waits for the next well-formed packet back.
    async fn exchange_packet(&mut self, packet: &Packet) -> CommandResult<Packet> {
        let frame = Codec::default().encode(packet)?;
        self.conn.write(&frame).await?;
        loop {
            match self.decoder.next_packet() {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {
                    let chunk = self.recv().await?;
                    self.decoder.extend(&chunk);
                }
                Err(e) => eprintln!("{}: {}", "Skipped corrupt frame".yellow(), e),
            }
        }
    }
}

/// Executes a command and returns the formatted output.
pub async fn execute(session: &mut Session, cmd: Commands) -> CommandResult<String> {
    match cmd {
        Commands::Ping => {
            let start = Instant::now();
            let reply = session.exchange_raw(b"ping").await?;
            Ok(format!(
                "{} {} ({:.2?})",
                "Reply".green(),
                String::from_utf8_lossy(&reply).cyan(),
                start.elapsed()
            ))
        }

        Commands::Send {
            message,
            framed,
            count,
        } => {
            let mut lines = Vec::with_capacity(count as usize);
            for serial in 0..count {
                let start = Instant::now();
                let line = if framed {
                    let packet = Packet::new(serial, message.clone().into_bytes());
                    let reply = session.exchange_packet(&packet).await?;
                    format!(
                        "{} serial={} len={} {} ({:.2?})",
                        "Packet".green(),
                        reply.serial(),
                        reply.length(),
                        String::from_utf8_lossy(reply.payload()).cyan(),
                        start.elapsed()
                    )
                } else {
                    let reply = session.exchange_raw(message.as_bytes()).await?;
                    format!(
                        "{} {} ({:.2?})",
                        "Reply".green(),
                        String::from_utf8_lossy(&reply).cyan(),
                        start.elapsed()
                    )
                };
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
    }
}
