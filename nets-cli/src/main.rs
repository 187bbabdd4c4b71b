//! nets-cli - Command-line client for nets servers
//!
//! Sends raw or framed messages to a server and prints what comes back.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::Session;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nets-cli")]
#[command(about = "Command-line client for nets servers")]
#[command(version)]
struct Cli {
    /// Server address (scheme://host:port)
    #[arg(short, long, env = "NETS_SERVER", default_value = "tcp://127.0.0.1:7527")]
    server: String,

    /// How long to wait for each reply, in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send "ping" and print the echo with its round-trip time
    Ping,

    /// Send a message and print the reply
    Send {
        /// Message to send
        message: String,

        /// Wrap the message in a checksummed packet
        #[arg(short, long)]
        framed: bool,

        /// Number of times to send the message
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    let mut session = Session::open(&cli.server, timeout).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&mut session, cli.command).await;
    session.close().await;

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
