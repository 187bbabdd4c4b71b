//! # nets-server
//!
//! TCP server for nets.
//!
//! This crate provides:
//! - An accept loop that wraps every inbound socket in a [`Connection`]
//! - Boot, shutdown and periodic tick callbacks
//! - Live connection accounting
//! - YAML and environment based configuration
//!
//! [`Connection`]: nets_core::Connection

pub mod config;
pub mod handler;
pub mod server;

pub use config::{BufferConfig, Config, ConfigError, NetworkConfig, ProtocolConfig, TickConfig};
pub use handler::ServerHandler;
pub use server::{Server, ServerConfig};
