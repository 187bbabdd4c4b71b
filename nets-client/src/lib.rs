//! # nets-client
//!
//! TCP client for nets.
//!
//! Dialed connections run on the same runtime as server-side ones: each
//! gets a read loop, pooled buffers and the handler callbacks from
//! [`nets_core::ConnHandler`].

pub mod client;
pub mod handler;

pub use client::{Client, ClientConfig};
pub use handler::ClientHandler;
