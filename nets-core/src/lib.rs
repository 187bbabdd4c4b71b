//! # nets-core
//!
//! Connection runtime shared by the nets server and client.
//!
//! This crate provides:
//! - Per-connection read loops that accumulate inbound bytes
//! - Handler callback traits with panic isolation
//! - Service lifecycle state and live-connection accounting
//! - A pooled buffer allocator for reads and accumulators
//! - Address parsing and socket helpers

pub mod addr;
pub mod connection;
pub mod error;
pub mod fault;
pub mod handler;
pub mod lifecycle;
pub mod pool;
pub mod socket;

pub use addr::{Network, ProtoAddr};
pub use connection::Connection;
pub use error::NetError;
pub use fault::{catch_fault, guard_callback};
pub use handler::ConnHandler;
pub use lifecycle::{run_ticker, Lifecycle};
pub use pool::{BufferPool, ACCUMULATOR_RETAIN_FACTOR, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_IDLE};
pub use socket::{dial, listen, ListenControl, SocketOptions};
