//! # nets-protocol
//!
//! Wire protocol implementation for nets.
//!
//! This crate provides:
//! - Binary packet framing with a 16-bit mark, length prefix and CRC-16 validation
//! - A self-resynchronizing decoder for corrupted or partial byte streams
//! - A buffered stream decoder for connection handlers
//! - Protocol error types

pub mod codec;
pub mod crc;
pub mod error;
pub mod packet;

pub use codec::StreamDecoder;
pub use crc::crc16;
pub use error::ProtocolError;
pub use packet::{Codec, Decoded, Packet, HEADER_SIZE, MARK};

/// Maximum declared payload size accepted by the default codec (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
