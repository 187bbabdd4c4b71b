//! Buffered packet decoding over a byte stream.

use crate::error::ProtocolError;
use crate::packet::{Codec, Decoded, Packet};
use bytes::{Buf, BytesMut};

/// Accumulates stream bytes and yields packets as they complete.
///
/// Bytes must be appended in stream order. Garbage in front of a packet is
/// discarded silently; a corrupt frame is discarded one byte at a time, and
/// each discard is reported so the caller can log it before continuing.
pub struct StreamDecoder {
    codec: Codec,
    buffer: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_codec(Codec::default())
    }

    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. An `Err` means a corrupt
    /// frame was skipped; calling again continues scanning after it.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        loop {
            match self.codec.decode(&self.buffer) {
                Decoded::Packet { packet, consumed } => {
                    self.buffer.advance(consumed);
                    return Ok(Some(packet));
                }
                Decoded::Pending { consumed: 0 } => return Ok(None),
                Decoded::Pending { consumed } => self.buffer.advance(consumed),
                Decoded::Corrupt { consumed, error } => {
                    self.buffer.advance(consumed);
                    return Err(error);
                }
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
