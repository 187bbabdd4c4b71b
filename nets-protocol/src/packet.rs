//! Binary packet format.
//!
//! Packet layout (12 bytes header + payload), all fields big-endian:
//!
//! ```text
//! +--------+----------+-------------+---------+
//! |  mark  | checksum |   length    | serial  |
//! | 2 bytes|  2 bytes |   4 bytes   | 4 bytes |
//! +--------+----------+-------------+---------+
//! | payload                                   |
//! | length bytes                              |
//! +-------------------------------------------+
//! ```
//!
//! The checksum is a CRC-16 over the payload only. The mark doubles as the
//! resynchronization anchor: after corruption the decoder scans forward for
//! the next occurrence of its two bytes.

use crate::crc::crc16;
use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

/// Default packet mark.
pub const MARK: u16 = 0x7527;

/// Size of the fixed packet header in bytes (2+2+4+4 = 12).
pub const HEADER_SIZE: usize = 12;

/// A single protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    mark: u16,
    checksum: u16,
    serial: u32,
    payload: Bytes,
}

impl Packet {
    /// Creates a packet with the default mark, computing the checksum.
    pub fn new(serial: u32, payload: impl Into<Bytes>) -> Self {
        Self::with_mark(MARK, serial, payload)
    }

    /// Creates a packet with a custom mark, computing the checksum.
    pub fn with_mark(mark: u16, serial: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            mark,
            checksum: crc16(&payload),
            serial,
            payload,
        }
    }

    pub fn mark(&self) -> u16 {
        self.mark
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Payload length as carried on the wire.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns whether the checksum matches the payload.
    pub fn verify(&self) -> bool {
        crc16(&self.payload) == self.checksum
    }

    /// Total size of the encoded packet.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Result of a single [`Codec::decode`] call.
///
/// Every variant reports how many bytes the caller can discard from the
/// front of its buffer. Only `Pending { consumed: 0 }` makes no progress;
/// it means the caller must append more data before decoding again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, verified packet. `consumed` includes any skipped garbage.
    Packet { packet: Packet, consumed: usize },
    /// No packet available yet.
    Pending { consumed: usize },
    /// A frame at the scanned mark failed validation; skip `consumed` bytes
    /// and decode again to resynchronize.
    Corrupt {
        consumed: usize,
        error: ProtocolError,
    },
}

impl Decoded {
    /// Bytes the caller should drop from the front of its buffer.
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Packet { consumed, .. }
            | Decoded::Pending { consumed }
            | Decoded::Corrupt { consumed, .. } => *consumed,
        }
    }

    /// Returns the packet, if one was decoded.
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            Decoded::Packet { packet, .. } => Some(packet),
            _ => None,
        }
    }
}

/// Packet encoder/decoder bound to a mark constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    mark: u16,
    mark_bytes: [u8; 2],
    max_payload: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MARK)
    }
}

impl Codec {
    pub fn new(mark: u16) -> Self {
        Self {
            mark,
            mark_bytes: mark.to_be_bytes(),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Sets the largest payload length accepted in either direction.
    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn mark(&self) -> u16 {
        self.mark
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Builds a packet carrying this codec's mark.
    pub fn packet(&self, serial: u32, payload: impl Into<Bytes>) -> Packet {
        Packet::with_mark(self.mark, serial, payload)
    }

    /// Encodes a packet into a new buffer.
    pub fn encode(&self, packet: &Packet) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(packet.encoded_len());
        self.encode_into(packet, &mut buf)?;
        Ok(buf)
    }

    /// Appends an encoded packet to `buf`.
    ///
    /// The checksum is recomputed from the payload, so the written frame
    /// always verifies.
    pub fn encode_into(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if packet.mark != self.mark {
            return Err(ProtocolError::InvalidMark {
                expected: self.mark,
                actual: packet.mark,
            });
        }

        let size = packet.payload.len() as u64;
        if size > self.max_payload as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_payload,
            });
        }

        buf.reserve(packet.encoded_len());
        buf.put_u16(self.mark);
        buf.put_u16(crc16(&packet.payload));
        buf.put_u32(size as u32);
        buf.put_u32(packet.serial);
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// Decodes the first packet found in `buf`.
    ///
    /// Leading bytes that cannot start a packet are reported as consumed so
    /// the caller can discard them. When no mark is present the last byte is
    /// kept, since it may be the first half of a mark completed by the next
    /// read.
    ///
    /// A mark with less than a full header behind it always reads as "need
    /// more data" (`Pending { consumed: 0 }`), even if it is a chance match
    /// inside payload bytes.
    pub fn decode(&self, buf: &[u8]) -> Decoded {
        let skip = match find_mark(buf, &self.mark_bytes) {
            Some(index) => index,
            None => {
                return Decoded::Pending {
                    consumed: buf.len().saturating_sub(1),
                }
            }
        };

        let frame = &buf[skip..];
        if frame.len() < HEADER_SIZE {
            return Decoded::Pending { consumed: 0 };
        }

        let mark = u16::from_be_bytes([frame[0], frame[1]]);
        if mark != self.mark {
            return Decoded::Pending { consumed: skip + 1 };
        }

        let checksum = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let serial = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]);

        if length > self.max_payload {
            return Decoded::Corrupt {
                consumed: skip + 1,
                error: ProtocolError::FrameTooLarge {
                    size: length as u64,
                    max: self.max_payload,
                },
            };
        }

        let total = HEADER_SIZE + length as usize;
        if frame.len() < total {
            return Decoded::Pending { consumed: skip };
        }

        let payload = Bytes::copy_from_slice(&frame[HEADER_SIZE..total]);
        let actual = crc16(&payload);
        if actual != checksum {
            return Decoded::Corrupt {
                consumed: skip + 1,
                error: ProtocolError::ChecksumMismatch {
                    expected: checksum,
                    actual,
                },
            };
        }

        Decoded::Packet {
            packet: Packet {
                mark,
                checksum,
                serial,
                payload,
            },
            consumed: skip + total,
        }
    }
}

fn find_mark(buf: &[u8], mark: &[u8; 2]) -> Option<usize> {
    buf.windows(2).position(|w| w == mark)
}
