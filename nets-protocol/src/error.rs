//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while framing packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet verification failed: expected checksum {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("invalid packet mark: expected {expected:#06x}, got {actual:#06x}")]
    InvalidMark { expected: u16, actual: u16 },

    #[error("packet too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },
}

impl ProtocolError {
    /// Returns whether the decoder can skip past this error and keep scanning.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. } | ProtocolError::FrameTooLarge { .. }
        )
    }
}
