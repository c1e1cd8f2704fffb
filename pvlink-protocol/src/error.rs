//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors from framing, segmentation, or message handling.
///
/// Every variant except `Json` and `Io` is a protocol violation: on a stream
/// transport the connection must be closed (byte alignment cannot be
/// recovered), on a datagram transport the packet is discarded and assembly
/// state reset.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'PVLK', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("segment too large: {size} bytes (max {max})")]
    SegmentTooLarge { size: usize, max: usize },

    #[error("reassembled message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("segment sequence violation: {0}")]
    SegmentSequence(&'static str),

    #[error("opcode changed mid-message: started {started:#04x}, got {got:#04x}")]
    OpcodeChanged { started: u8, got: u8 },

    #[error("truncated payload: need {needed} more bytes")]
    TruncatedPayload { needed: usize },

    #[error("invalid status code: {0:#04x}")]
    InvalidStatusCode(u8),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error is a wire-level violation that requires
    /// closing a stream transport.
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::Json(_) | ProtocolError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_classification() {
        assert!(ProtocolError::InvalidMagic(*b"XXXX").is_violation());
        assert!(ProtocolError::SegmentSequence("middle without first").is_violation());
        assert!(ProtocolError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_violation());
        assert!(!ProtocolError::Io(std::io::Error::other("boom")).is_violation());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::OpcodeChanged {
            started: 0x10,
            got: 0x20,
        };
        assert!(err.to_string().contains("0x10"));

        let err = ProtocolError::MessageTooLarge {
            size: 100,
            max: 50,
        };
        assert!(err.to_string().contains("100"));
    }
}
