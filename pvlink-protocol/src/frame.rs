//! Binary frame format for PVP.
//!
//! Frame layout (18 bytes header + payload):
//!
//! ```text
//! +--------+---------+--------+--------+----------+-------------+--------+
//! | magic  | version | flags  | opcode | reserved | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes | 1 byte |  1 byte  |   4 bytes   | 4 bytes|
//! +--------+---------+--------+--------+----------+-------------+--------+
//! | payload                                                              |
//! | payload_len bytes                                                    |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! One frame carries one segment of a message. Messages no larger than the
//! segment capacity travel as a single `Whole` frame; larger ones are split
//! into `First`, zero or more `Middle`, and a final `Last` frame, each
//! carrying the message's opcode so a datagram receiver can account for
//! fragments it discards.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying PVP frames: "PVLK"
pub const MAGIC: [u8; 4] = *b"PVLK";

/// Size of the fixed frame header in bytes (4+2+2+1+1+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Where a frame sits in its message's segment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentPosition {
    /// The entire message fits in this frame.
    #[default]
    Whole,
    /// First segment of a multi-segment message.
    First,
    /// Interior segment.
    Middle,
    /// Final segment; the message is complete after this frame.
    Last,
}

impl SegmentPosition {
    fn bits(self) -> u16 {
        match self {
            SegmentPosition::Whole => 0b00,
            SegmentPosition::First => 0b01,
            SegmentPosition::Middle => 0b10,
            SegmentPosition::Last => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => SegmentPosition::Whole,
            0b01 => SegmentPosition::First,
            0b10 => SegmentPosition::Middle,
            _ => SegmentPosition::Last,
        }
    }
}

/// Frame flags bitfield.
///
/// Bit 0 is CRC presence; bits 1-2 encode the segment position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Mask for the 2-bit segment position field.
    const SEGMENT_MASK: u16 = 0b11 << 1;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u16 = 0x0007;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_segment(mut self, position: SegmentPosition) -> Self {
        self.0 = (self.0 & !Self::SEGMENT_MASK) | (position.bits() << 1);
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn segment(&self) -> SegmentPosition {
        SegmentPosition::from_bits((self.0 & Self::SEGMENT_MASK) >> 1)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed PVP frame: one segment of a message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol version.
    pub version: u16,
    /// Frame flags (CRC presence, segment position).
    pub flags: FrameFlags,
    /// Message opcode; repeated on every segment.
    pub opcode: u8,
    /// Segment payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a whole-message frame with the given opcode and payload.
    pub fn new(opcode: u8, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            opcode,
            payload,
        }
    }

    /// Creates a segment frame at the given position.
    pub fn segment(opcode: u8, position: SegmentPosition, payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc().with_segment(position),
            opcode,
            payload,
        }
    }

    /// Encodes the frame into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.opcode);
        buf.put_u8(0); // reserved
        buf.put_u32(self.payload.len() as u32);
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);
    }

    /// Encodes the frame into fresh bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// `max_segment` bounds the accepted payload length.
    pub fn decode(buf: &mut BytesMut, max_segment: usize) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags_bits = u16::from_be_bytes([buf[6], buf[7]]);
        let flags = FrameFlags::from_bits(flags_bits)?;

        let opcode = buf[8];
        let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;
        if payload_len > max_segment {
            return Err(ProtocolError::SegmentTooLarge {
                size: payload_len,
                max: max_segment,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            opcode,
            payload,
        }))
    }
}
