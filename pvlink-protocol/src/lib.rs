//! # pvlink-protocol
//!
//! Wire protocol for pvlink (PVP - pvlink channel protocol).
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Message segmentation and reassembly for oversized payloads
//! - Message envelopes, opcodes, and binary status payloads
//! - Protocol error taxonomy

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{CodecConfig, DatagramDecoder, FrameAssembler, MessageDecoder, MessageEncoder};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, SegmentPosition, FRAME_HEADER_SIZE, MAGIC};
pub use message::{HelloBody, Message, Opcode, Status, StatusCode};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for pvlink servers.
pub const DEFAULT_PORT: u16 = 5085;

/// Maximum payload bytes carried by one segment (64 KiB).
pub const DEFAULT_SEGMENT_CAPACITY: usize = 64 * 1024;

/// Maximum reassembled message size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
