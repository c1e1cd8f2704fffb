//! Message segmentation, reassembly, and stream decoding.
//!
//! The pieces compose rather than inherit: [`MessageEncoder`] splits
//! oversized payloads into segments, [`FrameAssembler`] is the
//! discipline-agnostic reassembly state machine, [`MessageDecoder`] feeds it
//! from a byte stream, and [`DatagramDecoder`] feeds it from independent
//! packets with discard-and-resync error handling.

use crate::error::ProtocolError;
use crate::frame::{Frame, SegmentPosition};
use crate::message::{Message, Opcode};
use bytes::{Bytes, BytesMut};

/// Framing parameters.
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    /// Maximum payload bytes per segment. Messages above this are split.
    pub segment_capacity: usize,
    /// Maximum reassembled message size.
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            segment_capacity: crate::DEFAULT_SEGMENT_CAPACITY,
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl CodecConfig {
    pub fn new(segment_capacity: usize, max_message_size: usize) -> Self {
        Self {
            // A zero-capacity segment could never carry payload
            segment_capacity: segment_capacity.max(1),
            max_message_size: max_message_size.max(segment_capacity),
        }
    }
}

/// Splits messages into wire frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageEncoder {
    config: CodecConfig,
}

impl MessageEncoder {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Encodes `message` into `out`, splitting into first/middle/last
    /// segments when the payload exceeds the segment capacity.
    pub fn encode(&self, message: &Message, out: &mut BytesMut) {
        let opcode = message.opcode.code();
        let payload = &message.payload;

        if payload.len() <= self.config.segment_capacity {
            Frame::segment(opcode, SegmentPosition::Whole, payload.clone()).encode_into(out);
            return;
        }

        let mut offset = 0;
        let mut first = true;
        while offset < payload.len() {
            let end = (offset + self.config.segment_capacity).min(payload.len());
            let position = if first {
                SegmentPosition::First
            } else if end == payload.len() {
                SegmentPosition::Last
            } else {
                SegmentPosition::Middle
            };
            Frame::segment(opcode, position, payload.slice(offset..end)).encode_into(out);
            first = false;
            offset = end;
        }
    }

    /// Number of frames `payload_len` bytes will occupy.
    pub fn segment_count(&self, payload_len: usize) -> usize {
        if payload_len <= self.config.segment_capacity {
            1
        } else {
            payload_len.div_ceil(self.config.segment_capacity)
        }
    }
}

/// In-progress reassembly of one segmented message.
#[derive(Debug)]
struct Assembly {
    opcode: Opcode,
    buf: BytesMut,
}

/// Discipline-agnostic reassembly state machine.
///
/// At most one message is assembled per direction at a time;
/// out-of-sequence segment markers are protocol violations. A partially
/// received message is never surfaced.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    config: CodecConfig,
    pending: Option<Assembly>,
}

impl FrameAssembler {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    /// Feeds one frame in. Returns a complete message when the frame closes
    /// one, `None` while assembly continues.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let opcode = Opcode::from_code(frame.opcode)?;
        match frame.flags.segment() {
            SegmentPosition::Whole => {
                if self.pending.is_some() {
                    return Err(ProtocolError::SegmentSequence(
                        "whole message while another is being assembled",
                    ));
                }
                if frame.payload.len() > self.config.max_message_size {
                    return Err(ProtocolError::MessageTooLarge {
                        size: frame.payload.len(),
                        max: self.config.max_message_size,
                    });
                }
                Ok(Some(Message::new(opcode, frame.payload)))
            }
            SegmentPosition::First => {
                if self.pending.is_some() {
                    return Err(ProtocolError::SegmentSequence(
                        "first segment while another message is being assembled",
                    ));
                }
                let mut buf = BytesMut::with_capacity(frame.payload.len() * 2);
                buf.extend_from_slice(&frame.payload);
                self.pending = Some(Assembly { opcode, buf });
                Ok(None)
            }
            SegmentPosition::Middle => {
                self.append(opcode, &frame.payload, "middle segment with no assembly in progress")?;
                Ok(None)
            }
            SegmentPosition::Last => {
                self.append(opcode, &frame.payload, "last segment with no assembly in progress")?;
                let assembly = self.pending.take().unwrap();
                Ok(Some(Message::new(assembly.opcode, assembly.buf.freeze())))
            }
        }
    }

    fn append(
        &mut self,
        opcode: Opcode,
        payload: &Bytes,
        missing: &'static str,
    ) -> Result<(), ProtocolError> {
        let assembly = self
            .pending
            .as_mut()
            .ok_or(ProtocolError::SegmentSequence(missing))?;
        if assembly.opcode != opcode {
            let started = assembly.opcode.code();
            self.pending = None;
            return Err(ProtocolError::OpcodeChanged {
                started,
                got: opcode.code(),
            });
        }
        if assembly.buf.len() + payload.len() > self.config.max_message_size {
            let size = assembly.buf.len() + payload.len();
            self.pending = None;
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        assembly.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Whether a message is currently being assembled.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Drops any in-progress assembly.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

/// Buffering decoder for stream transports.
///
/// Feed raw bytes in with [`extend`]; pull complete messages out with
/// [`next_message`], in the order they were sent. An error from
/// `next_message` means the stream is desynchronized and the connection
/// must be closed.
///
/// [`extend`]: MessageDecoder::extend
/// [`next_message`]: MessageDecoder::next_message
#[derive(Debug, Default)]
pub struct MessageDecoder {
    config: CodecConfig,
    buffer: BytesMut,
    assembler: FrameAssembler,
}

impl MessageDecoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            buffer: BytesMut::with_capacity(8192),
            assembler: FrameAssembler::new(config),
        }
    }

    /// Appends raw bytes from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete message.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        while let Some(frame) = Frame::decode(&mut self.buffer, self.config.segment_capacity)? {
            if let Some(message) = self.assembler.push(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops buffered bytes and assembly state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.assembler.reset();
    }
}

/// Decoder for datagram transports.
///
/// Each packet is decoded independently; a malformed packet is discarded
/// and assembly state reset so the next packet decodes cleanly, instead of
/// tearing down a connection that does not exist.
#[derive(Debug, Default)]
pub struct DatagramDecoder {
    config: CodecConfig,
    assembler: FrameAssembler,
    discarded: u64,
}

impl DatagramDecoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            assembler: FrameAssembler::new(config),
            discarded: 0,
        }
    }

    /// Decodes every message completed by one packet. A malformed packet
    /// yields nothing and resets read state.
    pub fn decode_packet(&mut self, packet: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(packet);
        let mut messages = Vec::new();
        loop {
            match Frame::decode(&mut buf, self.config.segment_capacity) {
                Ok(Some(frame)) => match self.assembler.push(frame) {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("discarding datagram: {}", e);
                        self.assembler.reset();
                        self.discarded += 1;
                        return messages;
                    }
                },
                // Trailing garbage or a truncated frame both end the packet
                Ok(None) => {
                    if !buf.is_empty() {
                        tracing::debug!("discarding {} trailing bytes in datagram", buf.len());
                        self.discarded += 1;
                    }
                    return messages;
                }
                Err(e) => {
                    tracing::debug!("discarding datagram: {}", e);
                    self.assembler.reset();
                    self.discarded += 1;
                    return messages;
                }
            }
        }
    }

    /// Number of packets discarded for protocol violations.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
