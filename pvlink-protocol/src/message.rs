//! Message envelopes, opcodes, and status payloads.
//!
//! A [`Message`] is the unit the application sees: one opcode plus one
//! payload, however many segments it crossed on the wire. Control-plane
//! bodies (the HELLO handshake) are JSON; data-plane payloads are binary,
//! assembled by the client and server crates using the introspection cache.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

/// PVP operation codes, carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Session handshake; JSON body.
    Hello = 0x01,
    /// Diagnostic echo; payload returned verbatim.
    Echo = 0x02,
    /// Read a channel's current value.
    ChannelGet = 0x10,
    /// Write a channel's value.
    ChannelPut = 0x11,
    /// Start a subscription; the request id becomes the subscription id.
    MonitorStart = 0x20,
    /// One subscription update (server to client, unsolicited).
    MonitorEvent = 0x21,
    /// Tear a subscription down.
    MonitorStop = 0x22,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x01 => Ok(Opcode::Hello),
            0x02 => Ok(Opcode::Echo),
            0x10 => Ok(Opcode::ChannelGet),
            0x11 => Ok(Opcode::ChannelPut),
            0x20 => Ok(Opcode::MonitorStart),
            0x21 => Ok(Opcode::MonitorEvent),
            0x22 => Ok(Opcode::MonitorStop),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// One application message: opcode plus fully reassembled payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, payload: Bytes) -> Self {
        Self { opcode, payload }
    }
}

/// Severity of a status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    Warning = 0x01,
    Error = 0x02,
}

impl StatusCode {
    fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x00 => Ok(StatusCode::Ok),
            0x01 => Ok(StatusCode::Warning),
            0x02 => Ok(StatusCode::Error),
            other => Err(ProtocolError::InvalidStatusCode(other)),
        }
    }
}

/// Binary status carried in every response payload.
///
/// Network-origin failures travel as data through this type, never as
/// thrown control flow across the connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Warning,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code != StatusCode::Error
    }

    /// Encodes as a code byte plus a u16-length-prefixed message (zero
    /// length means no message).
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.code as u8);
        match &self.message {
            Some(msg) => {
                buf.put_u16(msg.len() as u16);
                buf.put_slice(msg.as_bytes());
            }
            None => buf.put_u16(0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 3 {
            return Err(ProtocolError::TruncatedPayload {
                needed: 3 - buf.remaining(),
            });
        }
        let code = StatusCode::from_code(buf.get_u8())?;
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(ProtocolError::TruncatedPayload {
                needed: len - buf.remaining(),
            });
        }
        let message = if len == 0 {
            None
        } else {
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            Some(String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?)
        };
        Ok(Self { code, message })
    }
}

/// JSON body of the HELLO handshake, sent by both peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloBody {
    pub protocol_version: u16,
    #[serde(default)]
    pub peer_name: Option<String>,
}

impl HelloBody {
    pub fn new(peer_name: Option<String>) -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            peer_name,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
