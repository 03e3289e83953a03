//! Pure pack/unpack functions for the six TFTP opcodes (RFC 1350 + RFC 2347).

use std::collections::HashMap;
use std::fmt;

use crate::error::ErrorKind;

/// TFTP opcodes, RFC 1350 §5 plus RFC 2347's OACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
            Opcode::Oack => "OACK",
        };
        f.write_str(s)
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: HashMap<String, String>,
    },
    Wrq {
        filename: String,
        mode: String,
        options: HashMap<String, String>,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    /// Option acknowledgment (RFC 2347).
    Oack {
        options: HashMap<String, String>,
    },
}

/// Error returned when a datagram cannot be decoded as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet too short")]
    TooShort,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    #[error("invalid utf-8 in packet field")]
    InvalidUtf8,
}

impl Packet {
    /// Build an ERROR packet from a catalogue entry, optionally overriding
    /// its default message.
    pub fn error(kind: ErrorKind, message: impl Into<Option<String>>) -> Self {
        Packet::Error {
            code: kind.code(),
            message: message.into().unwrap_or_else(|| kind.default_message().to_string()),
        }
    }

    /// Parse raw bytes into a `Packet`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::TooShort);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match Opcode::from_u16(opcode) {
            Some(Opcode::Rrq) => decode_request(buf, true),
            Some(Opcode::Wrq) => decode_request(buf, false),
            Some(Opcode::Data) => decode_data(buf),
            Some(Opcode::Ack) => decode_ack(buf),
            Some(Opcode::Error) => decode_error(buf),
            Some(Opcode::Oack) => decode_oack(buf),
            None => Err(DecodeError::UnknownOpcode(opcode)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Rrq { filename, mode, options } => {
                encode_request(Opcode::Rrq, filename, mode, options)
            }
            Packet::Wrq { filename, mode, options } => {
                encode_request(Opcode::Wrq, filename, mode, options)
            }
            Packet::Data { block, payload } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
            Packet::Oack { options } => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&(Opcode::Oack as u16).to_be_bytes());
                for (key, val) in options {
                    buf.extend_from_slice(key.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(val.as_bytes());
                    buf.push(0);
                }
                buf
            }
        }
    }

    /// The opcode this packet would serialize to. Used by the connection
    /// state machine to compare against `lastop` without re-encoding.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal decoding helpers
// ---------------------------------------------------------------------------

/// RRQ / WRQ: 2-byte opcode | filename\0 | mode\0 [| option\0 | value\0 ]*
fn decode_request(buf: &[u8], is_rrq: bool) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();

    if fields.len() < 2 {
        return Err(DecodeError::MalformedRequest("missing filename or mode"));
    }

    let filename = String::from_utf8(fields[0].to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
    let mode = String::from_utf8(fields[1].to_vec())
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_ascii_lowercase();

    if filename.is_empty() {
        return Err(DecodeError::MalformedRequest("empty filename"));
    }

    // RFC 2347 options: trailing key\0value\0 pairs. A dangling key with no
    // value is tolerated and yields an empty string (decoding is tolerant).
    let mut options = HashMap::new();
    let mut i = 2;
    while i < fields.len() {
        let key = String::from_utf8(fields[i].to_vec())
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_ascii_lowercase();
        if key.is_empty() {
            break;
        }
        let val = match fields.get(i + 1) {
            Some(bytes) => String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?,
            None => String::new(),
        };
        options.insert(key, val);
        i += 2;
    }

    if is_rrq {
        Ok(Packet::Rrq { filename, mode, options })
    } else {
        Ok(Packet::Wrq { filename, mode, options })
    }
}

/// DATA: 2-byte opcode | 2-byte block# | 0..N bytes
fn decode_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort);
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::Data { block, payload: buf[4..].to_vec() })
}

/// ACK: 2-byte opcode | 2-byte block#. Trailing bytes are ignored.
fn decode_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort);
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::Ack { block })
}

/// ERROR: 2-byte opcode | 2-byte code | msg\0. Trailing bytes after the NUL
/// are ignored, and a missing NUL is tolerated.
fn decode_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::TooShort);
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes.iter().position(|&b| b == 0).unwrap_or(msg_bytes.len());
    let message = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::Error { code, message })
}

/// OACK: 2-byte opcode | [option\0 | value\0]*
fn decode_oack(buf: &[u8]) -> Result<Packet, DecodeError> {
    let payload = &buf[2..];
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    let mut options = HashMap::new();
    let mut i = 0;
    while i + 1 < fields.len() {
        let key = String::from_utf8(fields[i].to_vec())
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_ascii_lowercase();
        let val = String::from_utf8(fields[i + 1].to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
        if !key.is_empty() {
            options.insert(key, val);
        }
        i += 2;
    }
    Ok(Packet::Oack { options })
}

fn encode_request(opcode: Opcode, filename: &str, mode: &str, options: &HashMap<String, String>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&(opcode as u16).to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    for (key, val) in options {
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(val.as_bytes());
        buf.push(0);
    }
    buf
}
