//! Wire-format definitions for protocol frames.
//!
//! Every datagram exchanged between peers is one [`Message`].  This module is
//! responsible for:
//! - Defining the on-wire text layout (frame tag, sequence number, payload).
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Message`], returning errors
//!   for malformed input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! ASCII text, one frame per datagram, fields separated by whitespace and
//! terminated by a line break:
//!
//! ```text
//! ACK <seqNo>\n
//! DATA <seqNo> <char>\n
//! ```
//!
//! `<seqNo>` is a base-10 unsigned integer; `<char>` is exactly one
//! character.  An acknowledgment carries no payload, so "carries a character
//! iff it is a data frame" is encoded in the [`Message`] enum itself rather
//! than policed at runtime.

use std::net::SocketAddr;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// One character of application data, tagged with its sequence number.
    Data { seq_no: u32, ch: char },
    /// Cumulative acknowledgment: every sequence number up to and including
    /// `seq_no` has been received in order.
    Ack { seq_no: u32 },
}

/// A [`Message`] paired with the peer address it came from / goes to.
///
/// This is the unit exchanged between the multiplexer and the datagram
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressedMessage {
    pub message: Message,
    pub addr: SocketAddr,
}

impl AddressedMessage {
    /// Build a data frame destined for (or received from) `addr`.
    pub fn data(addr: SocketAddr, seq_no: u32, ch: char) -> Self {
        Self {
            message: Message::Data { seq_no, ch },
            addr,
        }
    }

    /// Build an acknowledgment frame destined for (or received from) `addr`.
    pub fn ack(addr: SocketAddr, seq_no: u32) -> Self {
        Self {
            message: Message::Ack { seq_no },
            addr,
        }
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The datagram contained no fields at all.
    #[error("frame has no fields")]
    Empty,
    /// The first field was neither `ACK` nor `DATA`.
    #[error("unknown frame tag {0:?}")]
    UnknownTag(String),
    /// An `ACK` frame must have exactly 2 fields, a `DATA` frame exactly 3.
    #[error("{tag} frame has {got} field(s), expected {expected}")]
    FieldCount {
        tag: &'static str,
        got: usize,
        expected: usize,
    },
    /// The sequence-number field is not a valid base-10 unsigned integer.
    #[error("invalid sequence number {0:?}")]
    BadSeqNo(String),
    /// A `DATA` payload must be exactly one character.
    #[error("DATA payload {0:?} is not a single character")]
    BadPayload(String),
}

impl Message {
    /// Sequence number carried by this frame, whichever kind it is.
    pub fn seq_no(&self) -> u32 {
        match *self {
            Message::Data { seq_no, .. } | Message::Ack { seq_no } => seq_no,
        }
    }

    /// `true` for acknowledgment frames.
    pub fn is_ack(&self) -> bool {
        matches!(self, Message::Ack { .. })
    }

    /// Serialise this frame into its wire text form.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Message::Ack { seq_no } => format!("ACK {seq_no}\n").into_bytes(),
            Message::Data { seq_no, ch } => format!("DATA {seq_no} {ch}\n").into_bytes(),
        }
    }

    /// Parse a frame from a raw byte slice.
    ///
    /// Splitting is whitespace-based, so the trailing line break (and any
    /// other surrounding whitespace) is tolerated.  See [`MessageError`] for
    /// the reject conditions.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let text = String::from_utf8_lossy(buf);
        let fields: Vec<&str> = text.split_whitespace().collect();

        let Some(&tag) = fields.first() else {
            return Err(MessageError::Empty);
        };

        match tag {
            "ACK" => {
                if fields.len() != 2 {
                    return Err(MessageError::FieldCount {
                        tag: "ACK",
                        got: fields.len(),
                        expected: 2,
                    });
                }
                let seq_no = parse_seq_no(fields[1])?;
                Ok(Message::Ack { seq_no })
            }
            "DATA" => {
                if fields.len() != 3 {
                    return Err(MessageError::FieldCount {
                        tag: "DATA",
                        got: fields.len(),
                        expected: 3,
                    });
                }
                let seq_no = parse_seq_no(fields[1])?;
                let mut chars = fields[2].chars();
                let ch = chars
                    .next()
                    .ok_or_else(|| MessageError::BadPayload(fields[2].to_string()))?;
                if chars.next().is_some() {
                    return Err(MessageError::BadPayload(fields[2].to_string()));
                }
                Ok(Message::Data { seq_no, ch })
            }
            other => Err(MessageError::UnknownTag(other.to_string())),
        }
    }
}

fn parse_seq_no(field: &str) -> Result<u32, MessageError> {
    field
        .parse::<u32>()
        .map_err(|_| MessageError::BadSeqNo(field.to_string()))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
