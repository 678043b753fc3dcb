//! Versioned framing of Raft messages exchanged between members.
//!
//! A frame is `[u32 length][u16 version][16 byte sender id][protobuf Message]`, where the length covers everything
//! after itself. The version is checked before any of the body is decoded, so members speaking an unknown protocol
//! version are rejected without interpreting their bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;

use crate::error::WireError;
use crate::member::MemberId;
use crate::message::{Message, RaftMessage};

pub const PROTOCOL_VERSION: u16 = 1;

/// The largest frame accepted, to bound allocation on a corrupt length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LENGTH_LEN: usize = 4;
const HEADER_LEN: usize = 2 + 16;

/// Encodes a message from `from` into a complete frame. Timeouts are local to a member and cannot be encoded.
pub fn encode(from: MemberId, message: &RaftMessage, buf: &mut BytesMut) -> Result<(), WireError> {
    let message = match message {
        RaftMessage::Message(message) => message,
        timeout => return Err(WireError::NotWireable(timeout.kind())),
    };
    encode_message(from, message, buf)
}

pub fn encode_message(from: MemberId, message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
    let body_len = message.encoded_len();
    let frame_len = HEADER_LEN + body_len;
    if frame_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(frame_len));
    }
    buf.reserve(LENGTH_LEN + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_u16(PROTOCOL_VERSION);
    buf.put_slice(from.as_bytes());
    message.encode(buf)?;
    Ok(())
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything when `buf` does not yet hold a complete frame.
pub fn decode(buf: &mut BytesMut) -> Result<Option<(MemberId, Message)>, WireError> {
    if buf.len() < LENGTH_LEN + 2 {
        return Ok(None);
    }
    let frame_len = (&buf[..LENGTH_LEN]).get_u32() as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(frame_len));
    }
    let version = (&buf[LENGTH_LEN..LENGTH_LEN + 2]).get_u16();
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion {
            found: version,
            expected: PROTOCOL_VERSION,
        });
    }
    if frame_len < HEADER_LEN {
        return Err(WireError::MissingBody);
    }
    if buf.len() < LENGTH_LEN + frame_len {
        return Ok(None);
    }

    buf.advance(LENGTH_LEN + 2);
    let mut frame = buf.split_to(frame_len - 2).freeze();
    let from = MemberId::from_slice(&frame.split_to(16)).ok_or(WireError::InvalidMemberId)?;
    let message = Message::decode(frame)?;
    if message.rpc.is_none() {
        return Err(WireError::MissingBody);
    }
    Ok(Some((from, message)))
}

/// Decodes a buffer holding exactly one frame.
pub fn decode_frame(frame: Bytes) -> Result<(MemberId, Message), WireError> {
    let mut buf = BytesMut::from(&frame[..]);
    decode(&mut buf)?.ok_or_else(|| WireError::Incomplete {
        needed: missing_len(&frame),
    })
}

fn missing_len(frame: &[u8]) -> usize {
    if frame.len() < LENGTH_LEN + 2 {
        return LENGTH_LEN + 2 - frame.len();
    }
    let frame_len = (&frame[..LENGTH_LEN]).get_u32() as usize;
    (LENGTH_LEN + frame_len).saturating_sub(frame.len())
}
