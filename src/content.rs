//! Content replicated through the Raft log.
//!
//! Every [`LogEntry`](crate::log::LogEntry) carries one marshalled [`ReplicatedContent`]: a single type byte followed
//! by the body of that type. Token requests use a fixed framing of big-endian `i32` fields shared between buffers and
//! byte channels, so the same bytes can be produced by [`ReplicatedTokenRequest::marshal`] and
//! [`ReplicatedTokenRequest::write_to`].

use std::convert::TryFrom;
use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::MarshalError;
use crate::member::{MemberId, MemberSet};
use crate::token::TokenType;

const MEMBERSHIP: u8 = 1;
const TOKEN_REQUEST: u8 = 2;
const BARRIER: u8 = 3;
const DISTRIBUTED_OPERATION: u8 = 4;

/// Content of a single entry in the distributed log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplicatedContent {
    /// The set of voting members, effective once committed.
    Membership(MemberSet),
    /// A request to allocate an id for a token name.
    TokenRequest(ReplicatedTokenRequest),
    /// An empty entry appended by a new leader so that entries from earlier terms can commit.
    Barrier,
    /// Content proposed by a replicator, tagged so that only the proposer resolves the result.
    DistributedOperation(DistributedOperation),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistributedOperation {
    /// The global session of the proposing replicator.
    pub session: Uuid,
    /// The operation id, local to `session`.
    pub operation_id: u64,
    pub content: Box<ReplicatedContent>,
}

/// A request to create a token with a name, carrying the store command that creates it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicatedTokenRequest {
    pub token_type: TokenType,
    pub token_name: String,
    pub command_bytes: Bytes,
}

//
// ReplicatedContent impls
//

impl ReplicatedContent {
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn unmarshal(mut buf: impl Buf) -> Result<Self, MarshalError> {
        Self::decode(&mut buf)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ReplicatedContent::Membership(members) => {
                buf.put_u8(MEMBERSHIP);
                buf.put_i32(members.len() as i32);
                for member in members {
                    buf.put_slice(member.as_bytes());
                }
            }
            ReplicatedContent::TokenRequest(request) => {
                buf.put_u8(TOKEN_REQUEST);
                request.marshal(buf);
            }
            ReplicatedContent::Barrier => buf.put_u8(BARRIER),
            ReplicatedContent::DistributedOperation(operation) => {
                buf.put_u8(DISTRIBUTED_OPERATION);
                buf.put_slice(operation.session.as_bytes());
                buf.put_u64(operation.operation_id);
                operation.content.encode(buf);
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self, MarshalError> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            MEMBERSHIP => {
                let count = get_length(buf)?;
                let mut members = MemberSet::new();
                for _ in 0..count {
                    ensure(buf, 16)?;
                    let mut bytes = [0; 16];
                    buf.copy_to_slice(&mut bytes);
                    members.insert(MemberId::from_uuid(Uuid::from_bytes(bytes)));
                }
                Ok(ReplicatedContent::Membership(members))
            }
            TOKEN_REQUEST => Ok(ReplicatedContent::TokenRequest(
                ReplicatedTokenRequest::unmarshal(buf)?,
            )),
            BARRIER => Ok(ReplicatedContent::Barrier),
            DISTRIBUTED_OPERATION => {
                ensure(buf, 16 + 8)?;
                let mut session = [0; 16];
                buf.copy_to_slice(&mut session);
                let operation_id = buf.get_u64();
                let content = Self::decode(buf)?;
                Ok(ReplicatedContent::DistributedOperation(DistributedOperation {
                    session: Uuid::from_bytes(session),
                    operation_id,
                    content: Box::new(content),
                }))
            }
            content_type => Err(MarshalError::UnknownContentType(content_type)),
        }
    }

    /// Returns the content inside any [`DistributedOperation`] wrapping.
    pub fn unwrap_operation(&self) -> &ReplicatedContent {
        match self {
            ReplicatedContent::DistributedOperation(operation) => operation.content.unwrap_operation(),
            content => content,
        }
    }
}

//
// ReplicatedTokenRequest impls
//

impl ReplicatedTokenRequest {
    pub fn new(token_type: TokenType, token_name: impl Into<String>, command_bytes: impl Into<Bytes>) -> Self {
        Self {
            token_type,
            token_name: token_name.into(),
            command_bytes: command_bytes.into(),
        }
    }

    pub fn marshal(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.token_type.ordinal());
        buf.put_i32(self.token_name.len() as i32);
        buf.put_slice(self.token_name.as_bytes());
        buf.put_i32(self.command_bytes.len() as i32);
        buf.put_slice(&self.command_bytes);
    }

    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, MarshalError> {
        ensure(buf, 4)?;
        let token_type = TokenType::from_ordinal(buf.get_i32())?;
        let name_len = get_length(buf)?;
        ensure(buf, name_len)?;
        let token_name = String::from_utf8(buf.copy_to_bytes(name_len).to_vec())?;
        let command_len = get_length(buf)?;
        ensure(buf, command_len)?;
        let command_bytes = buf.copy_to_bytes(command_len);
        Ok(Self {
            token_type,
            token_name,
            command_bytes,
        })
    }

    /// Writes the same framing as [`marshal`](Self::marshal) to a byte channel.
    pub fn write_to(&self, channel: &mut impl io::Write) -> Result<(), MarshalError> {
        channel.write_i32::<BigEndian>(self.token_type.ordinal())?;
        channel.write_i32::<BigEndian>(self.token_name.len() as i32)?;
        channel.write_all(self.token_name.as_bytes())?;
        channel.write_i32::<BigEndian>(self.command_bytes.len() as i32)?;
        channel.write_all(&self.command_bytes)?;
        Ok(())
    }

    pub fn read_from(channel: &mut impl io::Read) -> Result<Self, MarshalError> {
        let token_type = TokenType::from_ordinal(channel.read_i32::<BigEndian>()?)?;
        let name = read_chunk(channel)?;
        let command = read_chunk(channel)?;
        Ok(Self {
            token_type,
            token_name: String::from_utf8(name)?,
            command_bytes: command.into(),
        })
    }
}

//
// internal
//

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), MarshalError> {
    if buf.remaining() < needed {
        return Err(MarshalError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn get_length(buf: &mut impl Buf) -> Result<usize, MarshalError> {
    ensure(buf, 4)?;
    let len = buf.get_i32();
    usize::try_from(len).map_err(|_| MarshalError::NegativeLength(len))
}

/// Reads a length-prefixed chunk. The buffer only grows with the bytes actually read, whatever the prefix claims.
fn read_chunk(channel: &mut impl io::Read) -> Result<Vec<u8>, MarshalError> {
    let len = channel.read_i32::<BigEndian>()?;
    let len = usize::try_from(len).map_err(|_| MarshalError::NegativeLength(len))?;
    let mut chunk = Vec::new();
    channel.take(len as u64).read_to_end(&mut chunk)?;
    if chunk.len() < len {
        return Err(MarshalError::Truncated {
            needed: len - chunk.len(),
        });
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn token_request() -> ReplicatedTokenRequest {
        ReplicatedTokenRequest::new(TokenType::Label, "Person", Bytes::from_static(&[0, 0, 0, 7, 42]))
    }

    #[test]
    fn token_request_framing_matches_between_buffer_and_channel() {
        let mut buf = BytesMut::new();
        token_request().marshal(&mut buf);

        let mut channel = Vec::new();
        token_request().write_to(&mut channel).unwrap();
        assert_eq!(&buf[..], &channel[..]);

        assert_eq!(
            ReplicatedTokenRequest::read_from(&mut Cursor::new(&channel)).unwrap(),
            token_request()
        );
        assert_eq!(ReplicatedTokenRequest::unmarshal(&mut buf.freeze()).unwrap(), token_request());
    }

    #[test]
    fn nested_operation_survives_marshalling() {
        let content = ReplicatedContent::DistributedOperation(DistributedOperation {
            session: Uuid::new_v4(),
            operation_id: 17,
            content: Box::new(ReplicatedContent::TokenRequest(token_request())),
        });
        let decoded = ReplicatedContent::unmarshal(content.marshal()).unwrap();
        assert_eq!(decoded, content);
        assert_eq!(
            decoded.unwrap_operation(),
            &ReplicatedContent::TokenRequest(token_request())
        );
    }

    #[test]
    fn rejects_truncated_and_unknown_input() {
        let bytes = ReplicatedContent::TokenRequest(token_request()).marshal();
        assert!(matches!(
            ReplicatedContent::unmarshal(bytes.slice(..bytes.len() - 1)),
            Err(MarshalError::Truncated { needed: 1 })
        ));
        assert!(matches!(
            ReplicatedContent::unmarshal(Bytes::from_static(&[99])),
            Err(MarshalError::UnknownContentType(99))
        ));
        assert!(matches!(
            ReplicatedTokenRequest::unmarshal(&mut Bytes::from_static(&[0, 0, 0, 1, 255, 255, 255, 255])),
            Err(MarshalError::NegativeLength(-1))
        ));
    }

    #[test]
    fn channel_length_beyond_input_is_truncated() {
        let mut channel = Vec::new();
        channel.write_i32::<BigEndian>(TokenType::Label.ordinal()).unwrap();
        channel.write_i32::<BigEndian>(i32::MAX).unwrap();
        channel.extend_from_slice(b"Person");
        assert!(matches!(
            ReplicatedTokenRequest::read_from(&mut Cursor::new(&channel)),
            Err(MarshalError::Truncated { needed }) if needed == i32::MAX as usize - 6
        ));
    }
}
