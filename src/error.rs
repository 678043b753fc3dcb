//! Error types.
//!
//! Errors are split by how a caller is expected to react to them: transient conditions such as
//! [`NoLeaderFoundError`] may be retried, while [`LogError`] and [`CommitError`] mean the node can no longer
//! guarantee that its log and its store agree and must stop participating.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::member::MemberId;
use crate::{Index, Term};

/// An error returned by a [`RaftLog`](crate::log::RaftLog) implementation.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("non-contiguous append at {index}, log append index is {append_index}")]
    NonContiguous { index: Index, append_index: Index },

    #[error("cannot truncate from {from}, entries up to {commit_index} are committed")]
    TruncateCommitted { from: Index, commit_index: Index },

    #[error("cannot truncate from {from}, log append index is {append_index}")]
    TruncateOutOfRange { from: Index, append_index: Index },

    #[error("cannot commit {index} beyond append index {append_index}")]
    CommitBeyondAppend { index: Index, append_index: Index },

    #[error("corrupt log record in segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("failed to decode log entry: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// An error returned by a [`StateStorage`](crate::storage::StateStorage).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state storage i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("state file {0} failed checksum verification")]
    Checksum(String),

    #[error("failed to decode stored state: {0}")]
    Marshal(#[from] MarshalError),
}

/// An error while marshalling or unmarshalling replicated content.
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unexpected end of input, needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown content type {0}")]
    UnknownContentType(u8),

    #[error("unknown token type ordinal {0}")]
    UnknownTokenType(i32),

    #[error("negative length {0}")]
    NegativeLength(i32),

    #[error("invalid utf-8 in token name")]
    InvalidName(#[from] std::string::FromUtf8Error),

    #[error("channel i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// An error while framing or decoding a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("incomplete frame, needed {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("message `{0}` is local to a node and cannot be sent")]
    NotWireable(&'static str),

    #[error("message frame carries no body")]
    MissingBody,

    #[error("invalid member id")]
    InvalidMemberId,

    #[error("failed to decode message body: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to encode message body: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// An error while sending a message to a peer. Always transient.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no route to member {0}")]
    UnknownMember(MemberId),

    #[error("connection to member {0} is closed")]
    Disconnected(MemberId),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// An error while bootstrapping a cluster.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("cannot bootstrap with an empty member set")]
    EmptyMemberSet,

    #[error("node was already bootstrapped with a different member set")]
    MemberSetMismatch,

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Raised when no leader became known before a lookup deadline.
#[derive(Debug, Error)]
pub enum NoLeaderFoundError {
    #[error("no leader found within {0:?}")]
    Timeout(Duration),

    #[error("leader lookup was interrupted")]
    Interrupted,
}

/// An error applying a transaction to the underlying store.
#[derive(Debug, Error)]
#[error("failed to commit transaction for log index {index}: {reason}")]
pub struct CommitError {
    pub index: Index,
    pub reason: String,
}

/// An error raised by a replicated state machine.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("commit process has not been installed")]
    NotInstalled,

    #[error("state machine halted after an earlier failure at log index {0}")]
    Halted(Index),

    #[error("malformed token command: {0}")]
    MalformedCommand(String),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// An error while replicating content through the cluster.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    NoLeader(#[from] NoLeaderFoundError),

    #[error("replication did not complete within {0:?}")]
    Timeout(Duration),

    #[error("replication was abandoned before completion")]
    Abandoned,

    #[error("state machine rejected the command: {0}")]
    Rejected(String),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

impl ReplicationError {
    /// Returns whether retrying the replication, possibly against a new leader, is sensible.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::NoLeader(NoLeaderFoundError::Timeout(_))
            | ReplicationError::Timeout(_)
            | ReplicationError::Send(_) => true,
            ReplicationError::NoLeader(NoLeaderFoundError::Interrupted)
            | ReplicationError::Abandoned
            | ReplicationError::Rejected(_)
            | ReplicationError::Marshal(_) => false,
        }
    }
}

/// An error from the token registry.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token `{name}` already registered with id {existing}, cannot register id {id}")]
    NonUniqueName { name: String, existing: u32, id: u32 },

    #[error("token id {id} already registered for `{existing}`, cannot register `{name}`")]
    NonUniqueId { id: u32, existing: String, name: String },

    #[error("no token with id {0}")]
    NotFound(u32),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// An invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election timeout must be at least {min:?}, got {actual:?}")]
    ElectionTimeoutTooShort { min: Duration, actual: Duration },

    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

/// A failure starting or running the consensus machine. Once running, every failure is fatal to the node.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start the server thread: {0}")]
    Spawn(io::Error),

    #[error("protocol invariant violated at term {term}: {reason}")]
    IllegalState { term: Term, reason: String },
}
