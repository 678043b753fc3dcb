//! Raft message types for sending between members.
//!
//! The top-level wire type is [`Message`], carrying the sender's term and one [`Rpc`]. Protobuf serialization of
//! all wire types in this module is derived through the `prost` crate; framing is provided by
//! [`wire`](crate::wire). A [`RaftMessage`] is what the consensus machine consumes: either a [`Message`] received
//! from a member, or a timeout posted by this member to itself, which is never sent over the wire.

use std::fmt;

use bytes::Bytes;

use crate::log::LogEntry;
use crate::member::MemberId;
use crate::{Index, Term};

/// Input to [`RaftMachine::handle`](crate::consensus::RaftMachine::handle).
#[derive(Clone, Debug, PartialEq)]
pub enum RaftMessage {
    /// A message received from a member, possibly this member itself.
    Message(Message),
    /// The election timer fired.
    ElectionTimeout,
    /// The heartbeat timer fired.
    HeartbeatTimeout,
}

/// A message delivered to a member's inbox, with the member it came from.
pub type InboundMessage = (MemberId, RaftMessage);

/// A [`Message`] to be sent to a destination member.
#[derive(Clone, Debug, PartialEq)]
pub struct SendableMessage {
    /// The message to be sent.
    pub message: Message,

    /// The destination for the message.
    pub dest: MemberId,
}

/// A message sent between Raft members.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// The greatest leadership term seen by the sender. Client requests carry no meaningful term.
    #[prost(uint64, tag = "1")]
    pub term: Term,

    /// The Remote Procedure Call contained by this message.
    ///
    /// This field is only optional in order to support protobuf serialization.
    #[prost(oneof = "Rpc", tags = "3, 4, 5, 6, 7, 8, 9, 10, 11, 12")]
    pub rpc: Option<Rpc>,
}

/// A Remote Procedure Call message to a Raft member.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Rpc {
    /// A request to obtain leadership amongst Raft members.
    #[prost(message, tag = "3")]
    VoteRequest(VoteRequest),

    /// A response to a [`VoteRequest`] granting or denying leadership.
    #[prost(message, tag = "4")]
    VoteResponse(VoteResponse),

    /// A request to append entries to a member's log.
    #[prost(message, tag = "5")]
    AppendRequest(AppendRequest),

    /// A response to an [`AppendRequest`].
    #[prost(message, tag = "6")]
    AppendResponse(AppendResponse),

    /// A leader's liveness signal, carrying its commit index.
    #[prost(message, tag = "7")]
    Heartbeat(Heartbeat),

    /// A follower's acknowledgement of a [`Heartbeat`].
    #[prost(message, tag = "8")]
    HeartbeatResponse(HeartbeatResponse),

    /// A request to append new content to the distributed log, handled by the leader.
    #[prost(message, tag = "9")]
    NewEntryRequest(NewEntryRequest),

    /// A batch of [`NewEntryRequest`]s.
    #[prost(message, tag = "10")]
    NewEntryBatch(NewEntryBatch),

    /// A poll of whether the sender could win an election in the term after its current one. Receiving it changes
    /// neither the term nor the vote of the receiver.
    #[prost(message, tag = "11")]
    PreVoteRequest(VoteRequest),

    /// The response to a [`Rpc::PreVoteRequest`]. A granted pre-vote carries the polled term.
    #[prost(message, tag = "12")]
    PreVoteResponse(VoteResponse),
}

/// A request to obtain leadership amongst Raft members.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteRequest {
    /// The index of the last entry in the candidate's log.
    #[prost(int64, tag = "1")]
    pub last_log_index: Index,

    /// The term of the last entry in the candidate's log.
    #[prost(uint64, tag = "2")]
    pub last_log_term: Term,
}

/// The response to a [`VoteRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct VoteResponse {
    #[prost(bool, tag = "1")]
    pub vote_granted: bool,
}

/// A request to append entries to a member's log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendRequest {
    /// The index immediately before the first entry in [`entries`](Self::entries), or `-1`.
    #[prost(int64, tag = "1")]
    pub prev_log_index: Index,

    /// The term of the entry at [`prev_log_index`](Self::prev_log_index).
    #[prost(uint64, tag = "2")]
    pub prev_log_term: Term,

    /// The index of the last entry known by the leader to be committed.
    #[prost(int64, tag = "3")]
    pub leader_commit: Index,

    /// Consecutive entries to append, possibly none.
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<LogEntry>,
}

/// The response to an [`AppendRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,

    /// The index up to which the responder's log is known to match the leader's, or `-1`.
    #[prost(int64, tag = "2")]
    pub match_index: Index,

    /// The index of the last entry in the responder's log.
    #[prost(int64, tag = "3")]
    pub append_index: Index,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(int64, tag = "1")]
    pub commit_index: Index,

    #[prost(uint64, tag = "2")]
    pub commit_index_term: Term,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HeartbeatResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NewEntryRequest {
    /// Marshalled [`ReplicatedContent`](crate::content::ReplicatedContent).
    #[prost(bytes = "bytes", tag = "1")]
    pub content: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NewEntryBatch {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub contents: Vec<Bytes>,
}

//
// RaftMessage impls
//

impl RaftMessage {
    pub fn new(term: Term, rpc: Rpc) -> Self {
        RaftMessage::Message(Message::new(term, rpc))
    }

    /// Returns the name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::Message(message) => message.kind(),
            RaftMessage::ElectionTimeout => "ElectionTimeout",
            RaftMessage::HeartbeatTimeout => "HeartbeatTimeout",
        }
    }
}

impl From<Message> for RaftMessage {
    fn from(message: Message) -> Self {
        RaftMessage::Message(message)
    }
}

impl fmt::Display for RaftMessage {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftMessage::Message(message) => fmt::Display::fmt(message, fmt),
            RaftMessage::ElectionTimeout | RaftMessage::HeartbeatTimeout => {
                fmt.write_str(self.kind())
            }
        }
    }
}

//
// Message impls
//

impl Message {
    pub fn new(term: Term, rpc: Rpc) -> Self {
        Self {
            term,
            rpc: Some(rpc),
        }
    }

    /// Returns whether this message takes part in the term protocol. Client requests do not, and pre-votes are
    /// polls about a term nobody has entered yet.
    pub fn is_term_bearing(&self) -> bool {
        !matches!(
            self.rpc,
            Some(Rpc::NewEntryRequest(_))
                | Some(Rpc::NewEntryBatch(_))
                | Some(Rpc::PreVoteRequest(_))
                | Some(Rpc::PreVoteResponse(_))
                | None
        )
    }

    pub fn kind(&self) -> &'static str {
        match &self.rpc {
            Some(Rpc::VoteRequest(_)) => "VoteRequest",
            Some(Rpc::VoteResponse(_)) => "VoteResponse",
            Some(Rpc::AppendRequest(_)) => "AppendRequest",
            Some(Rpc::AppendResponse(_)) => "AppendResponse",
            Some(Rpc::Heartbeat(_)) => "Heartbeat",
            Some(Rpc::HeartbeatResponse(_)) => "HeartbeatResponse",
            Some(Rpc::NewEntryRequest(_)) => "NewEntryRequest",
            Some(Rpc::NewEntryBatch(_)) => "NewEntryBatch",
            Some(Rpc::PreVoteRequest(_)) => "PreVoteRequest",
            Some(Rpc::PreVoteResponse(_)) => "PreVoteResponse",
            None => "Empty",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, rpc } = self;
        let mut debug = fmt.debug_tuple("");
        debug.field(&format_args!("Term({})", term));
        if let Some(rpc) = rpc {
            debug.field(&format_args!("{}", rpc));
        } else {
            debug.field(&"None");
        }
        debug.finish()
    }
}

//
// Rpc impls
//

impl fmt::Display for Rpc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Rpc::VoteRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::VoteResponse(msg) => fmt.debug_struct("VoteResponse")
                .field("vote_granted", &msg.vote_granted)
                .finish(),
            Rpc::AppendRequest(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::AppendResponse(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Heartbeat(msg) => fmt.debug_struct("Heartbeat")
                .field("commit_index", &msg.commit_index)
                .field("commit_index_term", &msg.commit_index_term)
                .finish(),
            Rpc::HeartbeatResponse(_) => fmt.write_str("HeartbeatResponse"),
            Rpc::NewEntryRequest(msg) => fmt.debug_struct("NewEntryRequest")
                .field("content", &msg.content.len())
                .finish(),
            Rpc::NewEntryBatch(msg) => fmt.debug_struct("NewEntryBatch")
                .field("contents", &msg.contents.len())
                .finish(),
            Rpc::PreVoteRequest(msg) => fmt.debug_struct("PreVoteRequest")
                .field("last_log_index", &msg.last_log_index)
                .field("last_log_term", &msg.last_log_term)
                .finish(),
            Rpc::PreVoteResponse(msg) => fmt.debug_struct("PreVoteResponse")
                .field("vote_granted", &msg.vote_granted)
                .finish(),
        }
    }
}

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            last_log_index,
            last_log_term,
        } = self;
        fmt.debug_struct("VoteRequest")
            .field("last_log_index", last_log_index)
            .field("last_log_term", last_log_term)
            .finish()
    }
}

impl fmt::Display for AppendRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            prev_log_index,
            prev_log_term,
            leader_commit,
            entries,
        } = self;
        fmt.debug_struct("AppendRequest")
            .field("prev_log_index", prev_log_index)
            .field("prev_log_term", prev_log_term)
            .field("leader_commit", leader_commit)
            .field("entries", &entries.len())
            .finish()
    }
}

impl fmt::Display for AppendResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            success,
            match_index,
            append_index,
        } = self;
        fmt.debug_struct("AppendResponse")
            .field("success", success)
            .field("match_index", match_index)
            .field("append_index", append_index)
            .finish()
    }
}
