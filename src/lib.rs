//! The consensus core of a clustered transactional store.
//!
//! Members replicate a log of entries with the [Raft](http://raftconsensus.github.io/) consensus protocol. New members
//! join as learners and are promoted to voting members once their log has caught up, and the leader ships its log to
//! followers in batches so a lagging member never floods the network. Committed entries are applied by every member in
//! the same order; the token state machines use them to allocate cluster-wide ids for token names.
//!
//! The [`RaftMachine`](consensus::RaftMachine) holds the protocol logic of one member and is driven by messages. A
//! [`CoreNode`](server::CoreNode) runs a machine with its timers on a processing thread, and exposes the
//! [`ReplicatedTokenHolder`](token::ReplicatedTokenHolder)s resolving token names.

#[macro_use]
mod macros;

pub mod broadcast;
pub mod config;
pub mod consensus;
pub mod content;
pub mod error;
pub mod log;
pub mod member;
pub mod message;
pub mod replication;
pub mod server;
pub mod storage;
pub mod timeout;
pub mod token;
pub mod transport;
pub mod wire;

/// A term of leadership. Terms only ever increase, and there is at most one leader per term.
pub type Term = u64;

/// The position of an entry in the log, starting at 0. `-1` stands for "no entry".
pub type Index = i64;

pub use config::RaftConfig;
pub use consensus::{CoreMetaData, LeaderInfo, Outbound, RaftMachine, Role};
pub use member::{MemberId, MemberSet};
pub use server::{CoreNode, NodeStorage, RaftServer};
pub use token::{ReplicatedTokenHolder, Token, TokenType, TransactionCommitProcess, TransactionToApply};
pub use transport::{ChannelNetwork, ChannelTransport};
