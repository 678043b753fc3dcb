//! The Raft consensus core.
//!
//! A [`RaftMachine`] owns the [`RaftState`] of one member and processes one message at a time: the current [`Role`]
//! computes an [`Outcome`] from the message and the state, and the machine then applies the outcome, sends its
//! messages, ships the log to followers while leading and applies newly committed entries.

use std::time::Duration;

use crate::error::{NoLeaderFoundError, SendError};
use crate::member::MemberId;
use crate::message::Message;

pub mod leader_cell;
pub mod machine;
pub mod membership;
pub mod outcome;
pub mod roles;
pub mod shipping;
pub mod state;

pub use leader_cell::LeaderCell;
pub use machine::{LeaderInfo, RaftMachine, Timers};
pub use membership::RaftMembershipManager;
pub use outcome::{FollowerState, FollowerStates, Outcome, ShipCommand};
pub use roles::Role;
pub use shipping::{LeaderContext, LogShippingManager, Mode};
pub use state::RaftState;

/// Delivers messages to other members.
///
/// Sending is best effort: Raft tolerates lost messages, so a failure is logged by the caller and otherwise ignored.
pub trait Outbound: Send + Sync {
    fn send(&self, to: MemberId, message: Message) -> Result<(), SendError>;
}

/// Read access to the leadership of the cluster as seen by this member.
pub trait CoreMetaData {
    fn is_leader(&self) -> bool;

    /// Returns the current leader, waiting up to `timeout` for one to become known.
    fn get_leader(&self, timeout: Duration) -> Result<MemberId, NoLeaderFoundError>;
}
