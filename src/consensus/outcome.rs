use std::collections::{BTreeMap, BTreeSet};

use crate::error::LogError;
use crate::log::{LogCommand, LogEntry};
use crate::member::MemberId;
use crate::message::{Message, Rpc, SendableMessage};
use crate::{Index, Term};

use super::{RaftState, Role};

/// An instruction from the leader's role handler to the [log shipping manager](super::shipping::LogShippingManager).
#[derive(Clone, Debug, PartialEq)]
pub enum ShipCommand {
    /// A follower rejected an append; `last_remote_append_index` is the end of its log.
    Mismatch {
        member: MemberId,
        last_remote_append_index: Index,
    },
    /// A follower's log is known to match up to `match_index`.
    Match { member: MemberId, match_index: Index },
    /// The leader appended `entries` after `prev_index`.
    NewEntries {
        prev_index: Index,
        prev_term: Term,
        entries: Vec<LogEntry>,
    },
    /// The leader's commit index advanced.
    CommitUpdate,
}

/// The leader's view of the replication progress of one follower.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FollowerState {
    /// The index up to which the follower's log is known to match the leader's, or `-1`.
    pub match_index: Index,
}

pub type FollowerStates = BTreeMap<MemberId, FollowerState>;

/// The result of handling one message: the complete state a member transitions to, and the effects to perform.
///
/// An outcome starts as a copy of the current [`RaftState`] and is modified by the role handlers, which never modify
/// the state directly. Log commands are pending until the state is updated, so [`append_index`](Self::append_index)
/// and [`term_at`](Self::term_at) see the log as it will be after they are applied.
#[derive(Debug)]
pub struct Outcome {
    pub next_role: Role,
    pub term: Term,
    pub voted_for: Option<MemberId>,
    pub leader: Option<MemberId>,
    pub leader_commit: Index,
    pub commit_index: Index,
    pub votes_for_me: BTreeSet<MemberId>,
    pub heartbeat_responses: BTreeSet<MemberId>,
    pub follower_states: FollowerStates,
    pub last_log_index_before_we_became_leader: Index,
    pub pre_election: bool,
    pub pre_votes_for_me: BTreeSet<MemberId>,
    pub renew_election_timeout: bool,
    pub outgoing: Vec<SendableMessage>,
    pub log_commands: Vec<LogCommand>,
    pub ship_commands: Vec<ShipCommand>,
}

//
// FollowerState impls
//

impl FollowerState {
    pub fn new() -> Self {
        Self { match_index: -1 }
    }
}

impl Default for FollowerState {
    fn default() -> Self {
        Self::new()
    }
}

//
// Outcome impls
//

impl Outcome {
    pub fn new(role: Role, state: &RaftState) -> Self {
        Self {
            next_role: role,
            term: state.term(),
            voted_for: state.voted_for(),
            leader: state.leader(),
            leader_commit: state.leader_commit(),
            commit_index: state.commit_index(),
            votes_for_me: state.votes_for_me().clone(),
            heartbeat_responses: state.heartbeat_responses().clone(),
            follower_states: state.follower_states().clone(),
            last_log_index_before_we_became_leader: state.last_log_index_before_we_became_leader(),
            pre_election: state.pre_election(),
            pre_votes_for_me: state.pre_votes_for_me().clone(),
            renew_election_timeout: false,
            outgoing: Vec::new(),
            log_commands: Vec::new(),
            ship_commands: Vec::new(),
        }
    }

    /// Queues `rpc` to `dest`, stamped with the outcome's term.
    pub fn send(&mut self, dest: MemberId, rpc: Rpc) {
        self.send_in_term(dest, self.term, rpc);
    }

    /// Queues `rpc` to `dest`, stamped with `term`. Only pre-votes speak about a term other than the current one.
    pub fn send_in_term(&mut self, dest: MemberId, term: Term, rpc: Rpc) {
        self.outgoing.push(SendableMessage {
            message: Message::new(term, rpc),
            dest,
        });
    }

    /// Leaves a pre-election, forgetting the pre-votes collected for it.
    pub fn end_pre_election(&mut self) {
        self.pre_election = false;
        self.pre_votes_for_me.clear();
    }

    pub fn append(&mut self, index: Index, entry: LogEntry) {
        self.log_commands.push(LogCommand::Append { index, entry });
    }

    pub fn truncate(&mut self, from: Index) {
        self.log_commands.push(LogCommand::Truncate { from });
    }

    pub fn ship(&mut self, command: ShipCommand) {
        self.ship_commands.push(command);
    }

    /// Returns the append index the log will have once the pending log commands are applied.
    pub fn append_index(&self, state: &RaftState) -> Index {
        self.log_commands
            .iter()
            .fold(state.append_index(), |_, command| match command {
                LogCommand::Append { index, .. } => *index,
                LogCommand::Truncate { from } => from - 1,
            })
    }

    /// Returns the term of the entry at `index` once the pending log commands are applied.
    pub fn term_at(&self, state: &RaftState, index: Index) -> Result<Option<Term>, LogError> {
        if index < 0 {
            return Ok(Some(0));
        }
        for command in self.log_commands.iter().rev() {
            match command {
                LogCommand::Append { index: appended, entry } if *appended == index => {
                    return Ok(Some(entry.term))
                }
                LogCommand::Truncate { from } if index >= *from => return Ok(None),
                _ => (),
            }
        }
        state.reader().read_term(index)
    }
}
