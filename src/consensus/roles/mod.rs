//! Role handlers.
//!
//! Each role turns one message and the current [`RaftState`] into an [`Outcome`]. Handlers are pure: the state is
//! only read, and every effect is described by the returned outcome. Term handling common to all roles happens in
//! [`Role::handle`] before dispatching to a role: a message from a later term makes this member a follower in that
//! term, and a message from an earlier term is rejected. Pre-votes are answered the same way by every role, without
//! any change of term.

use std::fmt;

use log::{info, warn};

use crate::error::RaftError;
use crate::member::MemberId;
use crate::message::{AppendResponse, Message, RaftMessage, Rpc, VoteResponse};

use super::{Outcome, RaftState};

mod appending;
mod candidate;
mod follower;
mod heart;
mod leader;
mod voting;

/// The role of a member in the current term.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    /// Handles `message` from `from` in this role.
    ///
    /// # Errors
    ///
    /// An error means the log could not be read or a protocol invariant was violated; the member must stop.
    pub fn handle(self, from: MemberId, message: &RaftMessage, state: &RaftState) -> Result<Outcome, RaftError> {
        let mut outcome = Outcome::new(self, state);
        match message {
            RaftMessage::Message(message) => {
                if message.is_term_bearing() {
                    if message.term > outcome.term {
                        if self != Role::Follower {
                            info!(
                                "stepping down from {} at term {}, {} from {} has term {}",
                                self,
                                outcome.term,
                                message.kind(),
                                from,
                                message.term
                            );
                        }
                        outcome.term = message.term;
                        outcome.voted_for = None;
                        outcome.leader = None;
                        outcome.next_role = Role::Follower;
                        outcome.votes_for_me.clear();
                        outcome.heartbeat_responses.clear();
                        outcome.follower_states.clear();
                        outcome.end_pre_election();
                    } else if message.term < outcome.term {
                        reject_stale(from, message, &mut outcome, state);
                        return Ok(outcome);
                    }
                }
                let rpc = match &message.rpc {
                    Some(rpc) => rpc,
                    None => {
                        warn!("ignored message without body from {}", from);
                        return Ok(outcome);
                    }
                };
                match rpc {
                    Rpc::PreVoteRequest(request) => {
                        voting::handle_pre_vote_request(from, message.term, request, &mut outcome, state)?;
                        return Ok(outcome);
                    }
                    Rpc::PreVoteResponse(response) => {
                        candidate::handle_pre_vote_response(from, message.term, response, &mut outcome, state)?;
                        return Ok(outcome);
                    }
                    _ => (),
                }
                match outcome.next_role {
                    Role::Follower => follower::handle(from, rpc, &mut outcome, state)?,
                    Role::Candidate => candidate::handle(from, rpc, &mut outcome, state)?,
                    Role::Leader => leader::handle(from, rpc, &mut outcome, state)?,
                }
            }
            RaftMessage::ElectionTimeout => match self {
                Role::Follower | Role::Candidate if state.pre_vote() => {
                    candidate::start_pre_election(&mut outcome, state)?
                }
                Role::Follower | Role::Candidate => candidate::start_election(&mut outcome, state)?,
                Role::Leader => leader::check_step_down(&mut outcome, state),
            },
            RaftMessage::HeartbeatTimeout => {
                if self == Role::Leader {
                    leader::send_heartbeats(&mut outcome, state)?;
                }
            }
        }
        Ok(outcome)
    }
}

/// Answers a message from an earlier term, so that a stale candidate or leader learns of the current term.
fn reject_stale(from: MemberId, message: &Message, outcome: &mut Outcome, state: &RaftState) {
    verbose!(
        "ignored {} from {} with term {} < current {}",
        message.kind(),
        from,
        message.term,
        outcome.term
    );
    match &message.rpc {
        Some(Rpc::VoteRequest(_)) => outcome.send(from, Rpc::VoteResponse(VoteResponse { vote_granted: false })),
        Some(Rpc::AppendRequest(_)) => outcome.send(
            from,
            Rpc::AppendResponse(AppendResponse {
                success: false,
                match_index: -1,
                append_index: state.append_index(),
            }),
        ),
        _ => (),
    }
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        fmt.write_str(name)
    }
}
