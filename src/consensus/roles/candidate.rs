use std::iter;

use log::{info, warn};

use crate::error::RaftError;
use crate::member::{is_quorum, MemberId};
use crate::message::{Rpc, VoteRequest, VoteResponse};
use crate::Term;

use super::super::{Outcome, RaftState};
use super::{follower, leader, voting, Role};

pub(super) fn handle(from: MemberId, rpc: &Rpc, outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    match rpc {
        Rpc::Heartbeat(_) | Rpc::AppendRequest(_) => {
            info!("became follower of {} at term {}", from, outcome.term);
            outcome.next_role = Role::Follower;
            outcome.votes_for_me.clear();
            follower::handle(from, rpc, outcome, state)?;
        }
        Rpc::VoteRequest(request) => voting::handle_vote_request(from, request, outcome, state)?,
        Rpc::VoteResponse(response) => {
            if !response.vote_granted {
                verbose!("vote denied by {} at term {}", from, outcome.term);
                return Ok(());
            }
            if !state.voting_members().contains(&from) {
                verbose!("ignored vote from non-voting {}", from);
                return Ok(());
            }
            outcome.votes_for_me.insert(from);
            verbose!(
                "received vote from {} at term {}, {} of {}",
                from,
                outcome.term,
                outcome.votes_for_me.len(),
                state.voting_members().len()
            );
            if is_quorum(state.voting_members().len(), outcome.votes_for_me.len()) {
                leader::become_leader(outcome, state)?;
            }
        }
        Rpc::NewEntryRequest(_) | Rpc::NewEntryBatch(_) => {
            warn!("dropped new entries from {}, election in progress at term {}", from, outcome.term);
        }
        Rpc::AppendResponse(_) | Rpc::HeartbeatResponse(_) | Rpc::PreVoteRequest(_) | Rpc::PreVoteResponse(_) => {
            verbose!("ignored {} from {} as candidate", rpc, from);
        }
    }
    Ok(())
}

/// Starts an election in the next term, voting for ourselves. A member outside the voting set never starts one.
pub(super) fn start_election(outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    let myself = state.myself();
    outcome.renew_election_timeout = true;
    if !state.voting_members().contains(&myself) {
        verbose!("not starting election at term {}, not a voting member", outcome.term);
        return Ok(());
    }

    outcome.end_pre_election();
    outcome.term += 1;
    outcome.next_role = Role::Candidate;
    outcome.voted_for = Some(myself);
    outcome.leader = None;
    outcome.votes_for_me = iter::once(myself).collect();
    outcome.heartbeat_responses.clear();
    outcome.follower_states.clear();
    info!("became candidate at term {}", outcome.term);

    let request = vote_request(outcome, state)?;
    for member in state.voting_members().iter().filter(|member| **member != myself) {
        outcome.send(*member, Rpc::VoteRequest(request.clone()));
    }

    if is_quorum(state.voting_members().len(), outcome.votes_for_me.len()) {
        leader::become_leader(outcome, state)?;
    }
    Ok(())
}

/// Polls the voting members for an election in the next term without starting it. The term and the vote are left
/// alone until a quorum grants a pre-vote, so a member cut off from the cluster cannot raise the term on its return.
pub(super) fn start_pre_election(outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    let myself = state.myself();
    outcome.renew_election_timeout = true;
    if !state.voting_members().contains(&myself) {
        verbose!("not starting pre-election at term {}, not a voting member", outcome.term);
        return Ok(());
    }

    if outcome.next_role != Role::Follower {
        info!("became follower at term {} to poll for the next election", outcome.term);
    }
    outcome.next_role = Role::Follower;
    outcome.leader = None;
    outcome.votes_for_me.clear();
    outcome.pre_election = true;
    outcome.pre_votes_for_me = iter::once(myself).collect();
    verbose!("started pre-election for term {}", outcome.term + 1);

    let request = vote_request(outcome, state)?;
    let polled_term = outcome.term + 1;
    for member in state.voting_members().iter().filter(|member| **member != myself) {
        outcome.send_in_term(*member, polled_term, Rpc::PreVoteRequest(request.clone()));
    }

    if is_quorum(state.voting_members().len(), outcome.pre_votes_for_me.len()) {
        start_election(outcome, state)?;
    }
    Ok(())
}

/// Counts a pre-vote for the election polled by [`start_pre_election`], starting the election on a quorum. A rejection
/// from a later term makes this member a follower in that term.
pub(super) fn handle_pre_vote_response(
    from: MemberId,
    term: Term,
    response: &VoteResponse,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    if !response.vote_granted {
        if term > outcome.term {
            info!("pre-vote rejected by {} at later term {}", from, term);
            outcome.term = term;
            outcome.voted_for = None;
            outcome.leader = None;
            outcome.next_role = Role::Follower;
            outcome.votes_for_me.clear();
            outcome.heartbeat_responses.clear();
            outcome.follower_states.clear();
            outcome.end_pre_election();
        } else {
            verbose!("pre-vote denied by {} at term {}", from, term);
        }
        return Ok(());
    }
    if !outcome.pre_election || term != outcome.term + 1 {
        verbose!("ignored pre-vote from {} for term {}, not polling for it", from, term);
        return Ok(());
    }
    if !state.voting_members().contains(&from) {
        verbose!("ignored pre-vote from non-voting {}", from);
        return Ok(());
    }
    outcome.pre_votes_for_me.insert(from);
    verbose!(
        "received pre-vote from {} for term {}, {} of {}",
        from,
        term,
        outcome.pre_votes_for_me.len(),
        state.voting_members().len()
    );
    if is_quorum(state.voting_members().len(), outcome.pre_votes_for_me.len()) {
        start_election(outcome, state)?;
    }
    Ok(())
}

fn vote_request(outcome: &Outcome, state: &RaftState) -> Result<VoteRequest, RaftError> {
    let last_log_index = outcome.append_index(state);
    let last_log_term = outcome.term_at(state, last_log_index)?.unwrap_or_default();
    Ok(VoteRequest {
        last_log_index,
        last_log_term,
    })
}
