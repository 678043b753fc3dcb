use crate::error::RaftError;
use crate::member::MemberId;
use crate::message::{Rpc, VoteRequest, VoteResponse};
use crate::{Index, Term};

use super::super::{Outcome, RaftState};

/// Grants the vote of this term to `from` if no other candidate has it and the candidate's log is at least as up to
/// date as ours, comparing the last term first and then the last index.
pub(super) fn handle_vote_request(
    from: MemberId,
    request: &VoteRequest,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    let (last_log_term, last_log_index) = last_log_position(outcome, state)?;
    let vote_free = outcome.voted_for.map_or(true, |voted_for| voted_for == from);
    let up_to_date = (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index);
    let vote_granted = vote_free && up_to_date;

    if vote_granted {
        verbose!("granted vote at term {} to {}", outcome.term, from);
        outcome.voted_for = Some(from);
        outcome.renew_election_timeout = true;
    } else if !vote_free {
        verbose!(
            "rejected vote at term {} for {}, already voted for {:?}",
            outcome.term,
            from,
            outcome.voted_for.map(|member| member.to_string())
        );
    } else {
        verbose!(
            "rejected vote at term {} for {} with log ({}, {}) behind ({}, {})",
            outcome.term,
            from,
            request.last_log_term,
            request.last_log_index,
            last_log_term,
            last_log_index
        );
    }
    outcome.send(from, Rpc::VoteResponse(VoteResponse { vote_granted }));
    Ok(())
}

/// Answers a poll for an election in `term`. The pre-vote is granted if `term` is later than ours, no leader is known
/// or our own election timer expired too, and the poller's log is at least as up to date as ours. Neither our term
/// nor our vote changes.
pub(super) fn handle_pre_vote_request(
    from: MemberId,
    term: Term,
    request: &VoteRequest,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    let (last_log_term, last_log_index) = last_log_position(outcome, state)?;
    let leaderless = outcome.leader.is_none() || outcome.pre_election;
    let up_to_date = (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index);
    let vote_granted = term > outcome.term && leaderless && up_to_date;

    if vote_granted {
        verbose!("granted pre-vote for term {} to {}", term, from);
        outcome.send_in_term(from, term, Rpc::PreVoteResponse(VoteResponse { vote_granted }));
    } else {
        verbose!(
            "rejected pre-vote for term {} from {} at term {}, leader {:?}",
            term,
            from,
            outcome.term,
            outcome.leader.map(|leader| leader.to_string())
        );
        outcome.send(from, Rpc::PreVoteResponse(VoteResponse { vote_granted }));
    }
    Ok(())
}

fn last_log_position(outcome: &Outcome, state: &RaftState) -> Result<(Term, Index), RaftError> {
    let last_log_index = outcome.append_index(state);
    let last_log_term = outcome.term_at(state, last_log_index)?.unwrap_or_default();
    Ok((last_log_term, last_log_index))
}
