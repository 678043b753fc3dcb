use bytes::Bytes;
use log::{info, warn};

use crate::content::ReplicatedContent;
use crate::error::RaftError;
use crate::log::LogEntry;
use crate::member::{is_quorum, quorum_size, MemberId};
use crate::message::{AppendResponse, Heartbeat, Rpc};
use crate::Index;

use super::super::outcome::{FollowerState, ShipCommand};
use super::super::{Outcome, RaftState};
use super::{voting, Role};

pub(super) fn handle(from: MemberId, rpc: &Rpc, outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    match rpc {
        Rpc::HeartbeatResponse(_) => {
            outcome.heartbeat_responses.insert(from);
        }
        Rpc::AppendResponse(response) => {
            outcome.heartbeat_responses.insert(from);
            handle_append_response(from, response, outcome, state)?;
        }
        Rpc::VoteRequest(request) => voting::handle_vote_request(from, request, outcome, state)?,
        Rpc::NewEntryRequest(request) => append_new_entries(outcome, state, vec![request.content.clone()])?,
        Rpc::NewEntryBatch(batch) => append_new_entries(outcome, state, batch.contents.clone())?,
        Rpc::Heartbeat(_) | Rpc::AppendRequest(_) => {
            warn!("ignored {} from {}, another leader at term {}", rpc, from, outcome.term);
        }
        Rpc::VoteResponse(_) => verbose!("ignored late vote from {}", from),
        Rpc::PreVoteRequest(_) | Rpc::PreVoteResponse(_) => verbose!("ignored {} from {} as leader", rpc, from),
    }
    Ok(())
}

fn handle_append_response(
    from: MemberId,
    response: &AppendResponse,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    if !response.success {
        verbose!("append mismatch at {}, remote append index {}", from, response.append_index);
        outcome.ship(ShipCommand::Mismatch {
            member: from,
            last_remote_append_index: response.append_index,
        });
        return Ok(());
    }

    let follower = match outcome.follower_states.get_mut(&from) {
        Some(follower) => follower,
        None => {
            verbose!("ignored append response from non-follower {}", from);
            return Ok(());
        }
    };
    if response.match_index <= follower.match_index {
        verbose!(
            "ignored stale append response from {}, match {} <= {}",
            from,
            response.match_index,
            follower.match_index
        );
        return Ok(());
    }
    follower.match_index = response.match_index;
    outcome.ship(ShipCommand::Match {
        member: from,
        match_index: response.match_index,
    });
    advance_commit(outcome, state)
}

/// Takes leadership of the current term.
///
/// Replication progress of every follower starts unknown. A barrier entry is appended in the new term, so that entries
/// of earlier terms become committable, and heartbeats announce the new leader.
pub(super) fn become_leader(outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    let myself = state.myself();
    outcome.next_role = Role::Leader;
    outcome.leader = Some(myself);
    outcome.heartbeat_responses.clear();
    outcome.last_log_index_before_we_became_leader = outcome.append_index(state);
    outcome.follower_states = state
        .replication_members()
        .iter()
        .filter(|member| **member != myself)
        .map(|member| (*member, FollowerState::new()))
        .collect();
    info!("became leader at term {}", outcome.term);

    append_new_entries(outcome, state, vec![ReplicatedContent::Barrier.marshal()])?;
    send_heartbeats(outcome, state)
}

/// Appends `contents` to the log in the current term and hands the new entries to log shipping.
pub(super) fn append_new_entries(
    outcome: &mut Outcome,
    state: &RaftState,
    contents: Vec<Bytes>,
) -> Result<(), RaftError> {
    if contents.is_empty() {
        return Ok(());
    }
    let prev_index = outcome.append_index(state);
    let prev_term = outcome.term_at(state, prev_index)?.unwrap_or_default();
    let mut entries = Vec::with_capacity(contents.len());
    for (offset, content) in contents.into_iter().enumerate() {
        let entry = LogEntry::new(outcome.term, content);
        outcome.append(prev_index + 1 + offset as Index, entry.clone());
        entries.push(entry);
    }
    verbose!("appended {} entries after {} at term {}", entries.len(), prev_index, outcome.term);
    outcome.ship(ShipCommand::NewEntries {
        prev_index,
        prev_term,
        entries,
    });
    advance_commit(outcome, state)
}

/// Advances the commit index to the highest index held by a quorum of voting members, provided the entry there is
/// from the current term. Our own log counts with its append index.
fn advance_commit(outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    let voting_members = state.voting_members();
    if voting_members.is_empty() {
        return Ok(());
    }
    let append_index = outcome.append_index(state);
    let mut match_indices: Vec<Index> = voting_members
        .iter()
        .map(|member| {
            if *member == state.myself() {
                append_index
            } else {
                outcome
                    .follower_states
                    .get(member)
                    .map_or(-1, |follower| follower.match_index)
            }
        })
        .collect();
    match_indices.sort_unstable_by(|a, b| b.cmp(a));
    let agreed = match_indices[quorum_size(match_indices.len()) - 1];

    if agreed <= outcome.commit_index {
        return Ok(());
    }
    if outcome.term_at(state, agreed)? != Some(outcome.term) {
        verbose!("not committing {}, entry is not from term {}", agreed, outcome.term);
        return Ok(());
    }
    verbose!("committed {} at term {}", agreed, outcome.term);
    outcome.commit_index = agreed;
    outcome.leader_commit = agreed;
    outcome.ship(ShipCommand::CommitUpdate);
    Ok(())
}

pub(super) fn send_heartbeats(outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    let commit_index = outcome.commit_index;
    let commit_index_term = outcome.term_at(state, commit_index)?.unwrap_or_default();
    let myself = state.myself();
    for member in state.replication_members().iter().filter(|member| **member != myself) {
        outcome.send(
            *member,
            Rpc::Heartbeat(Heartbeat {
                commit_index,
                commit_index_term,
            }),
        );
    }
    Ok(())
}

/// Steps down unless a quorum of voting members, counting ourselves, responded since the previous check.
pub(super) fn check_step_down(outcome: &mut Outcome, state: &RaftState) {
    let myself = state.myself();
    let voting_members = state.voting_members();
    let responded = voting_members
        .iter()
        .filter(|member| **member == myself || outcome.heartbeat_responses.contains(member))
        .count();
    outcome.heartbeat_responses.clear();
    if is_quorum(voting_members.len(), responded) {
        return;
    }
    info!(
        "stepping down at term {}, {} of {} voting members responded",
        outcome.term,
        responded,
        voting_members.len()
    );
    outcome.next_role = Role::Follower;
    outcome.leader = None;
    outcome.follower_states.clear();
    outcome.renew_election_timeout = true;
}
