use log::warn;

use crate::error::RaftError;
use crate::member::MemberId;
use crate::message::Rpc;

use super::super::{Outcome, RaftState};
use super::{appending, heart, voting};

pub(super) fn handle(from: MemberId, rpc: &Rpc, outcome: &mut Outcome, state: &RaftState) -> Result<(), RaftError> {
    match rpc {
        Rpc::Heartbeat(heartbeat) => heart::handle_heartbeat(from, heartbeat, outcome, state)?,
        Rpc::AppendRequest(request) => appending::handle_append_request(from, request, outcome, state)?,
        Rpc::VoteRequest(request) => voting::handle_vote_request(from, request, outcome, state)?,
        Rpc::NewEntryRequest(_) | Rpc::NewEntryBatch(_) => match outcome.leader {
            Some(leader) if leader != state.myself() => {
                verbose!("forwarding new entries from {} to {}", from, leader);
                outcome.send(leader, rpc.clone());
            }
            _ => warn!("dropped new entries from {}, no leader known at term {}", from, outcome.term),
        },
        Rpc::VoteResponse(_)
        | Rpc::AppendResponse(_)
        | Rpc::HeartbeatResponse(_)
        | Rpc::PreVoteRequest(_)
        | Rpc::PreVoteResponse(_) => {
            verbose!("ignored {} from {} as follower", rpc, from);
        }
    }
    Ok(())
}
