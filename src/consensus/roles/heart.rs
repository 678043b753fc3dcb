use crate::error::RaftError;
use crate::member::MemberId;
use crate::message::{Heartbeat, HeartbeatResponse, Rpc};

use super::super::{Outcome, RaftState};

/// Accepts a heartbeat from the leader of the current term.
///
/// The commit index is only advanced to the leader's if our entry at that index has the leader's term there, which by
/// log matching means our log agrees with the leader's up to it.
pub(super) fn handle_heartbeat(
    from: MemberId,
    heartbeat: &Heartbeat,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    outcome.leader = Some(from);
    outcome.renew_election_timeout = true;
    outcome.leader_commit = heartbeat.commit_index;
    outcome.end_pre_election();

    if heartbeat.commit_index > outcome.commit_index {
        match outcome.term_at(state, heartbeat.commit_index)? {
            Some(term) if term == heartbeat.commit_index_term => {
                verbose!("heartbeat from {} committed {}", from, heartbeat.commit_index);
                outcome.commit_index = heartbeat.commit_index;
            }
            _ => verbose!("cannot commit {} from heartbeat yet", heartbeat.commit_index),
        }
    }
    outcome.send(from, Rpc::HeartbeatResponse(HeartbeatResponse {}));
    Ok(())
}
