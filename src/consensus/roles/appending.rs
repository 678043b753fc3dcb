use crate::error::RaftError;
use crate::member::MemberId;
use crate::message::{AppendRequest, AppendResponse, Rpc};
use crate::Index;

use super::super::{Outcome, RaftState};

/// Appends entries from the leader of the current term.
///
/// The request is refused unless our log holds the entry before the new ones with the leader's term for it. Entries
/// we already hold with the same term are kept; the first conflicting entry and everything after it is replaced.
pub(super) fn handle_append_request(
    from: MemberId,
    request: &AppendRequest,
    outcome: &mut Outcome,
    state: &RaftState,
) -> Result<(), RaftError> {
    outcome.leader = Some(from);
    outcome.renew_election_timeout = true;
    outcome.leader_commit = request.leader_commit;
    outcome.end_pre_election();

    let prev_term = outcome.term_at(state, request.prev_log_index)?;
    if prev_term != Some(request.prev_log_term) {
        let append_index = outcome.append_index(state);
        verbose!(
            "rejected append after {} from {}, local term {:?} != {}",
            request.prev_log_index,
            from,
            prev_term,
            request.prev_log_term
        );
        outcome.send(
            from,
            Rpc::AppendResponse(AppendResponse {
                success: false,
                match_index: -1,
                append_index,
            }),
        );
        return Ok(());
    }

    let mut index = request.prev_log_index + 1;
    for entry in &request.entries {
        match outcome.term_at(state, index)? {
            Some(term) if term == entry.term => (),
            Some(term) => {
                if index <= outcome.commit_index {
                    return Err(RaftError::IllegalState {
                        term: outcome.term,
                        reason: format!(
                            "entry {} with term {} from {} conflicts with committed entry of term {}",
                            index, entry.term, from, term
                        ),
                    });
                }
                verbose!("truncating from {}, term {} conflicts with {}", index, term, entry.term);
                outcome.truncate(index);
                outcome.append(index, entry.clone());
            }
            None => outcome.append(index, entry.clone()),
        }
        index += 1;
    }

    let match_index = request.prev_log_index + request.entries.len() as Index;
    let commit_index = request.leader_commit.min(match_index);
    if commit_index > outcome.commit_index {
        outcome.commit_index = commit_index;
    }
    let append_index = outcome.append_index(state);
    outcome.send(
        from,
        Rpc::AppendResponse(AppendResponse {
            success: true,
            match_index,
            append_index,
        }),
    );
    Ok(())
}
