use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, warn};
use uuid::Uuid;

use crate::content::{DistributedOperation, ReplicatedContent};
use crate::error::StateMachineError;
use crate::log::cache::CachingReader;
use crate::token::{ReplicatedTokenStateMachine, TokenType};
use crate::Index;

use super::{CommandOutput, ProgressTracker};

const APPLY_BATCH_SIZE: usize = 64;

/// Applies committed entries, in index order, to the replicated state machines of this member.
///
/// Application stops at the first failure: the store can no longer be trusted to match the log, so every later call
/// fails with [`StateMachineError::Halted`].
pub struct CoreStateMachines {
    session: Uuid,
    tracker: Arc<ProgressTracker>,
    tokens: BTreeMap<TokenType, Arc<ReplicatedTokenStateMachine>>,
    last_applied: Index,
    halted: Option<Index>,
}

impl CoreStateMachines {
    /// `session` identifies operations proposed by this member's replicator.
    pub fn new(session: Uuid, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            session,
            tracker,
            tokens: BTreeMap::new(),
            last_applied: -1,
            halted: None,
        }
    }

    pub fn with_token_state_machine(mut self, state_machine: Arc<ReplicatedTokenStateMachine>) -> Self {
        self.tokens.insert(state_machine.token_type(), state_machine);
        self
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    /// Applies every entry after the last applied one, up to and including `commit_index`. Returns the number of
    /// entries applied.
    pub fn apply_committed(
        &mut self,
        reader: &CachingReader<'_>,
        commit_index: Index,
    ) -> Result<usize, StateMachineError> {
        if let Some(index) = self.halted {
            return Err(StateMachineError::Halted(index));
        }
        let mut applied = 0;
        while self.last_applied < commit_index {
            let from = self.last_applied + 1;
            let max_entries = ((commit_index - self.last_applied) as usize).min(APPLY_BATCH_SIZE);
            let entries = reader.read(from, max_entries).map_err(StateMachineError::from);
            let entries = match entries {
                Ok(entries) if !entries.is_empty() => entries,
                Ok(_) => {
                    warn!("committed entry {} is missing from the log", from);
                    break;
                }
                Err(error) => return Err(self.halt(from, error)),
            };
            for (offset, entry) in entries.into_iter().enumerate() {
                let index = from + offset as Index;
                let content = ReplicatedContent::unmarshal(entry.content)
                    .map_err(StateMachineError::from)
                    .and_then(|content| self.apply(index, content));
                if let Err(error) = content {
                    return Err(self.halt(index, error));
                }
                self.last_applied = index;
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn apply(&self, index: Index, content: ReplicatedContent) -> Result<(), StateMachineError> {
        match content {
            ReplicatedContent::DistributedOperation(DistributedOperation {
                session,
                operation_id,
                content,
            }) => {
                let local = session == self.session;
                let resolve = |result| {
                    if local {
                        self.tracker.resolve(operation_id, result);
                    }
                };
                match *content {
                    ReplicatedContent::TokenRequest(request) => match self.tokens.get(&request.token_type) {
                        Some(state_machine) => state_machine
                            .apply_command(&request, index, |result| resolve(result.map(CommandOutput::Token))),
                        None => {
                            warn!("no state machine for {} tokens at {}", request.token_type, index);
                            resolve(Err(format!("{} tokens are not replicated", request.token_type)));
                            Ok(())
                        }
                    },
                    _ => {
                        resolve(Ok(CommandOutput::Empty));
                        Ok(())
                    }
                }
            }
            ReplicatedContent::TokenRequest(request) => match self.tokens.get(&request.token_type) {
                Some(state_machine) => state_machine.apply_command(&request, index, |_| ()),
                None => Ok(()),
            },
            ReplicatedContent::Membership(_) | ReplicatedContent::Barrier => Ok(()),
        }
    }

    fn halt(&mut self, index: Index, error: StateMachineError) -> StateMachineError {
        error!("halting state machines at {}: {}", index, error);
        self.halted = Some(index);
        self.tracker.abandon_all();
        error
    }
}
