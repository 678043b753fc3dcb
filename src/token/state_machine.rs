use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::content::ReplicatedTokenRequest;
use crate::error::{CommitError, StateMachineError};
use crate::Index;

use super::{Token, TokenRegistry, TokenType};

/// A store command to be applied, with the log index it was committed at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionToApply {
    pub command: Bytes,
    pub log_index: Index,
}

/// Applies committed store commands to the underlying store.
pub trait TransactionCommitProcess: Send + Sync {
    fn commit(&self, transaction: TransactionToApply) -> Result<(), CommitError>;
}

/// Applies committed token requests of one [`TokenType`] to the store and to the [`TokenRegistry`].
///
/// Application is idempotent across restarts: requests at or below the index the store was last committed at are
/// skipped.
pub struct ReplicatedTokenStateMachine {
    token_type: TokenType,
    registry: Arc<TokenRegistry>,
    installed: Mutex<Option<Installed>>,
}

struct Installed {
    sink: Arc<dyn TransactionCommitProcess>,
    last_committed_index: Index,
}

impl ReplicatedTokenStateMachine {
    pub fn new(registry: Arc<TokenRegistry>) -> Self {
        Self {
            token_type: registry.token_type(),
            registry,
            installed: Mutex::new(None),
        }
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    /// Installs the store commands are committed to. `last_committed_index` is the log index of the last command the
    /// store already holds.
    pub fn install_commit_process(&self, sink: Arc<dyn TransactionCommitProcess>, last_committed_index: Index) {
        info!(
            "installed {} token commit process at index {}",
            self.token_type, last_committed_index
        );
        *self.installed.lock() = Some(Installed {
            sink,
            last_committed_index,
        });
    }

    pub fn last_applied_index(&self) -> Result<Index, StateMachineError> {
        self.installed
            .lock()
            .as_ref()
            .map(|installed| installed.last_committed_index)
            .ok_or(StateMachineError::NotInstalled)
    }

    /// Applies a committed request at `index`, invoking `callback` with the id the name resolves to.
    ///
    /// A stale request is skipped without invoking `callback`. If the store fails to commit, `callback` receives the
    /// failure and the error is returned; the caller must stop applying entries.
    pub fn apply_command(
        &self,
        request: &ReplicatedTokenRequest,
        index: Index,
        callback: impl FnOnce(Result<u32, String>),
    ) -> Result<(), StateMachineError> {
        let mut installed = self.installed.lock();
        let installed = installed.as_mut().ok_or(StateMachineError::NotInstalled)?;
        if index <= installed.last_committed_index {
            debug!(
                "skipping {} token request for {} at {}, store is at {}",
                self.token_type, request.token_name, index, installed.last_committed_index
            );
            return Ok(());
        }

        if let Some(existing) = self.registry.get_id(&request.token_name) {
            verbose!(
                "{} token {} already exists with id {}",
                self.token_type,
                request.token_name,
                existing
            );
            installed.last_committed_index = index;
            callback(Ok(existing));
            return Ok(());
        }

        let proposed = match proposed_id(&request.command_bytes) {
            Some(proposed) => proposed,
            None => {
                let error = StateMachineError::MalformedCommand(format!(
                    "{} byte command for {} token {} carries no id",
                    request.command_bytes.len(),
                    self.token_type,
                    request.token_name
                ));
                warn!("{}", error);
                installed.last_committed_index = index;
                callback(Err(error.to_string()));
                return Ok(());
            }
        };
        let (id, command) = match self.registry.get_token(proposed) {
            Ok(taken) => {
                let id = self.registry.next_free_id();
                warn!(
                    "{} token id {} proposed for {} is taken by {}, allocating {}",
                    self.token_type, proposed, request.token_name, taken, id
                );
                (id, with_id(&request.command_bytes, id))
            }
            Err(_) => (proposed, request.command_bytes.clone()),
        };

        if let Err(commit_error) = installed.sink.commit(TransactionToApply {
            command,
            log_index: index,
        }) {
            error!("failed to apply {} token {}: {}", self.token_type, request.token_name, commit_error);
            callback(Err(commit_error.to_string()));
            return Err(commit_error.into());
        }
        installed.last_committed_index = index;
        self.registry.add(Token::new(request.token_name.clone(), id))?;
        debug!("created {} token {} with id {} at {}", self.token_type, request.token_name, id, index);
        callback(Ok(id));
        Ok(())
    }
}

/// Builds the default store command creating token `name` with `id`: the big-endian id followed by the name.
pub fn create_token_command(name: &str, id: u32) -> Bytes {
    let mut command = BytesMut::with_capacity(4 + name.len());
    command.extend_from_slice(&id.to_be_bytes());
    command.extend_from_slice(name.as_bytes());
    command.freeze()
}

/// Reads the token id a command creates from its first four bytes.
pub fn proposed_id(command: &[u8]) -> Option<u32> {
    let bytes = command.get(..4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn with_id(command: &[u8], id: u32) -> Bytes {
    let mut command = BytesMut::from(command);
    command[..4].copy_from_slice(&id.to_be_bytes());
    command.freeze()
}
