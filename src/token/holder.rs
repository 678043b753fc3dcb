use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use crate::content::{ReplicatedContent, ReplicatedTokenRequest};
use crate::error::{ReplicationError, TokenError};
use crate::replication::{CommandOutput, Replicate};

use super::{Token, TokenRegistry, TokenType};

const MAX_ATTEMPTS: usize = 10;

/// Builds the store command creating a token with a name and an id.
pub type CommandFactory = Box<dyn Fn(&str, u32) -> Bytes + Send + Sync>;

/// Proposes ids for new tokens.
///
/// Proposals only need to be unique per member: if a proposed id turns out to be taken when the request is applied,
/// the state machine allocates another.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u32;
}

pub struct AtomicIdGenerator {
    next: AtomicU32,
}

/// Resolves token names of one [`TokenType`] to ids, creating missing tokens through the cluster.
pub struct ReplicatedTokenHolder<R> {
    token_type: TokenType,
    registry: Arc<TokenRegistry>,
    replicator: Arc<R>,
    id_generator: Arc<dyn IdGenerator>,
    command_factory: CommandFactory,
}

//
// AtomicIdGenerator impls
//

impl AtomicIdGenerator {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }
}

impl IdGenerator for AtomicIdGenerator {
    fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Proposes the lowest id not yet taken locally.
impl IdGenerator for TokenRegistry {
    fn next_id(&self) -> u32 {
        self.next_free_id()
    }
}

//
// ReplicatedTokenHolder impls
//

impl<R: Replicate> ReplicatedTokenHolder<R> {
    pub fn new(
        registry: Arc<TokenRegistry>,
        replicator: Arc<R>,
        id_generator: Arc<dyn IdGenerator>,
        command_factory: CommandFactory,
    ) -> Self {
        Self {
            token_type: registry.token_type(),
            registry,
            replicator,
            id_generator,
            command_factory,
        }
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Returns the id of the token named `name`, creating the token if it does not exist yet.
    ///
    /// Blocks until the creating request is applied locally. If another member created the same name first, its id
    /// is returned.
    pub fn get_or_create_id(&self, name: &str) -> Result<u32, TokenError> {
        if let Some(id) = self.registry.get_id(name) {
            return Ok(id);
        }
        let proposed = self.id_generator.next_id();
        let request = ReplicatedTokenRequest::new(self.token_type, name, (self.command_factory)(name, proposed));

        let mut attempt = 1;
        loop {
            match self.replicate(request.clone()) {
                Ok(id) => {
                    debug!("{} token {} resolved to {}", self.token_type, name, id);
                    return Ok(id);
                }
                Err(error) if error.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        "attempt {} to create {} token {} failed: {}",
                        attempt, self.token_type, name, error
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub fn get_token_by_id(&self, id: u32) -> Result<Token, TokenError> {
        self.registry.get_token(id)
    }

    fn replicate(&self, request: ReplicatedTokenRequest) -> Result<u32, ReplicationError> {
        let handle = self
            .replicator
            .replicate(ReplicatedContent::TokenRequest(request), true)?;
        match handle.wait()? {
            CommandOutput::Token(id) => Ok(id),
            CommandOutput::Empty => Err(ReplicationError::Rejected(format!(
                "{} token request produced no id",
                self.token_type
            ))),
        }
    }
}
