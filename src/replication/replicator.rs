use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use uuid::Uuid;

use crate::config::RaftConfig;
use crate::consensus::{LeaderCell, Outbound};
use crate::content::{DistributedOperation, ReplicatedContent};
use crate::error::{ReplicationError, SendError};
use crate::member::MemberId;
use crate::message::{InboundMessage, Message, NewEntryRequest, RaftMessage, Rpc};

use super::progress::OperationResult;
use super::{CommandOutput, ProgressTracker, Replicate};

/// Replicates content by proposing it to the current leader as a [`NewEntryRequest`].
///
/// Content is wrapped in a [`DistributedOperation`] carrying this replicator's session, so that of all members
/// applying the entry, only this one resolves the proposer's [`ResultHandle`].
pub struct RaftReplicator {
    session: Uuid,
    next_operation: AtomicU64,
    tracker: Arc<ProgressTracker>,
    proposer: Arc<Proposer>,
    retry_timeout: Duration,
}

/// Sends proposals to the leader, wherever it currently is.
struct Proposer {
    myself: MemberId,
    leader: Arc<LeaderCell>,
    inbox: Sender<InboundMessage>,
    outbound: Arc<dyn Outbound>,
    leader_lookup_timeout: Duration,
}

/// A pending result of [`Replicate::replicate`].
pub struct ResultHandle {
    receiver: Option<Receiver<OperationResult>>,
    retry: Option<Box<dyn Fn() -> Result<(), ReplicationError> + Send>>,
    retry_timeout: Duration,
}

//
// RaftReplicator impls
//

impl RaftReplicator {
    pub fn new(
        myself: MemberId,
        session: Uuid,
        leader: Arc<LeaderCell>,
        inbox: Sender<InboundMessage>,
        outbound: Arc<dyn Outbound>,
        tracker: Arc<ProgressTracker>,
        config: &RaftConfig,
    ) -> Self {
        Self {
            session,
            next_operation: AtomicU64::new(0),
            tracker,
            proposer: Arc::new(Proposer {
                myself,
                leader,
                inbox,
                outbound,
                leader_lookup_timeout: config.leader_lookup_timeout,
            }),
            retry_timeout: config.replication_retry_timeout,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}

impl Replicate for RaftReplicator {
    fn replicate(&self, content: ReplicatedContent, track_result: bool) -> Result<ResultHandle, ReplicationError> {
        let operation_id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let content = ReplicatedContent::DistributedOperation(DistributedOperation {
            session: self.session,
            operation_id,
            content: Box::new(content),
        })
        .marshal();

        let receiver = if track_result {
            Some(self.tracker.register(operation_id))
        } else {
            None
        };
        if let Err(error) = self.proposer.propose(content.clone()) {
            self.tracker.abandon(operation_id);
            return Err(error);
        }
        debug!("proposed operation {} of session {}", operation_id, self.session);

        let proposer = Arc::clone(&self.proposer);
        Ok(ResultHandle {
            receiver,
            retry: Some(Box::new(move || proposer.propose(content.clone()))),
            retry_timeout: self.retry_timeout,
        })
    }
}

//
// Proposer impls
//

impl Proposer {
    fn propose(&self, content: Bytes) -> Result<(), ReplicationError> {
        let leader = self.leader.await_leader(self.leader_lookup_timeout)?;
        let message = Message::new(0, Rpc::NewEntryRequest(NewEntryRequest { content }));
        if leader == self.myself {
            self.inbox
                .send((self.myself, RaftMessage::Message(message)))
                .map_err(|_| SendError::Disconnected(self.myself))?;
        } else {
            self.outbound.send(leader, message)?;
        }
        Ok(())
    }
}

//
// ResultHandle impls
//

impl ResultHandle {
    /// A handle for content whose result is not tracked.
    pub fn untracked() -> Self {
        Self {
            receiver: None,
            retry: None,
            retry_timeout: Duration::MAX,
        }
    }

    /// A handle resolved by whoever holds the sending side of `receiver`, without re-proposals.
    pub(crate) fn pending(receiver: Receiver<OperationResult>, retry_timeout: Duration) -> Self {
        Self {
            receiver: Some(receiver),
            retry: None,
            retry_timeout,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.receiver.is_some()
    }

    /// Waits for the result, re-proposing the content whenever none arrives within the retry timeout.
    pub fn wait(&self) -> Result<CommandOutput, ReplicationError> {
        self.wait_until(None)
    }

    /// As [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<CommandOutput, ReplicationError> {
        self.wait_until(Some((Instant::now() + timeout, timeout)))
            .map_err(|error| match error {
                ReplicationError::Timeout(_) => ReplicationError::Timeout(timeout),
                error => error,
            })
    }

    fn wait_until(&self, deadline: Option<(Instant, Duration)>) -> Result<CommandOutput, ReplicationError> {
        let receiver = match &self.receiver {
            Some(receiver) => receiver,
            None => return Ok(CommandOutput::Empty),
        };
        loop {
            let mut wait = self.retry_timeout;
            if let Some((deadline, timeout)) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ReplicationError::Timeout(timeout));
                }
                wait = wait.min(remaining);
            }
            match receiver.recv_timeout(wait) {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(reason)) => return Err(ReplicationError::Rejected(reason)),
                Err(RecvTimeoutError::Disconnected) => return Err(ReplicationError::Abandoned),
                Err(RecvTimeoutError::Timeout) => {
                    let expired = deadline.map_or(false, |(deadline, _)| Instant::now() >= deadline);
                    if expired {
                        continue;
                    }
                    if let Some(retry) = &self.retry {
                        match retry() {
                            Ok(()) => debug!("re-proposed operation after {:?}", wait),
                            Err(error) if error.is_retryable() => {
                                warn!("failed to re-propose operation: {}", error)
                            }
                            Err(error) => return Err(error),
                        }
                    }
                }
            }
        }
    }
}
