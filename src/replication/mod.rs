//! Replication of content through the Raft log and delivery of its results.
//!
//! A [`RaftReplicator`] proposes content to the leader and hands back a [`ResultHandle`]. Once the content commits,
//! [`CoreStateMachines`] applies it on every member, and the member which proposed it resolves the handle through its
//! [`ProgressTracker`].

use crate::content::ReplicatedContent;
use crate::error::ReplicationError;

pub mod applier;
pub mod progress;
pub mod replicator;

pub use applier::CoreStateMachines;
pub use progress::ProgressTracker;
pub use replicator::{RaftReplicator, ResultHandle};

/// The result of applying replicated content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandOutput {
    /// The id a token name resolved to.
    Token(u32),
    /// Content without a result, such as a membership change.
    Empty,
}

/// Proposes content for replication.
pub trait Replicate: Send + Sync {
    /// Submits `content` to the current leader. With `track_result`, the returned handle resolves once the content
    /// is applied locally; otherwise it resolves immediately.
    fn replicate(&self, content: ReplicatedContent, track_result: bool) -> Result<ResultHandle, ReplicationError>;
}
