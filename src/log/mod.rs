//! Types related to Raft log storage.
//!
//! Raft requires a backing storage for entries of its distributed log as they are being replicated to and from other
//! members. The [`RaftLog`] trait is implemented for that purpose, and the implementation is supplied to
//! [`RaftMachine`](crate::consensus::RaftMachine).

use bytes::Bytes;

use crate::error::LogError;
use crate::{Index, Term};

pub mod cache;
pub mod memory;
pub mod segmented;
#[cfg(test)]
#[macro_use]
pub mod tests;

/// An entry in a [Raft log][RaftLog].
///
/// The index of an entry is its position in the log, so it is not stored in the entry itself.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogEntry {
    /// The term of leadership of the member which appended this entry.
    #[prost(uint64, tag = "1")]
    pub term: Term,

    /// Marshalled [`ReplicatedContent`](crate::content::ReplicatedContent).
    #[prost(bytes = "bytes", tag = "2")]
    pub content: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, content: impl Into<Bytes>) -> Self {
        Self {
            term,
            content: content.into(),
        }
    }
}

/// A modification of the local log requested by a role handler, applied by
/// [`RaftState::update`](crate::consensus::RaftState::update) in order.
#[derive(Clone, Debug, PartialEq)]
pub enum LogCommand {
    Append { index: Index, entry: LogEntry },
    Truncate { from: Index },
}

/// An interface for storage of the Raft log of a member.
///
/// # Initial state
///
/// A Raft log is initialized as empty, with [`append_index`] returning `-1`. The index of the first appended entry is
/// `0` and all indices are contiguous.
///
/// # Truncation
///
/// An uncommitted suffix of the log may be removed with [`truncate`], after which appends continue from the
/// truncation point. Entries at or below the index passed to [`commit`] are never truncated.
///
/// # Durability
///
/// Appended entries are only guaranteed to survive a crash after [`sync`] returns. Any error from a durable
/// implementation means the member can no longer trust its log.
///
/// [`append_index`]: Self::append_index
/// [`commit`]: Self::commit
/// [`sync`]: Self::sync
/// [`truncate`]: Self::truncate
pub trait RaftLog: Send {
    /// Appends an entry at `index`, which must be exactly one past [`append_index`](Self::append_index).
    ///
    /// # Errors
    ///
    /// If `index` is not the next index, or the log could not be modified, an error is returned.
    fn append(&mut self, index: Index, entry: LogEntry) -> Result<(), LogError>;

    /// Reads up to `max_entries` consecutive entries starting at `from`. Returns fewer entries if the log ends first.
    fn read(&self, from: Index, max_entries: usize) -> Result<Vec<LogEntry>, LogError>;

    /// Returns the term of the entry at `index`, `Some(0)` for index `-1`, or `None` if there is no such entry.
    fn read_term(&self, index: Index) -> Result<Option<Term>, LogError>;

    /// Removes all entries at and after `from`, returning the number of entries removed.
    ///
    /// # Errors
    ///
    /// Truncating committed entries, or from beyond the end of the log, is an error.
    fn truncate(&mut self, from: Index) -> Result<usize, LogError>;

    /// Marks entries up to and including `index` as committed, protecting them from truncation.
    fn commit(&mut self, index: Index) -> Result<(), LogError>;

    /// Returns the index of the last entry in the log, or `-1` if empty.
    fn append_index(&self) -> Index;

    /// Returns the highest index passed to [`commit`](Self::commit), or `-1`.
    fn commit_index(&self) -> Index;

    /// Forces appended entries to durable storage.
    fn sync(&mut self) -> Result<(), LogError> {
        Ok(())
    }

    /// Returns the term of the last entry in the log, or `0` if empty.
    fn last_term(&self) -> Result<Term, LogError> {
        Ok(self.read_term(self.append_index())?.unwrap_or_default())
    }

    /// Reads the single entry at `index`.
    fn read_entry(&self, index: Index) -> Result<Option<LogEntry>, LogError> {
        Ok(self.read(index, 1)?.into_iter().next())
    }

    /// Returns the approximate serialized length in bytes of a given entry.
    fn entry_len(&self, entry: &LogEntry) -> usize {
        12 + entry.content.len()
    }
}

pub(crate) fn check_append(index: Index, append_index: Index) -> Result<(), LogError> {
    if index != append_index + 1 {
        return Err(LogError::NonContiguous {
            index,
            append_index,
        });
    }
    Ok(())
}

pub(crate) fn check_truncate(
    from: Index,
    append_index: Index,
    commit_index: Index,
) -> Result<(), LogError> {
    if from <= commit_index {
        return Err(LogError::TruncateCommitted { from, commit_index });
    }
    if from > append_index || from < 0 {
        return Err(LogError::TruncateOutOfRange { from, append_index });
    }
    Ok(())
}

pub(crate) fn check_commit(index: Index, append_index: Index) -> Result<(), LogError> {
    if index > append_index {
        return Err(LogError::CommitBeyondAppend {
            index,
            append_index,
        });
    }
    Ok(())
}
