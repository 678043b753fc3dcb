//! A naive in-memory implementation of [`RaftLog`](super::RaftLog), primarily for testing.

use std::convert::TryFrom;

use crate::error::LogError;
use crate::{Index, Term};

use super::{check_append, check_commit, check_truncate, LogEntry, RaftLog};

/// A naive in-memory implementation of [`RaftLog`](super::RaftLog), primarily for testing. It provides no crash
/// recovery.
#[derive(Clone, Debug)]
pub struct InMemoryRaftLog {
    entries: Vec<LogEntry>,
    commit_index: Index,
}

impl InMemoryRaftLog {
    /// Constructs an empty log.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            commit_index: -1,
        }
    }

    fn position(&self, index: Index) -> Option<usize> {
        let position = usize::try_from(index).ok()?;
        if position < self.entries.len() {
            Some(position)
        } else {
            None
        }
    }
}

impl Default for InMemoryRaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog for InMemoryRaftLog {
    fn append(&mut self, index: Index, entry: LogEntry) -> Result<(), LogError> {
        check_append(index, self.append_index())?;
        self.entries.push(entry);
        Ok(())
    }

    fn read(&self, from: Index, max_entries: usize) -> Result<Vec<LogEntry>, LogError> {
        Ok(match self.position(from) {
            Some(start) => self.entries[start..]
                .iter()
                .take(max_entries)
                .cloned()
                .collect(),
            None => Vec::new(),
        })
    }

    fn read_term(&self, index: Index) -> Result<Option<Term>, LogError> {
        if index == -1 {
            return Ok(Some(0));
        }
        Ok(self
            .position(index)
            .map(|position| self.entries[position].term))
    }

    fn truncate(&mut self, from: Index) -> Result<usize, LogError> {
        check_truncate(from, self.append_index(), self.commit_index)?;
        let start = from as usize;
        let removed = self.entries.len() - start;
        self.entries.truncate(start);
        Ok(removed)
    }

    fn commit(&mut self, index: Index) -> Result<(), LogError> {
        check_commit(index, self.append_index())?;
        self.commit_index = self.commit_index.max(index);
        Ok(())
    }

    fn append_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    fn commit_index(&self) -> Index {
        self.commit_index
    }
}
