use std::collections::BTreeMap;
use std::mem;

use log::{debug, info, warn};

use crate::content::ReplicatedContent;
use crate::error::{BootstrapError, LogError, StorageError};
use crate::log::cache::CachingReader;
use crate::log::{LogCommand, LogEntry};
use crate::member::{MemberId, MemberSet};
use crate::storage::{MembershipState, StateStorage};
use crate::Index;

use super::outcome::FollowerStates;
use super::Role;

/// Tracks which members vote and which members receive the log.
///
/// The voting set is the one in the latest membership entry of the log, whether committed or not. Membership entries
/// above the commit index are all kept, so that truncating the newest one falls back to the next newest. Replication
/// members are the voting members plus learners: members added to catch up with the log before they are promoted to
/// voting. A learner is promoted, one membership change at a time, once it lags the leader by no more than the
/// configured maximum.
pub struct RaftMembershipManager {
    myself: MemberId,
    storage: Box<dyn StateStorage<MembershipState>>,
    max_lag: Index,

    committed: Option<(Index, MemberSet)>,
    uncommitted: BTreeMap<Index, MemberSet>,
    learners: MemberSet,
    pending: Option<Index>,
}

impl RaftMembershipManager {
    pub fn new(myself: MemberId, storage: Box<dyn StateStorage<MembershipState>>, max_lag: u64) -> Self {
        Self {
            myself,
            storage,
            max_lag: max_lag as Index,
            committed: None,
            uncommitted: BTreeMap::new(),
            learners: MemberSet::new(),
            pending: None,
        }
    }

    /// Rebuilds the member sets from the membership entries in the log.
    pub fn recover(&mut self, reader: &CachingReader<'_>, commit_index: Index) -> Result<(), LogError> {
        let append_index = reader.append_index();
        let mut index = 0;
        while index <= append_index {
            let entries = reader.read(index, 256)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if let Some(members) = membership_of(&entry) {
                    if index <= commit_index {
                        self.committed = Some((index, members));
                    } else {
                        self.uncommitted.insert(index, members);
                    }
                }
                index += 1;
            }
        }
        if let Some((index, members)) = self.latest() {
            info!("recovered {} voting members from entry {}", members.len(), index);
        }
        Ok(())
    }

    /// Returns the members whose votes count, falling back to the stored set before any membership entry is known.
    pub fn voting_members(&self) -> MemberSet {
        match self.latest() {
            Some((_, members)) => members.clone(),
            None => self.storage.initial_state().members,
        }
    }

    fn latest(&self) -> Option<(Index, &MemberSet)> {
        match self.uncommitted.iter().next_back() {
            Some((index, members)) => Some((*index, members)),
            None => self.committed.as_ref().map(|(index, members)| (*index, members)),
        }
    }

    pub fn replication_members(&self) -> MemberSet {
        let mut members = self.voting_members();
        members.extend(self.learners.iter().copied());
        members
    }

    pub fn learners(&self) -> &MemberSet {
        &self.learners
    }

    /// Starts replicating the log to `member` as a learner. Returns `false` if it is already replicated to.
    pub fn add_member(&mut self, member: MemberId) -> bool {
        if self.voting_members().contains(&member) {
            return false;
        }
        let added = self.learners.insert(member);
        if added {
            info!("added {} as learner", member);
        }
        added
    }

    /// Tracks membership entries appended to or truncated from the log. Returns whether the voting set changed.
    pub fn process_log_commands(&mut self, commands: &[LogCommand]) -> bool {
        let before = self.voting_members();
        for command in commands {
            match command {
                LogCommand::Append { index, entry } => {
                    if let Some(members) = membership_of(entry) {
                        debug!("appended membership of {} members at {}", members.len(), index);
                        self.uncommitted.insert(*index, members);
                    }
                }
                LogCommand::Truncate { from } => {
                    let truncated = self.uncommitted.split_off(from);
                    if !truncated.is_empty() {
                        warn!("{} membership entries truncated from {}", truncated.len(), from);
                    }
                    if matches!(self.pending, Some(index) if index >= *from) {
                        self.pending = None;
                    }
                }
            }
        }
        self.voting_members() != before
    }

    /// Records membership entries up to `commit_index` as committed.
    pub fn process_committed(&mut self, commit_index: Index) -> Result<(), StorageError> {
        let remaining = self.uncommitted.split_off(&commit_index.saturating_add(1));
        let newly_committed = mem::replace(&mut self.uncommitted, remaining);
        let (index, members) = match newly_committed.into_iter().next_back() {
            Some(latest) => latest,
            None => return Ok(()),
        };
        self.storage.persist(&MembershipState {
            members: members.clone(),
        })?;
        info!("committed membership of {} members at {}", members.len(), index);
        self.learners.retain(|learner| !members.contains(learner));
        if matches!(self.pending, Some(pending) if pending <= commit_index) {
            self.pending = None;
        }
        self.committed = Some((index, members));
        Ok(())
    }

    /// Adjusts to a change of role. Learners are only tracked by a leader.
    pub fn on_role(&mut self, role: Role) {
        match role {
            Role::Leader => {
                self.pending = self.uncommitted.keys().next_back().copied();
            }
            Role::Follower | Role::Candidate => {
                self.learners.clear();
                self.pending = None;
            }
        }
    }

    /// Returns the voting set promoting a caught-up learner, if one exists and no other change is in progress. A
    /// learner which has not matched any entry yet is never caught up.
    ///
    /// The caller appends the returned set at `append_index + 1`.
    pub fn promotion(&mut self, append_index: Index, follower_states: &FollowerStates) -> Option<MemberSet> {
        if self.pending.is_some() {
            return None;
        }
        let learner = self.learners.iter().copied().find(|learner| {
            follower_states.get(learner).map_or(false, |follower| {
                follower.match_index >= 0 && append_index - follower.match_index <= self.max_lag
            })
        })?;
        let mut members = self.voting_members();
        members.insert(learner);
        info!("promoting {} to voting member", learner);
        self.pending = Some(append_index + 1);
        Some(members)
    }

    /// Refuses a bootstrap with `members` if this member was bootstrapped with a different set before.
    pub fn check_bootstrap(&self, members: &MemberSet) -> Result<(), BootstrapError> {
        if members.is_empty() {
            return Err(BootstrapError::EmptyMemberSet);
        }
        let recorded = self.storage.initial_state().members;
        if !recorded.is_empty() && recorded != *members {
            return Err(BootstrapError::MemberSetMismatch);
        }
        if !members.contains(&self.myself) {
            warn!("bootstrapping {} members without {}", members.len(), self.myself);
        }
        Ok(())
    }

    /// Records the bootstrap membership entry written at index 0.
    pub fn record_bootstrap(&mut self, members: MemberSet) -> Result<(), StorageError> {
        self.storage.persist(&MembershipState {
            members: members.clone(),
        })?;
        self.committed = Some((0, members));
        self.uncommitted.clear();
        Ok(())
    }
}

fn membership_of(entry: &LogEntry) -> Option<MemberSet> {
    match ReplicatedContent::unmarshal(entry.content.clone()) {
        Ok(ReplicatedContent::Membership(members)) => Some(members),
        Ok(_) => None,
        Err(error) => {
            warn!("skipped undecodable entry while tracking membership: {}", error);
            None
        }
    }
}
