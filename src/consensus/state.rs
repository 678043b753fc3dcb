use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{LogError, RaftError};
use crate::log::cache::{CachingReader, InFlightCache};
use crate::log::{LogCommand, LogEntry, RaftLog};
use crate::member::{MemberId, MemberSet};
use crate::storage::{StateStorage, TermState};
use crate::{Index, Term};

use super::outcome::{FollowerStates, Outcome};

/// The complete consensus state of a member.
///
/// Role handlers only read the state; it changes solely through [`update`](Self::update) with the [`Outcome`] of a
/// handled message.
pub struct RaftState {
    myself: MemberId,
    log: Box<dyn RaftLog>,
    cache: Arc<InFlightCache>,
    term_storage: Box<dyn StateStorage<TermState>>,

    term: Term,
    voted_for: Option<MemberId>,
    leader: Option<MemberId>,
    leader_commit: Index,
    commit_index: Index,

    voting_members: MemberSet,
    replication_members: MemberSet,

    votes_for_me: BTreeSet<MemberId>,
    heartbeat_responses: BTreeSet<MemberId>,
    follower_states: FollowerStates,
    last_log_index_before_we_became_leader: Index,

    pre_vote: bool,
    pre_election: bool,
    pre_votes_for_me: BTreeSet<MemberId>,
}

impl RaftState {
    pub fn new(
        myself: MemberId,
        log: Box<dyn RaftLog>,
        cache: Arc<InFlightCache>,
        term_storage: Box<dyn StateStorage<TermState>>,
    ) -> Self {
        let TermState { term, voted_for } = term_storage.initial_state();
        let commit_index = log.commit_index();
        Self {
            myself,
            log,
            cache,
            term_storage,
            term,
            voted_for,
            leader: None,
            leader_commit: commit_index,
            commit_index,
            voting_members: MemberSet::new(),
            replication_members: MemberSet::new(),
            votes_for_me: BTreeSet::new(),
            heartbeat_responses: BTreeSet::new(),
            follower_states: FollowerStates::new(),
            last_log_index_before_we_became_leader: -1,
            pre_vote: false,
            pre_election: false,
            pre_votes_for_me: BTreeSet::new(),
        }
    }

    /// Makes followers poll the voting members before starting an election.
    pub fn set_pre_vote(&mut self, pre_vote: bool) {
        self.pre_vote = pre_vote;
    }

    pub fn pre_vote(&self) -> bool {
        self.pre_vote
    }

    /// Whether this member is polling for an election it has not started yet.
    pub fn pre_election(&self) -> bool {
        self.pre_election
    }

    pub fn pre_votes_for_me(&self) -> &BTreeSet<MemberId> {
        &self.pre_votes_for_me
    }

    pub fn myself(&self) -> MemberId {
        self.myself
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    pub fn leader_commit(&self) -> Index {
        self.leader_commit
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn append_index(&self) -> Index {
        self.log.append_index()
    }

    pub fn last_term(&self) -> Result<Term, LogError> {
        self.log.last_term()
    }

    pub fn voting_members(&self) -> &MemberSet {
        &self.voting_members
    }

    pub fn replication_members(&self) -> &MemberSet {
        &self.replication_members
    }

    pub fn votes_for_me(&self) -> &BTreeSet<MemberId> {
        &self.votes_for_me
    }

    pub fn heartbeat_responses(&self) -> &BTreeSet<MemberId> {
        &self.heartbeat_responses
    }

    pub fn follower_states(&self) -> &FollowerStates {
        &self.follower_states
    }

    pub fn last_log_index_before_we_became_leader(&self) -> Index {
        self.last_log_index_before_we_became_leader
    }

    pub fn log(&self) -> &dyn RaftLog {
        &*self.log
    }

    pub fn cache(&self) -> &InFlightCache {
        &self.cache
    }

    /// Returns a reader over the log which prefers entries held by the in-flight cache.
    pub fn reader(&self) -> CachingReader<'_> {
        CachingReader::new(&*self.log, &self.cache)
    }

    /// Replaces the member sets. While leading, replication progress starts being tracked for new replication
    /// members and is dropped for removed ones.
    pub fn set_members(&mut self, voting_members: MemberSet, replication_members: MemberSet) {
        if self.leader == Some(self.myself) {
            self.follower_states
                .retain(|member, _| replication_members.contains(member));
            for member in replication_members.iter().filter(|member| **member != self.myself) {
                self.follower_states.entry(*member).or_default();
            }
        }
        self.voting_members = voting_members;
        self.replication_members = replication_members;
    }

    /// Transitions to the state described by `outcome`, persisting the term and vote first if they changed.
    pub fn update(&mut self, outcome: &Outcome) -> Result<(), RaftError> {
        if outcome.term != self.term || outcome.voted_for != self.voted_for {
            if outcome.term < self.term {
                return Err(RaftError::IllegalState {
                    term: self.term,
                    reason: format!("term cannot decrease to {}", outcome.term),
                });
            }
            self.term_storage.persist(&TermState {
                term: outcome.term,
                voted_for: outcome.voted_for,
            })?;
            self.term = outcome.term;
            self.voted_for = outcome.voted_for;
        }

        self.leader = outcome.leader;
        self.leader_commit = outcome.leader_commit;
        self.votes_for_me = outcome.votes_for_me.clone();
        self.heartbeat_responses = outcome.heartbeat_responses.clone();
        self.follower_states = outcome.follower_states.clone();
        self.last_log_index_before_we_became_leader = outcome.last_log_index_before_we_became_leader;
        self.pre_election = outcome.pre_election;
        self.pre_votes_for_me = outcome.pre_votes_for_me.clone();

        for command in &outcome.log_commands {
            self.apply(command)?;
        }

        if outcome.commit_index > self.commit_index {
            self.log.commit(outcome.commit_index)?;
            self.commit_index = outcome.commit_index;
        }
        Ok(())
    }

    fn apply(&mut self, command: &LogCommand) -> Result<(), LogError> {
        match command {
            LogCommand::Append { index, entry } => {
                self.log.append(*index, entry.clone())?;
                self.cache.put(*index, entry.clone());
            }
            LogCommand::Truncate { from } => {
                let removed = self.log.truncate(*from)?;
                self.cache.truncate(*from);
                debug!("truncated {} entries from {}", removed, from);
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.log.sync()
    }

    /// Appends the first entry of a new cluster's log and commits it.
    pub fn bootstrap(&mut self, entry: LogEntry) -> Result<(), LogError> {
        self.log.append(0, entry)?;
        self.log.sync()?;
        self.log.commit(0)?;
        self.commit_index = 0;
        self.leader_commit = 0;
        Ok(())
    }
}

impl fmt::Display for RaftState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RaftState")
            .field("myself", &format_args!("{}", self.myself))
            .field("term", &self.term)
            .field("leader", &self.leader.map(|leader| leader.to_string()))
            .field("commit_index", &self.commit_index)
            .field("append_index", &self.log.append_index())
            .finish()
    }
}
