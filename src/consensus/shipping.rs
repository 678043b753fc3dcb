//! Shipping of the leader's log to followers.
//!
//! The leader keeps one [`LogShipper`] per replication member. A shipper starts out not knowing where the follower's
//! log matches the leader's and searches backwards until it finds out. From then on new entries are pipelined to the
//! follower as they are appended. A follower lagging by more than the maximum lag is instead caught up with one batch
//! in flight at a time, so that a slow follower cannot make the leader queue an unbounded amount of entries for it.

use std::collections::BTreeMap;
use std::fmt;

use log::{error, info};

use crate::error::LogError;
use crate::log::cache::CachingReader;
use crate::log::LogEntry;
use crate::member::{MemberId, MemberSet};
use crate::message::{AppendRequest, Message, Rpc, SendableMessage};
use crate::{Index, Term};

use super::outcome::ShipCommand;

/// The leadership a shipping manager ships the log for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeaderContext {
    pub term: Term,
    pub commit_index: Index,
}

/// How a shipper currently sends entries to its follower.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Probing for the last index where the follower's log matches ours.
    Mismatch,
    /// Sending new entries as they are appended.
    Pipeline,
    /// Sending one batch of old entries at a time.
    CatchingUp,
}

/// The shipping state of one follower.
#[derive(Debug)]
struct LogShipper {
    member: MemberId,
    mode: Mode,
    match_index: Index,
    last_sent_index: Index,
    search_index: Index,
    stalled: bool,
}

/// Drives one [`LogShipper`] per follower while this member leads.
pub struct LogShippingManager {
    myself: MemberId,
    batch_size: usize,
    max_lag: Index,
    context: Option<LeaderContext>,
    shippers: BTreeMap<MemberId, LogShipper>,
}

/// What a shipper needs to send entries.
struct Source<'a, 'r> {
    reader: &'a CachingReader<'r>,
    context: LeaderContext,
    batch_size: usize,
    max_lag: Index,
}

type Shipped = Result<Vec<SendableMessage>, LogError>;

//
// LogShippingManager impls
//

impl LogShippingManager {
    pub fn new(myself: MemberId, batch_size: usize, max_lag: u64) -> Self {
        Self {
            myself,
            batch_size: batch_size.max(1),
            max_lag: max_lag as Index,
            context: None,
            shippers: BTreeMap::new(),
        }
    }

    pub fn is_shipping(&self) -> bool {
        self.context.is_some()
    }

    pub fn mode_of(&self, member: &MemberId) -> Option<Mode> {
        self.shippers.get(member).map(|shipper| shipper.mode)
    }

    pub fn match_index_of(&self, member: &MemberId) -> Option<Index> {
        self.shippers.get(member).map(|shipper| shipper.match_index)
    }

    /// Starts shipping to `members` on behalf of a new leadership, probing every follower first.
    pub fn resume(&mut self, context: LeaderContext, members: &MemberSet, reader: &CachingReader<'_>) -> Shipped {
        info!("resumed log shipping at term {}", context.term);
        self.context = Some(context);
        self.shippers.clear();
        self.on_members_changed(members, reader)
    }

    /// Stops shipping, forgetting the progress of every follower.
    pub fn pause(&mut self) {
        if self.context.take().is_some() {
            info!("paused log shipping");
        }
        self.shippers.clear();
    }

    /// Starts shipping to new replication members and stops shipping to removed ones.
    pub fn on_members_changed(&mut self, members: &MemberSet, reader: &CachingReader<'_>) -> Shipped {
        let source = match self.source(reader) {
            Some(source) => source,
            None => return Ok(Vec::new()),
        };
        self.shippers.retain(|member, _| members.contains(member));
        let mut messages = Vec::new();
        for member in members.iter().filter(|member| **member != self.myself) {
            if self.shippers.contains_key(member) {
                continue;
            }
            let mut shipper = LogShipper::new(*member, reader.append_index());
            verbose!("started shipping to {}", member);
            shipper.search(&source, &mut messages)?;
            self.shippers.insert(*member, shipper);
        }
        Ok(messages)
    }

    /// Acts on the ship commands of a leader's outcome. `commit_index` is the leader's commit index after the outcome.
    pub fn handle_commands(
        &mut self,
        commands: &[ShipCommand],
        commit_index: Index,
        reader: &CachingReader<'_>,
    ) -> Shipped {
        let mut messages = Vec::new();
        let context = match &mut self.context {
            Some(context) => {
                context.commit_index = commit_index;
                *context
            }
            None => return Ok(messages),
        };
        let source = Source {
            reader,
            context,
            batch_size: self.batch_size,
            max_lag: self.max_lag,
        };
        for command in commands {
            match command {
                ShipCommand::Mismatch {
                    member,
                    last_remote_append_index,
                } => {
                    if let Some(shipper) = self.shippers.get_mut(member) {
                        shipper.on_mismatch(*last_remote_append_index, &source, &mut messages)?;
                    }
                }
                ShipCommand::Match { member, match_index } => {
                    if let Some(shipper) = self.shippers.get_mut(member) {
                        shipper.on_match(*match_index, &source, &mut messages)?;
                    }
                }
                ShipCommand::NewEntries {
                    prev_index,
                    prev_term,
                    entries,
                } => {
                    for shipper in self.shippers.values_mut() {
                        shipper.on_new_entries(*prev_index, *prev_term, entries, &source, &mut messages)?;
                    }
                }
                ShipCommand::CommitUpdate => {
                    for shipper in self.shippers.values_mut() {
                        shipper.on_commit_update(&source, &mut messages)?;
                    }
                }
            }
        }
        Ok(messages)
    }

    /// Retransmits to followers which have not responded since the previous heartbeat.
    pub fn on_heartbeat(&mut self, reader: &CachingReader<'_>) -> Shipped {
        let source = match self.source(reader) {
            Some(source) => source,
            None => return Ok(Vec::new()),
        };
        let mut messages = Vec::new();
        for shipper in self.shippers.values_mut() {
            shipper.on_heartbeat(&source, &mut messages)?;
        }
        Ok(messages)
    }

    fn source<'a, 'r>(&self, reader: &'a CachingReader<'r>) -> Option<Source<'a, 'r>> {
        Some(Source {
            reader,
            context: self.context?,
            batch_size: self.batch_size,
            max_lag: self.max_lag,
        })
    }
}

//
// LogShipper impls
//

impl LogShipper {
    fn new(member: MemberId, append_index: Index) -> Self {
        Self {
            member,
            mode: Mode::Mismatch,
            match_index: -1,
            last_sent_index: append_index,
            search_index: append_index,
            stalled: false,
        }
    }

    fn on_mismatch(
        &mut self,
        remote_append_index: Index,
        source: &Source<'_, '_>,
        out: &mut Vec<SendableMessage>,
    ) -> Result<(), LogError> {
        self.stalled = false;
        if self.mode != Mode::Mismatch {
            verbose!("{} diverged from the log, probing", self.member);
            self.mode = Mode::Mismatch;
            self.search_index = self.last_sent_index;
        }
        self.search_index = (self.search_index - 1).min(remote_append_index).max(self.match_index);
        if self.search_index <= self.match_index {
            verbose!("{} is known to match at {}", self.member, self.match_index);
            return self.ship_from_match(source, out);
        }
        self.search(source, out)
    }

    fn on_match(
        &mut self,
        match_index: Index,
        source: &Source<'_, '_>,
        out: &mut Vec<SendableMessage>,
    ) -> Result<(), LogError> {
        self.stalled = false;
        if match_index <= self.match_index {
            return Ok(());
        }
        self.match_index = match_index;
        let append_index = source.reader.append_index();
        match self.mode {
            Mode::Mismatch => self.ship_from_match(source, out),
            Mode::CatchingUp if match_index >= self.last_sent_index => {
                if append_index - match_index > source.max_lag {
                    self.send_batch(source, out)
                } else {
                    self.set_mode(Mode::Pipeline);
                    self.send_remaining(source, out)
                }
            }
            Mode::CatchingUp | Mode::Pipeline => Ok(()),
        }
    }

    fn on_new_entries(
        &mut self,
        prev_index: Index,
        prev_term: Term,
        entries: &[LogEntry],
        source: &Source<'_, '_>,
        out: &mut Vec<SendableMessage>,
    ) -> Result<(), LogError> {
        if self.mode != Mode::Pipeline {
            return Ok(());
        }
        let last_index = prev_index + entries.len() as Index;
        if last_index - self.match_index > source.max_lag {
            verbose!("{} lags by {}, catching up", self.member, last_index - self.match_index);
            self.set_mode(Mode::CatchingUp);
            if self.last_sent_index <= self.match_index {
                self.send_batch(source, out)?;
            }
            return Ok(());
        }
        if prev_index == self.last_sent_index {
            self.send(prev_index, prev_term, entries.to_vec(), source, out);
            self.last_sent_index = last_index;
            Ok(())
        } else {
            self.send_remaining(source, out)
        }
    }

    fn on_commit_update(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        if self.mode != Mode::Pipeline {
            return Ok(());
        }
        match source.reader.read_term(self.last_sent_index)? {
            Some(prev_term) => self.send(self.last_sent_index, prev_term, Vec::new(), source, out),
            None => error!("missing entry {} to ship to {}", self.last_sent_index, self.member),
        }
        Ok(())
    }

    fn on_heartbeat(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        if !self.stalled {
            self.stalled = true;
            return Ok(());
        }
        match self.mode {
            Mode::Mismatch => self.search(source, out),
            Mode::Pipeline | Mode::CatchingUp if self.last_sent_index > self.match_index => {
                verbose!("retransmitting to {} after {}", self.member, self.match_index);
                self.last_sent_index = self.match_index;
                if self.mode == Mode::Pipeline {
                    self.send_remaining(source, out)
                } else {
                    self.send_batch(source, out)
                }
            }
            Mode::Pipeline | Mode::CatchingUp => Ok(()),
        }
    }

    /// Leaves probing: ships everything after the match index, or its first batch if the follower lags too far.
    fn ship_from_match(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        self.last_sent_index = self.match_index;
        if source.reader.append_index() - self.match_index > source.max_lag {
            self.set_mode(Mode::CatchingUp);
            self.send_batch(source, out)
        } else {
            self.set_mode(Mode::Pipeline);
            self.send_remaining(source, out)
        }
    }

    /// Sends an empty append after the search index, to learn whether the follower holds the entry there.
    fn search(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        match source.reader.read_term(self.search_index)? {
            Some(prev_term) => {
                verbose!("searching {} at {}", self.member, self.search_index);
                self.send(self.search_index, prev_term, Vec::new(), source, out);
            }
            None => error!("missing entry {} to search {}", self.search_index, self.member),
        }
        Ok(())
    }

    /// Sends the next batch after the last sent index.
    fn send_batch(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        let prev_index = self.last_sent_index;
        let prev_term = match source.reader.read_term(prev_index)? {
            Some(prev_term) => prev_term,
            None => {
                error!("missing entry {} to ship to {}", prev_index, self.member);
                return Ok(());
            }
        };
        let entries = source.reader.read(prev_index + 1, source.batch_size)?;
        if entries.is_empty() {
            return Ok(());
        }
        self.last_sent_index = prev_index + entries.len() as Index;
        self.send(prev_index, prev_term, entries, source, out);
        Ok(())
    }

    /// Sends every entry after the last sent index, in batches.
    fn send_remaining(&mut self, source: &Source<'_, '_>, out: &mut Vec<SendableMessage>) -> Result<(), LogError> {
        let append_index = source.reader.append_index();
        while self.last_sent_index < append_index {
            let last_sent_index = self.last_sent_index;
            self.send_batch(source, out)?;
            if self.last_sent_index == last_sent_index {
                break;
            }
        }
        Ok(())
    }

    fn send(
        &self,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        source: &Source<'_, '_>,
        out: &mut Vec<SendableMessage>,
    ) {
        let request = AppendRequest {
            prev_log_index,
            prev_log_term,
            leader_commit: source.context.commit_index,
            entries,
        };
        out.push(SendableMessage {
            message: Message::new(source.context.term, Rpc::AppendRequest(request)),
            dest: self.member,
        });
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            verbose!("{} shipping switched from {} to {}", self.member, self.mode, mode);
            self.mode = mode;
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Mismatch => "mismatch",
            Mode::Pipeline => "pipeline",
            Mode::CatchingUp => "catching up",
        };
        fmt.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::log::cache::InFlightCache;
    use crate::log::memory::InMemoryRaftLog;
    use crate::log::RaftLog;

    use super::*;

    fn log_of(len: usize) -> InMemoryRaftLog {
        let mut log = InMemoryRaftLog::new();
        for index in 0..len {
            log.append(index as Index, LogEntry::new(1, Bytes::from_static(b"x"))).unwrap();
        }
        log
    }

    fn append_request(message: &SendableMessage) -> &AppendRequest {
        match &message.message.rpc {
            Some(Rpc::AppendRequest(request)) => request,
            rpc => panic!("expected append request, got {:?}", rpc),
        }
    }

    #[test]
    fn searches_back_to_match_then_pipelines() {
        let log = log_of(5);
        let cache = InFlightCache::new(16, 1024);
        let reader = CachingReader::new(&log, &cache);
        let (leader, follower) = (MemberId::random(), MemberId::random());
        let members: MemberSet = [leader, follower].into_iter().collect();

        let mut manager = LogShippingManager::new(leader, 2, 10);
        let context = LeaderContext { term: 1, commit_index: -1 };
        let searches = manager.resume(context, &members, &reader).unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(append_request(&searches[0]).prev_log_index, 4);
        assert_eq!(manager.mode_of(&follower), Some(Mode::Mismatch));

        let mismatch = ShipCommand::Mismatch {
            member: follower,
            last_remote_append_index: 1,
        };
        let searches = manager.handle_commands(&[mismatch], -1, &reader).unwrap();
        assert_eq!(append_request(&searches[0]).prev_log_index, 1);

        let matched = ShipCommand::Match {
            member: follower,
            match_index: 1,
        };
        let sent = manager.handle_commands(&[matched], -1, &reader).unwrap();
        assert_eq!(manager.mode_of(&follower), Some(Mode::Pipeline));
        let sent: Vec<_> = sent.iter().map(|message| append_request(message).entries.len()).collect();
        assert_eq!(sent, vec![2, 1]);
    }

    #[test]
    fn lagging_follower_catches_up_one_batch_at_a_time() {
        let log = log_of(20);
        let cache = InFlightCache::new(16, 1024);
        let reader = CachingReader::new(&log, &cache);
        let (leader, follower) = (MemberId::random(), MemberId::random());
        let members: MemberSet = [leader, follower].into_iter().collect();

        let mut manager = LogShippingManager::new(leader, 4, 8);
        manager
            .resume(LeaderContext { term: 1, commit_index: -1 }, &members, &reader)
            .unwrap();
        let matched = ShipCommand::Match {
            member: follower,
            match_index: 2,
        };
        let sent = manager.handle_commands(&[matched], -1, &reader).unwrap();
        assert_eq!(manager.mode_of(&follower), Some(Mode::CatchingUp));
        assert_eq!(sent.len(), 1);
        assert_eq!(append_request(&sent[0]).prev_log_index, 2);
        assert_eq!(append_request(&sent[0]).entries.len(), 4);

        let new_entries = ShipCommand::NewEntries {
            prev_index: 19,
            prev_term: 1,
            entries: vec![LogEntry::new(1, Bytes::from_static(b"y"))],
        };
        assert!(manager.handle_commands(&[new_entries], -1, &reader).unwrap().is_empty());

        let matched = ShipCommand::Match {
            member: follower,
            match_index: 6,
        };
        let sent = manager.handle_commands(&[matched], -1, &reader).unwrap();
        assert_eq!(append_request(&sent[0]).prev_log_index, 6);
        assert_eq!(manager.mode_of(&follower), Some(Mode::CatchingUp));

        let matched = ShipCommand::Match {
            member: follower,
            match_index: 10,
        };
        manager.handle_commands(&[matched], -1, &reader).unwrap();
        assert_eq!(manager.mode_of(&follower), Some(Mode::CatchingUp));

        let matched = ShipCommand::Match {
            member: follower,
            match_index: 14,
        };
        let sent = manager.handle_commands(&[matched], -1, &reader).unwrap();
        assert_eq!(manager.mode_of(&follower), Some(Mode::Pipeline));
        assert_eq!(sent.iter().map(|message| append_request(message).entries.len()).sum::<usize>(), 5);
    }

    #[test]
    fn empty_follower_is_shipped_from_the_start() {
        let log = log_of(3);
        let cache = InFlightCache::new(16, 1024);
        let reader = CachingReader::new(&log, &cache);
        let (leader, learner) = (MemberId::random(), MemberId::random());

        let mut manager = LogShippingManager::new(leader, 8, 8);
        manager
            .resume(LeaderContext { term: 2, commit_index: 2 }, &[leader].into_iter().collect(), &reader)
            .unwrap();
        let searches = manager
            .on_members_changed(&[leader, learner].into_iter().collect(), &reader)
            .unwrap();
        assert_eq!(append_request(&searches[0]).prev_log_index, 2);

        let mismatch = ShipCommand::Mismatch {
            member: learner,
            last_remote_append_index: -1,
        };
        let sent = manager.handle_commands(&[mismatch], 2, &reader).unwrap();
        assert_eq!(manager.mode_of(&learner), Some(Mode::Pipeline));
        let request = append_request(&sent[0]);
        assert_eq!((request.prev_log_index, request.prev_log_term), (-1, 0));
        assert_eq!(request.entries.len(), 3);
        assert_eq!(request.leader_commit, 2);
    }

    #[test]
    fn retransmits_after_silent_heartbeat() {
        let log = log_of(3);
        let cache = InFlightCache::new(16, 1024);
        let reader = CachingReader::new(&log, &cache);
        let (leader, follower) = (MemberId::random(), MemberId::random());
        let members: MemberSet = [leader, follower].into_iter().collect();

        let mut manager = LogShippingManager::new(leader, 8, 8);
        manager
            .resume(LeaderContext { term: 1, commit_index: -1 }, &members, &reader)
            .unwrap();
        assert!(manager.on_heartbeat(&reader).unwrap().is_empty());
        let searches = manager.on_heartbeat(&reader).unwrap();
        assert_eq!(append_request(&searches[0]).prev_log_index, 2);

        manager.pause();
        assert!(!manager.is_shipping());
        assert!(manager.on_heartbeat(&reader).unwrap().is_empty());
    }
}
