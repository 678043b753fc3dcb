use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;

use crate::broadcast::Broadcast;
use crate::config::RaftConfig;
use crate::content::ReplicatedContent;
use crate::error::{BootstrapError, LogError, NoLeaderFoundError, RaftError};
use crate::log::cache::InFlightCache;
use crate::log::{LogEntry, RaftLog};
use crate::member::{MemberId, MemberSet};
use crate::message::{InboundMessage, NewEntryRequest, RaftMessage, Rpc, SendableMessage};
use crate::replication::CoreStateMachines;
use crate::storage::{MembershipState, StateStorage, TermState};
use crate::timeout::Renewable;
use crate::{Index, Term};

use super::membership::RaftMembershipManager;
use super::shipping::{LeaderContext, LogShippingManager, Mode};
use super::{CoreMetaData, LeaderCell, Outbound, Outcome, RaftState, Role};

/// A leader change observed by a member.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeaderInfo {
    /// The new leader, or `None` if the member knows of no leader.
    pub member: Option<MemberId>,
    pub term: Term,
}

/// The timers driving a machine: the election timer is renewed whenever an outcome asks for it.
pub struct Timers {
    pub election: Box<dyn Renewable>,
    pub heartbeat: Box<dyn Renewable>,
}

/// The consensus machine of one member.
///
/// Messages are handled one at a time under a lock. Handling a message may produce follow-up messages to this member
/// itself, such as a membership change promoting a learner, which are handled before [`handle`](Self::handle)
/// returns.
pub struct RaftMachine {
    myself: MemberId,
    inner: Mutex<Inner>,
    leader: Arc<LeaderCell>,
    leader_changes: Broadcast<LeaderInfo>,
    outbound: Arc<dyn Outbound>,
}

struct Inner {
    role: Role,
    state: RaftState,
    membership: RaftMembershipManager,
    shipping: LogShippingManager,
    state_machines: CoreStateMachines,
    timers: Option<Timers>,
}

impl RaftMachine {
    /// Creates the machine of `myself` over an existing, possibly empty, log, and applies the entries it already
    /// committed.
    pub fn new(
        myself: MemberId,
        log: Box<dyn RaftLog>,
        term_storage: Box<dyn StateStorage<TermState>>,
        membership_storage: Box<dyn StateStorage<MembershipState>>,
        mut state_machines: CoreStateMachines,
        outbound: Arc<dyn Outbound>,
        config: &RaftConfig,
    ) -> Result<Self, RaftError> {
        let cache = Arc::new(InFlightCache::new(
            config.in_flight_cache_max_entries,
            config.in_flight_cache_max_bytes,
        ));
        let mut state = RaftState::new(myself, log, cache, term_storage);
        state.set_pre_vote(config.pre_vote);
        let mut membership = RaftMembershipManager::new(myself, membership_storage, config.log_shipping_max_lag);
        membership.recover(&state.reader(), state.commit_index())?;
        state.set_members(membership.voting_members(), membership.replication_members());
        state_machines.apply_committed(&state.reader(), state.commit_index())?;
        info!("started {} at term {}", myself, state.term());

        Ok(Self {
            myself,
            inner: Mutex::new(Inner {
                role: Role::Follower,
                state,
                membership,
                shipping: LogShippingManager::new(myself, config.catchup_batch_size, config.log_shipping_max_lag),
                state_machines,
                timers: None,
            }),
            leader: Arc::new(LeaderCell::new()),
            leader_changes: Broadcast::new(),
            outbound,
        })
    }

    pub fn myself(&self) -> MemberId {
        self.myself
    }

    /// The cell other threads can wait on for a leader.
    pub fn leader_cell(&self) -> Arc<LeaderCell> {
        Arc::clone(&self.leader)
    }

    pub fn install_timers(&self, timers: Timers) {
        self.inner.lock().timers = Some(timers);
    }

    /// Cancels the installed timers, if any.
    pub fn stop_timers(&self) {
        if let Some(timers) = self.inner.lock().timers.take() {
            timers.election.cancel();
            timers.heartbeat.cancel();
        }
    }

    /// Writes the initial membership entry of a new cluster, committed at index 0. Does nothing if the log already
    /// has entries.
    ///
    /// # Errors
    ///
    /// Bootstrapping with no members, or with members different from an earlier bootstrap of this member, is refused.
    pub fn bootstrap(&self, members: MemberSet) -> Result<(), BootstrapError> {
        let mut inner = self.inner.lock();
        let Inner { state, membership, .. } = &mut *inner;
        if state.append_index() >= 0 {
            warn!(
                "ignoring bootstrap of {}, log has entries up to {}",
                self.myself,
                state.append_index()
            );
            return Ok(());
        }
        membership.check_bootstrap(&members)?;
        let entry = LogEntry::new(0, ReplicatedContent::Membership(members.clone()).marshal());
        state.bootstrap(entry)?;
        membership.record_bootstrap(members)?;
        state.set_members(membership.voting_members(), membership.replication_members());
        info!("bootstrapped {} with {} members", self.myself, state.voting_members().len());
        Ok(())
    }

    /// Starts replicating the log to `member` as a learner, to be promoted to voting member once caught up. Only
    /// effective on the leader.
    pub fn add_member(&self, member: MemberId) -> Result<bool, RaftError> {
        let mut inner = self.inner.lock();
        if inner.role != Role::Leader {
            warn!("cannot add {}, {} is not the leader", member, self.myself);
            return Ok(false);
        }
        let Inner {
            state,
            membership,
            shipping,
            ..
        } = &mut *inner;
        if !membership.add_member(member) {
            return Ok(false);
        }
        state.set_members(membership.voting_members(), membership.replication_members());
        let messages = shipping.on_members_changed(state.replication_members(), &state.reader())?;
        self.send_all(messages);
        Ok(true)
    }

    /// Handles `message` from `from`, and any follow-up messages to this member it causes.
    ///
    /// # Errors
    ///
    /// An error is fatal: the log, the stored state or the state machines can no longer be trusted, and this member
    /// must stop handling messages.
    pub fn handle(&self, from: MemberId, message: RaftMessage) -> Result<(), RaftError> {
        let mut inner = self.inner.lock();
        let mut queue = VecDeque::new();
        queue.push_back((from, message));
        while let Some((from, message)) = queue.pop_front() {
            queue.extend(self.step(&mut inner, from, &message)?);
        }
        Ok(())
    }

    fn step(
        &self,
        inner: &mut Inner,
        from: MemberId,
        message: &RaftMessage,
    ) -> Result<Vec<InboundMessage>, RaftError> {
        let Inner {
            role,
            state,
            membership,
            shipping,
            state_machines,
            timers,
        } = inner;

        verbose!("{} handling {} from {}", role, message, from);
        let outcome = role.handle(from, message, state)?;
        let previous_role = *role;
        let previous_leader = state.leader();

        state.update(&outcome)?;
        if !outcome.log_commands.is_empty() {
            state.sync()?;
        }
        if outcome.renew_election_timeout {
            if let Some(timers) = timers {
                timers.election.renew();
            }
        }
        let Outcome {
            next_role,
            outgoing,
            log_commands,
            ship_commands,
            ..
        } = outcome;
        *role = next_role;

        membership.process_log_commands(&log_commands);
        if *role != previous_role {
            membership.on_role(*role);
        }
        membership.process_committed(state.commit_index())?;
        let voting_members = membership.voting_members();
        let replication_members = membership.replication_members();
        let members_changed =
            voting_members != *state.voting_members() || replication_members != *state.replication_members();
        if members_changed {
            info!("{} now has {} voting members", self.myself, voting_members.len());
            state.set_members(voting_members, replication_members);
        }

        let mut local = Vec::new();
        let mut messages = Vec::new();
        for message in outgoing {
            if message.dest == self.myself {
                local.push((self.myself, RaftMessage::Message(message.message)));
            } else {
                messages.push(message);
            }
        }

        if *role == Role::Leader {
            let reader = state.reader();
            if previous_role != Role::Leader {
                let context = LeaderContext {
                    term: state.term(),
                    commit_index: state.commit_index(),
                };
                messages.extend(shipping.resume(context, state.replication_members(), &reader)?);
            } else if members_changed {
                messages.extend(shipping.on_members_changed(state.replication_members(), &reader)?);
            }
            messages.extend(shipping.handle_commands(&ship_commands, state.commit_index(), &reader)?);
            if *message == RaftMessage::HeartbeatTimeout {
                messages.extend(shipping.on_heartbeat(&reader)?);
            }
        } else if previous_role == Role::Leader {
            shipping.pause();
        }
        self.send_all(messages);

        let applied = state_machines.apply_committed(&state.reader(), state.commit_index())?;
        if applied > 0 {
            state.cache().prune(state_machines.last_applied());
        }

        let leader = state.leader();
        if leader != previous_leader {
            match leader {
                Some(leader) => info!("{} sees leader {} at term {}", self.myself, leader, state.term()),
                None => info!("{} sees no leader at term {}", self.myself, state.term()),
            }
            self.leader.set(leader);
            self.leader_changes.publish(LeaderInfo {
                member: leader,
                term: state.term(),
            });
        }

        if *role == Role::Leader {
            if let Some(members) = membership.promotion(state.append_index(), state.follower_states()) {
                let content = ReplicatedContent::Membership(members).marshal();
                local.push((
                    self.myself,
                    RaftMessage::new(0, Rpc::NewEntryRequest(NewEntryRequest { content })),
                ));
            }
        }
        Ok(local)
    }

    fn send_all(&self, messages: Vec<SendableMessage>) {
        for SendableMessage { message, dest } in messages {
            if let Err(error) = self.outbound.send(dest, message) {
                warn!("failed to send to {}: {}", dest, error);
            }
        }
    }

    pub fn subscribe_leader_changes(&self) -> Receiver<LeaderInfo> {
        self.leader_changes.subscribe()
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn term(&self) -> Term {
        self.inner.lock().state.term()
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.leader.get()
    }

    pub fn commit_index(&self) -> Index {
        self.inner.lock().state.commit_index()
    }

    pub fn append_index(&self) -> Index {
        self.inner.lock().state.append_index()
    }

    pub fn voting_members(&self) -> MemberSet {
        self.inner.lock().state.voting_members().clone()
    }

    pub fn replication_members(&self) -> MemberSet {
        self.inner.lock().state.replication_members().clone()
    }

    pub fn last_applied(&self) -> Index {
        self.inner.lock().state_machines.last_applied()
    }

    pub fn shipping_mode(&self, member: &MemberId) -> Option<Mode> {
        self.inner.lock().shipping.mode_of(member)
    }

    /// Reads up to `max_entries` entries of the log starting at `from`.
    pub fn read_log(&self, from: Index, max_entries: usize) -> Result<Vec<LogEntry>, LogError> {
        self.inner.lock().state.reader().read(from, max_entries)
    }
}

impl CoreMetaData for RaftMachine {
    fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    fn get_leader(&self, timeout: Duration) -> Result<MemberId, NoLeaderFoundError> {
        self.leader.await_leader(timeout)
    }
}

impl fmt::Display for RaftMachine {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        fmt.debug_struct("RaftMachine")
            .field("role", &format_args!("{}", inner.role))
            .field("state", &format_args!("{}", inner.state))
            .finish()
    }
}
