//! Running a member: the message processing thread and the assembly of a complete node.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{error, info, warn};
use uuid::Uuid;

use crate::config::RaftConfig;
use crate::consensus::{Outbound, RaftMachine, Timers};
use crate::error::{BootstrapError, RaftError};
use crate::log::memory::InMemoryRaftLog;
use crate::log::segmented::SegmentedRaftLog;
use crate::log::RaftLog;
use crate::member::{MemberId, MemberSet};
use crate::message::{InboundMessage, RaftMessage};
use crate::replication::{CoreStateMachines, ProgressTracker, RaftReplicator};
use crate::storage::{DurableStateStorage, InMemoryStateStorage, MembershipState, StateStorage, TermState};
use crate::timeout::TimeoutService;
use crate::token::{
    create_token_command, ReplicatedTokenHolder, ReplicatedTokenStateMachine, TokenRegistry, TokenType,
    TransactionCommitProcess,
};
use crate::Index;

const LOG_DIRECTORY: &str = "raft-log";
const TERM_STATE_FILE: &str = "term-state";
const MEMBERSHIP_STATE_FILE: &str = "membership-state";

/// Feeds the inbox of a member to its [`RaftMachine`] on a dedicated thread.
///
/// A machine error stops the thread and marks the server unhealthy; the member then takes no further part in the
/// cluster.
pub struct RaftServer {
    shutdown: Sender<()>,
    healthy: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// The durable state a member needs to take part in a cluster.
pub struct NodeStorage {
    pub log: Box<dyn RaftLog>,
    pub term_state: Box<dyn StateStorage<TermState>>,
    pub membership_state: Box<dyn StateStorage<MembershipState>>,
}

/// A complete member: consensus machine, processing thread, timers, replicator and token holders.
pub struct CoreNode {
    myself: MemberId,
    machine: Arc<RaftMachine>,
    server: RaftServer,
    timeouts: TimeoutService,
    inbox: Sender<InboundMessage>,
    tracker: Arc<ProgressTracker>,
    replicator: Arc<RaftReplicator>,
    holders: TokenHolders,
    running: bool,
}

struct TokenHolders {
    property: ReplicatedTokenHolder<RaftReplicator>,
    label: ReplicatedTokenHolder<RaftReplicator>,
    relationship_type: ReplicatedTokenHolder<RaftReplicator>,
}

//
// RaftServer impls
//

impl RaftServer {
    pub fn start(machine: Arc<RaftMachine>, inbox: Receiver<InboundMessage>) -> Result<Self, RaftError> {
        let (shutdown, shutdown_rx) = unbounded();
        let healthy = Arc::new(AtomicBool::new(true));
        let thread_healthy = Arc::clone(&healthy);
        let thread = thread::Builder::new()
            .name(format!("raft-server-{}", machine.myself()))
            .spawn(move || run(&machine, &inbox, &shutdown_rx, &thread_healthy))
            .map_err(RaftError::Spawn)?;
        Ok(Self {
            shutdown,
            healthy,
            thread: Some(thread),
        })
    }

    /// Returns `false` once the machine failed.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Stops processing messages and waits for the processing thread to exit.
    pub fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("raft server thread panicked");
            }
        }
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(machine: &RaftMachine, inbox: &Receiver<InboundMessage>, shutdown: &Receiver<()>, healthy: &AtomicBool) {
    info!("{} processing messages", machine.myself());
    loop {
        select! {
            recv(inbox) -> message => {
                let (from, message) = match message {
                    Ok(message) => message,
                    Err(_) => break,
                };
                if let Err(error) = machine.handle(from, message) {
                    error!("{} stopped after a fatal error: {}", machine.myself(), error);
                    healthy.store(false, Ordering::Release);
                    machine.leader_cell().interrupt();
                    break;
                }
            }
            recv(shutdown) -> _ => break,
        }
    }
    info!("{} stopped processing messages", machine.myself());
}

//
// NodeStorage impls
//

impl NodeStorage {
    pub fn in_memory() -> Self {
        Self {
            log: Box::new(InMemoryRaftLog::new()),
            term_state: Box::new(InMemoryStateStorage::<TermState>::new()),
            membership_state: Box::new(InMemoryStateStorage::<MembershipState>::new()),
        }
    }

    /// Opens, or creates, the log and state files of a member under `directory`.
    pub fn open(directory: impl AsRef<Path>, config: &RaftConfig) -> Result<Self, RaftError> {
        let directory = directory.as_ref();
        Ok(Self {
            log: Box::new(SegmentedRaftLog::open(
                directory.join(LOG_DIRECTORY),
                config.log_rotation_size,
            )?),
            term_state: Box::new(DurableStateStorage::<TermState>::open(directory.join(TERM_STATE_FILE))?),
            membership_state: Box::new(DurableStateStorage::<MembershipState>::open(
                directory.join(MEMBERSHIP_STATE_FILE),
            )?),
        })
    }
}

//
// CoreNode impls
//

impl CoreNode {
    /// Starts a member whose token commands are committed through `commit_process`. `last_committed_index` is the log
    /// index of the last token command the store already holds; earlier entries are not applied to it again.
    ///
    /// The member stays a follower until it learns of a leader, or until it is bootstrapped.
    pub fn start(
        myself: MemberId,
        storage: NodeStorage,
        outbound: Arc<dyn Outbound>,
        commit_process: Arc<dyn TransactionCommitProcess>,
        last_committed_index: Index,
        config: &RaftConfig,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let (inbox, inbox_rx) = unbounded();
        let tracker = Arc::new(ProgressTracker::new());
        let session = Uuid::new_v4();

        let registries = TokenType::ALL.map(|token_type| Arc::new(TokenRegistry::new(token_type)));
        let mut state_machines = CoreStateMachines::new(session, Arc::clone(&tracker));
        for registry in &registries {
            let state_machine = ReplicatedTokenStateMachine::new(Arc::clone(registry));
            state_machine.install_commit_process(Arc::clone(&commit_process), last_committed_index);
            state_machines = state_machines.with_token_state_machine(Arc::new(state_machine));
        }

        let machine = Arc::new(RaftMachine::new(
            myself,
            storage.log,
            storage.term_state,
            storage.membership_state,
            state_machines,
            Arc::clone(&outbound),
            config,
        )?);

        let timeouts = TimeoutService::start();
        let election_inbox = inbox.clone();
        let election = timeouts.create(
            "election",
            config.election_timeout,
            config.election_timeout,
            move || {
                let _ = election_inbox.send((myself, RaftMessage::ElectionTimeout));
            },
        );
        let heartbeat_inbox = inbox.clone();
        let heartbeat = timeouts.create(
            "heartbeat",
            config.heartbeat_interval(),
            Duration::ZERO,
            move || {
                let _ = heartbeat_inbox.send((myself, RaftMessage::HeartbeatTimeout));
            },
        );
        machine.install_timers(Timers {
            election: Box::new(election),
            heartbeat: Box::new(heartbeat),
        });

        let replicator = Arc::new(RaftReplicator::new(
            myself,
            session,
            machine.leader_cell(),
            inbox.clone(),
            outbound,
            Arc::clone(&tracker),
            config,
        ));
        let [property, label, relationship_type] =
            registries.map(|registry| token_holder(registry, Arc::clone(&replicator)));
        let server = RaftServer::start(Arc::clone(&machine), inbox_rx)?;

        Ok(Self {
            myself,
            machine,
            server,
            timeouts,
            inbox,
            tracker,
            replicator,
            holders: TokenHolders {
                property,
                label,
                relationship_type,
            },
            running: true,
        })
    }

    pub fn myself(&self) -> MemberId {
        self.myself
    }

    pub fn machine(&self) -> &Arc<RaftMachine> {
        &self.machine
    }

    /// The inbox other members deliver messages for this member to.
    pub fn inbox(&self) -> Sender<InboundMessage> {
        self.inbox.clone()
    }

    pub fn replicator(&self) -> &Arc<RaftReplicator> {
        &self.replicator
    }

    pub fn token_holder(&self, token_type: TokenType) -> &ReplicatedTokenHolder<RaftReplicator> {
        match token_type {
            TokenType::Property => &self.holders.property,
            TokenType::Label => &self.holders.label,
            TokenType::RelationshipType => &self.holders.relationship_type,
        }
    }

    pub fn bootstrap(&self, members: MemberSet) -> Result<(), BootstrapError> {
        self.machine.bootstrap(members)
    }

    /// Adds `member` to the cluster as a learner. Only the leader accepts new members.
    pub fn add_member(&self, member: MemberId) -> Result<bool, RaftError> {
        self.machine.add_member(member)
    }

    pub fn is_healthy(&self) -> bool {
        self.server.is_healthy()
    }

    /// Stops the timers and the processing thread, and fails every pending replication.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.machine.stop_timers();
        self.timeouts.shutdown();
        self.machine.leader_cell().interrupt();
        self.tracker.abandon_all();
        self.server.stop();
        info!("{} shut down", self.myself);
    }
}

impl Drop for CoreNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn token_holder(
    registry: Arc<TokenRegistry>,
    replicator: Arc<RaftReplicator>,
) -> ReplicatedTokenHolder<RaftReplicator> {
    let id_generator = Arc::clone(&registry);
    ReplicatedTokenHolder::new(registry, replicator, id_generator, Box::new(create_token_command))
}
