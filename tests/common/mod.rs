#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaChaRng;
use uuid::Uuid;

use coreraft::config::RaftConfig;
use coreraft::consensus::{Outbound, RaftMachine, Role, Timers};
use coreraft::content::{ReplicatedContent, ReplicatedTokenRequest};
use coreraft::error::{CommitError, SendError};
use coreraft::log::memory::InMemoryRaftLog;
use coreraft::log::RaftLog;
use coreraft::member::{MemberId, MemberSet};
use coreraft::message::{Message, NewEntryRequest, RaftMessage, Rpc};
use coreraft::replication::{CoreStateMachines, ProgressTracker};
use coreraft::storage::{InMemoryStateStorage, MembershipState, StateStorage, TermState};
use coreraft::timeout::Renewable;
use coreraft::token::{
    create_token_command, ReplicatedTokenStateMachine, TokenRegistry, TokenType, TransactionCommitProcess,
    TransactionToApply,
};
use coreraft::wire;

pub mod threaded;

pub const ELECTION_TIMEOUT_TICKS: u32 = 10;
pub const HEARTBEAT_INTERVAL_TICKS: u32 = 3;
const RANDOM_SEED: u64 = 0;
const MAX_TICKS: u32 = 100_000;

/// A cluster of [`RaftMachine`]s driven one tick at a time on the test thread.
///
/// Timers count ticks instead of time, and messages travel through a single queue, so a run is reproducible for a
/// given seed.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub tick: u32,
    pub config: TestClusterConfig,
    pub dropped_messages: usize,
    network: Arc<Mutex<VecDeque<Envelope>>>,
    random: ChaChaRng,
}

pub struct TestNode {
    pub id: MemberId,
    pub machine: RaftMachine,
    pub registries: Vec<Arc<TokenRegistry>>,
    pub store: Arc<RecordingStore>,
    election: TickTimer,
    heartbeat: TickTimer,
}

#[derive(Clone, Default)]
pub struct TestClusterConfig {
    pub drops: BTreeSet<(Option<MemberId>, Option<MemberId>)>,
    pub down: BTreeSet<MemberId>,
    pub pre_vote: bool,
}

struct Envelope {
    from: MemberId,
    to: MemberId,
    message: Message,
}

struct QueueOutbound {
    myself: MemberId,
    network: Arc<Mutex<VecDeque<Envelope>>>,
}

/// A timer counting down ticks, restarted with a random extra delay whenever it fires or is renewed.
#[derive(Clone)]
pub struct TickTimer {
    inner: Arc<Mutex<TickTimerState>>,
}

struct TickTimerState {
    delay: u32,
    randomness: u32,
    remaining: u32,
    cancelled: bool,
    random: ChaChaRng,
}

/// Records the token commands committed to it.
#[derive(Default)]
pub struct RecordingStore {
    pub committed: Mutex<Vec<TransactionToApply>>,
}

pub struct TestLogger;

pub struct TestLoggerContext {
    node_id: Option<MemberId>,
    tick: Option<u32>,
}

pub fn init_random() -> ChaChaRng {
    ChaChaRng::seed_from_u64(RANDOM_SEED)
}

/// A member id which displays as its index, for readable logs.
pub fn member(index: usize) -> MemberId {
    MemberId::from_uuid(Uuid::from_u128(((index as u128) + 1) << 96))
}

pub fn config() -> TestClusterConfig {
    TestClusterConfig::default()
}

pub fn raft_config() -> RaftConfig {
    RaftConfig::default()
        .with_catchup_batch_size(4)
        .with_log_shipping_max_lag(8)
}

pub fn token_request(token_type: TokenType, name: &str, id: u32) -> ReplicatedContent {
    ReplicatedContent::TokenRequest(ReplicatedTokenRequest::new(
        token_type,
        name,
        create_token_command(name, id),
    ))
}

pub fn new_entry(content: &ReplicatedContent) -> RaftMessage {
    RaftMessage::new(
        0,
        Rpc::NewEntryRequest(NewEntryRequest {
            content: content.marshal(),
        }),
    )
}

//
// TestCluster impls
//

impl TestCluster {
    /// Creates `size` members, all bootstrapped with each other as voting members.
    pub fn new(size: usize, random: &mut impl RngCore, config: TestClusterConfig) -> Self {
        let cluster = Self::unbootstrapped(size, random, config);
        let members = cluster.member_set();
        for node in &cluster.nodes {
            node.machine.bootstrap(members.clone()).expect("bootstrap");
        }
        cluster
    }

    /// Creates `size` members with empty logs.
    pub fn unbootstrapped(size: usize, random: &mut impl RngCore, config: TestClusterConfig) -> Self {
        TestLogger::init();
        let network = Arc::new(Mutex::new(VecDeque::new()));
        let nodes = (0..size)
            .map(|index| TestNode::new(member(index), &network, random, config.pre_vote))
            .collect();
        Self {
            nodes,
            tick: 0,
            config,
            dropped_messages: 0,
            network,
            random: ChaChaRng::seed_from_u64(random.next_u64()),
        }
    }

    /// Adds a member with an empty log which is not yet part of the cluster.
    pub fn add_node(&mut self) -> MemberId {
        let id = member(self.nodes.len());
        let node = TestNode::new(id, &self.network, &mut self.random, self.config.pre_vote);
        self.nodes.push(node);
        id
    }

    pub fn member_set(&self) -> MemberSet {
        self.nodes.iter().map(|node| node.id).collect()
    }

    pub fn node(&self, id: MemberId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .expect("no such node")
    }

    pub fn run_until(&mut self, mut until_fun: impl FnMut(&Self) -> bool) -> &mut Self {
        let mut ticks_remaining = MAX_TICKS;
        while !until_fun(self) {
            ticks_remaining = ticks_remaining
                .checked_sub(1)
                .expect("condition failed after maximum simulation length");
            self.step();
        }
        self
    }

    pub fn run_for(&mut self, ticks: u32) -> &mut Self {
        for _ in 0..ticks {
            self.step();
        }
        self
    }

    /// Delivers `message` to the member at `node_idx` as if sent by `from`, then delivers every resulting message.
    pub fn run_on_node(&mut self, node_idx: usize, from: MemberId, message: RaftMessage) -> &mut Self {
        let node = &self.nodes[node_idx];
        TestLogger::set_node_id(Some(node.id));
        node.machine.handle(from, message).expect("handle");
        self.deliver();
        self
    }

    /// Proposes `content` on the current leader, as a replicator would.
    pub fn propose(&mut self, content: &ReplicatedContent) -> &mut Self {
        let leader = self.leader_index().expect("no leader");
        let id = self.nodes[leader].id;
        self.run_on_node(leader, id, new_entry(content))
    }

    pub fn inspect(&mut self, fun: impl FnOnce(&Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn modify(&mut self, fun: impl FnOnce(&mut Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn leader_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| !self.config.is_node_down(node.id) && node.machine.role() == Role::Leader)
    }

    pub fn leader(&self) -> Option<&TestNode> {
        self.leader_index().map(|index| &self.nodes[index])
    }

    pub fn has_leader(&self) -> bool {
        self.leader_index().is_some()
    }

    /// Returns whether every running member applied every entry up to `index`.
    pub fn all_applied(&self, index: i64) -> bool {
        self.nodes
            .iter()
            .filter(|node| !self.config.is_node_down(node.id))
            .all(|node| node.machine.last_applied() >= index)
    }

    fn step(&mut self) {
        self.tick += 1;
        TestLogger::set_tick(Some(self.tick));
        for node in &self.nodes {
            if self.config.is_node_down(node.id) {
                continue;
            }
            TestLogger::set_node_id(Some(node.id));
            if node.election.tick() {
                node.machine
                    .handle(node.id, RaftMessage::ElectionTimeout)
                    .expect("election timeout");
            }
            if node.heartbeat.tick() {
                node.machine
                    .handle(node.id, RaftMessage::HeartbeatTimeout)
                    .expect("heartbeat timeout");
            }
        }
        self.deliver();
        TestLogger::set_tick(None);
        TestLogger::set_node_id(None);
    }

    fn deliver(&mut self) {
        loop {
            let envelope = self.network.lock().pop_front();
            let Envelope { from, to, message } = match envelope {
                Some(envelope) => envelope,
                None => break,
            };
            let node = match self.nodes.iter().find(|node| node.id == to) {
                Some(node) => node,
                None => continue,
            };
            TestLogger::set_node_id(Some(to));
            if self.config.should_drop(from, to) {
                log::info!("<- {} DROPPED {}", from, message);
                self.dropped_messages += 1;
                continue;
            }
            log::info!("<- {} {}", from, message);
            node.machine
                .handle(from, RaftMessage::Message(message))
                .expect("handle");
        }
    }
}

//
// TestNode impls
//

impl TestNode {
    fn new(id: MemberId, network: &Arc<Mutex<VecDeque<Envelope>>>, random: &mut impl RngCore, pre_vote: bool) -> Self {
        let log: Box<dyn RaftLog> = Box::new(InMemoryRaftLog::new());
        let term_storage: Box<dyn StateStorage<TermState>> = Box::new(InMemoryStateStorage::<TermState>::new());
        let membership_storage: Box<dyn StateStorage<MembershipState>> =
            Box::new(InMemoryStateStorage::<MembershipState>::new());
        let store = Arc::new(RecordingStore::default());

        let registries: Vec<_> = TokenType::ALL
            .iter()
            .map(|token_type| Arc::new(TokenRegistry::new(*token_type)))
            .collect();
        let mut state_machines = CoreStateMachines::new(Uuid::new_v4(), Arc::new(ProgressTracker::new()));
        for registry in &registries {
            let state_machine = ReplicatedTokenStateMachine::new(Arc::clone(registry));
            state_machine.install_commit_process(Arc::clone(&store) as Arc<dyn TransactionCommitProcess>, -1);
            state_machines = state_machines.with_token_state_machine(Arc::new(state_machine));
        }

        let outbound = Arc::new(QueueOutbound {
            myself: id,
            network: Arc::clone(network),
        });
        let machine = RaftMachine::new(
            id,
            log,
            term_storage,
            membership_storage,
            state_machines,
            outbound,
            &raft_config().with_pre_vote(pre_vote),
        )
        .expect("machine");

        let election = TickTimer::new(ELECTION_TIMEOUT_TICKS, ELECTION_TIMEOUT_TICKS, random);
        let heartbeat = TickTimer::new(HEARTBEAT_INTERVAL_TICKS, 0, random);
        machine.install_timers(Timers {
            election: Box::new(election.clone()),
            heartbeat: Box::new(heartbeat.clone()),
        });

        Self {
            id,
            machine,
            registries,
            store,
            election,
            heartbeat,
        }
    }

    pub fn registry(&self, token_type: TokenType) -> &Arc<TokenRegistry> {
        self.registries
            .iter()
            .find(|registry| registry.token_type() == token_type)
            .expect("registry")
    }

    pub fn log_terms(&self) -> Vec<u64> {
        let append_index = self.machine.append_index();
        self.machine
            .read_log(0, (append_index + 1) as usize)
            .expect("read log")
            .iter()
            .map(|entry| entry.term)
            .collect()
    }
}

//
// QueueOutbound impls
//

impl Outbound for QueueOutbound {
    fn send(&self, to: MemberId, message: Message) -> Result<(), SendError> {
        let mut frame = BytesMut::new();
        wire::encode_message(self.myself, &message, &mut frame)?;
        let (from, message) = wire::decode_frame(frame.freeze())?;
        self.network.lock().push_back(Envelope { from, to, message });
        Ok(())
    }
}

//
// TickTimer impls
//

impl TickTimer {
    fn new(delay: u32, randomness: u32, random: &mut impl RngCore) -> Self {
        let mut state = TickTimerState {
            delay,
            randomness,
            remaining: 0,
            cancelled: false,
            random: ChaChaRng::seed_from_u64(random.next_u64()),
        };
        state.restart();
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Advances the timer by one tick, returning whether it fired.
    pub fn tick(&self) -> bool {
        let mut state = self.inner.lock();
        if state.cancelled {
            return false;
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            state.restart();
            return true;
        }
        false
    }
}

impl Renewable for TickTimer {
    fn renew(&self) {
        self.inner.lock().restart();
    }

    fn cancel(&self) {
        self.inner.lock().cancelled = true;
    }
}

impl TickTimerState {
    fn restart(&mut self) {
        let extra = if self.randomness == 0 {
            0
        } else {
            self.random.gen_range(0..self.randomness)
        };
        self.remaining = self.delay + extra;
    }
}

//
// RecordingStore impls
//

impl TransactionCommitProcess for RecordingStore {
    fn commit(&self, transaction: TransactionToApply) -> Result<(), CommitError> {
        self.committed.lock().push(transaction);
        Ok(())
    }
}

//
// TestClusterConfig impls
//

impl TestClusterConfig {
    pub fn pre_vote(mut self) -> Self {
        self.pre_vote = true;
        self
    }

    pub fn node_down(mut self, index: usize) -> Self {
        self.down.insert(member(index));
        self
    }

    pub fn isolate(mut self, index: usize) -> Self {
        self.drops.insert((Some(member(index)), None));
        self.drops.insert((None, Some(member(index))));
        self
    }

    pub fn drop_between(mut self, from: usize, to: usize) -> Self {
        self.drops.insert((Some(member(from)), Some(member(to))));
        self.drops.insert((Some(member(to)), Some(member(from))));
        self
    }

    pub fn drop_to(mut self, index: usize) -> Self {
        self.drops.insert((None, Some(member(index))));
        self
    }

    pub fn is_node_down(&self, id: MemberId) -> bool {
        self.down.contains(&id)
    }

    pub fn should_drop(&self, from: MemberId, to: MemberId) -> bool {
        self.drops.contains(&(Some(from), Some(to)))
            || self.drops.contains(&(Some(from), None))
            || self.drops.contains(&(None, Some(to)))
            || self.down.contains(&from)
            || self.down.contains(&to)
    }
}

//
// TestLogger impls
//

thread_local! {
    static LOGGER_CONTEXT: RefCell<TestLoggerContext> = RefCell::new(TestLoggerContext::new());
}

impl TestLogger {
    pub fn init() {
        let _ignore = log::set_logger(&Self);
        log::set_max_level(log::LevelFilter::Debug);
    }

    pub fn set_node_id(node_id: Option<MemberId>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().node_id = node_id;
        });
    }

    pub fn set_tick(tick: Option<u32>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().tick = tick;
        });
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGGER_CONTEXT.with(|context| {
            let context = context.borrow();
            match (context.node_id, context.tick) {
                (Some(node_id), Some(tick)) => eprintln!("tick {:03} {} {}", tick, node_id, record.args()),
                (Some(node_id), None) => eprintln!("tick ??? {} {}", node_id, record.args()),
                _ => eprintln!("{}", record.args()),
            }
        })
    }

    fn flush(&self) {}
}

impl TestLoggerContext {
    const fn new() -> Self {
        Self {
            node_id: None,
            tick: None,
        }
    }
}
