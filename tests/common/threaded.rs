//! Helpers for members running on their own threads, connected by channels.

use std::sync::Arc;
use std::time::Duration;

use coreraft::config::RaftConfig;
use coreraft::member::MemberId;
use coreraft::token::TransactionCommitProcess;
use coreraft::transport::ChannelNetwork;
use coreraft::{CoreNode, Index, NodeStorage};

use super::RecordingStore;

pub fn threaded_config() -> RaftConfig {
    RaftConfig::default()
        .with_election_timeout(Duration::from_millis(60))
        .with_leader_lookup_timeout(Duration::from_secs(5))
        .with_replication_retry_timeout(Duration::from_secs(1))
}

/// Starts `myself` and makes it reachable on `network`.
pub fn start_node(
    network: &ChannelNetwork,
    myself: MemberId,
    storage: NodeStorage,
    store: &Arc<RecordingStore>,
    last_committed_index: Index,
) -> CoreNode {
    let node = CoreNode::start(
        myself,
        storage,
        Arc::new(network.transport(myself)),
        Arc::clone(store) as Arc<dyn TransactionCommitProcess>,
        last_committed_index,
        &threaded_config(),
    )
    .expect("start node");
    network.register(myself, node.inbox());
    node
}
