//! Runs an in-process cluster and creates the tokens named on stdin.
//!
//! Each line is a token type followed by a name, e.g. `label Person`. Lines are handed to the members in turn, and
//! the id the cluster agreed on is printed.

use std::error::Error;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use coreraft::error::CommitError;
use coreraft::{
    ChannelNetwork, CoreMetaData, CoreNode, MemberId, MemberSet, NodeStorage, RaftConfig, TokenType,
    TransactionCommitProcess, TransactionToApply,
};

const CLUSTER_SIZE: usize = 3;

struct LoggingStore {
    member: MemberId,
}

impl TransactionCommitProcess for LoggingStore {
    fn commit(&self, transaction: TransactionToApply) -> Result<(), CommitError> {
        log::info!(
            "{} committed {} byte command at {}",
            self.member,
            transaction.command.len(),
            transaction.log_index
        );
        Ok(())
    }
}

fn parse_token_type(name: &str) -> Option<TokenType> {
    match name {
        "property" => Some(TokenType::Property),
        "label" => Some(TokenType::Label),
        "relationship" | "type" => Some(TokenType::RelationshipType),
        _ => None,
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = RaftConfig::default().with_election_timeout(Duration::from_millis(150));
    let network = ChannelNetwork::new();
    let mut nodes = Vec::with_capacity(CLUSTER_SIZE);
    for _ in 0..CLUSTER_SIZE {
        let member = MemberId::random();
        let node = CoreNode::start(
            member,
            NodeStorage::in_memory(),
            Arc::new(network.transport(member)),
            Arc::new(LoggingStore { member }),
            -1,
            &config,
        )?;
        network.register(member, node.inbox());
        nodes.push(node);
    }
    let members: MemberSet = nodes.iter().map(CoreNode::myself).collect();
    for node in &nodes {
        node.bootstrap(members.clone())?;
    }
    let leader = nodes[0].machine().get_leader(config.leader_lookup_timeout)?;
    log::info!("{} leads the cluster", leader);

    let stdin = std::io::stdin();
    for (line_number, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let mut words = line.split_whitespace();
        let (token_type, name) = match (words.next().and_then(parse_token_type), words.next()) {
            (Some(token_type), Some(name)) => (token_type, name),
            _ => {
                eprintln!("expected `<property|label|type> <name>`, got `{}`", line);
                continue;
            }
        };
        let node = &nodes[line_number % nodes.len()];
        match node.token_holder(token_type).get_or_create_id(name) {
            Ok(id) => println!("{} {} = {}", token_type, name, id),
            Err(error) => eprintln!("{} failed to create {}: {}", node.myself(), name, error),
        }
    }

    for node in &mut nodes {
        node.shutdown();
    }
    Ok(())
}
