mod common;

use common::*;
use itertools::Itertools;

use coreraft::consensus::Role;
use coreraft::token::{Token, TokenType};

fn settled(cluster: &TestCluster) -> bool {
    let leader = match cluster.leader() {
        Some(leader) => leader,
        None => return false,
    };
    let append_index = leader.machine.append_index();
    leader.machine.commit_index() == append_index && cluster.all_applied(append_index)
}

#[test]
fn commits_on_every_member() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster
        .run_until(TestCluster::has_leader)
        .propose(&token_request(TokenType::Label, "Person", 5))
        .propose(&token_request(TokenType::Label, "City", 5))
        .run_until(settled)
        .inspect(|cluster| {
            for node in &cluster.nodes {
                let registry = node.registry(TokenType::Label);
                assert_eq!(registry.get_id("Person"), Some(5));
                assert_eq!(registry.get_id("City"), Some(6));
                assert_eq!(node.store.committed.lock().len(), 2);
                assert!(node.registry(TokenType::Property).is_empty());
            }
        });
}

#[test]
fn duplicate_names_resolve_to_the_first_committed_id() {
    let mut random = init_random();
    TestCluster::new(3, &mut random, config())
        .run_until(TestCluster::has_leader)
        .propose(&token_request(TokenType::RelationshipType, "KNOWS", 3))
        .propose(&token_request(TokenType::RelationshipType, "KNOWS", 9))
        .run_until(settled)
        .inspect(|cluster| {
            for node in &cluster.nodes {
                let registry = node.registry(TokenType::RelationshipType);
                assert_eq!(registry.all_tokens(), vec![Token::new("KNOWS", 3)]);
                assert_eq!(node.store.committed.lock().len(), 1);
            }
        });
}

#[test]
fn follower_forwards_new_entries_to_leader() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_for(10);
    let follower = (cluster.leader_index().unwrap() + 1) % 3;
    let follower_id = cluster.nodes[follower].id;

    cluster
        .run_on_node(
            follower,
            follower_id,
            new_entry(&token_request(TokenType::Property, "name", 0)),
        )
        .run_until(settled)
        .inspect(|cluster| {
            for node in &cluster.nodes {
                assert_eq!(node.registry(TokenType::Property).get_id("name"), Some(0));
            }
        });
}

#[test]
fn commit_survives_minority_failure() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(5, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_for(10);
    let leader = cluster.leader_index().unwrap();
    cluster.config = config().node_down((leader + 1) % 5).node_down((leader + 2) % 5);

    cluster
        .propose(&token_request(TokenType::Label, "Person", 0))
        .run_until(settled)
        .inspect(|cluster| {
            assert_eq!(cluster.leader_index(), Some(leader));
            assert_eq!(
                cluster.nodes[leader].registry(TokenType::Label).get_id("Person"),
                Some(0)
            );
        });
}

#[test]
fn uncommitted_entries_of_a_deposed_leader_are_replaced() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_for(10);
    let old_leader = cluster.leader_index().unwrap();
    let old_leader_id = cluster.nodes[old_leader].id;
    let old_commit = cluster.nodes[old_leader].machine.commit_index();

    cluster.config = config().isolate(old_leader);
    cluster.run_on_node(
        old_leader,
        old_leader_id,
        new_entry(&token_request(TokenType::Label, "Lost", 0)),
    );
    assert_eq!(cluster.nodes[old_leader].machine.commit_index(), old_commit);

    cluster
        .run_until(|cluster| {
            cluster
                .nodes
                .iter()
                .enumerate()
                .any(|(index, node)| index != old_leader && node.machine.role() == Role::Leader)
        })
        .run_until(|cluster| cluster.nodes[old_leader].machine.role() != Role::Leader);

    let new_leader = cluster
        .nodes
        .iter()
        .position(|node| node.machine.role() == Role::Leader)
        .unwrap();
    let new_leader_id = cluster.nodes[new_leader].id;
    cluster.run_on_node(
        new_leader,
        new_leader_id,
        new_entry(&token_request(TokenType::Label, "Kept", 0)),
    );

    cluster.config = config();
    cluster
        .run_until(|cluster| {
            settled(cluster) && cluster.nodes.iter().map(TestNode::log_terms).all_equal()
        })
        .inspect(|cluster| {
            for node in &cluster.nodes {
                let registry = node.registry(TokenType::Label);
                assert_eq!(registry.get_id("Lost"), None);
                assert_eq!(registry.get_id("Kept"), Some(0));
            }
        });
}
