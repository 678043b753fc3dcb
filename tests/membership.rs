mod common;

use common::*;

use coreraft::consensus::{Mode, Role};
use coreraft::content::ReplicatedContent;
use coreraft::token::TokenType;

fn settled(cluster: &TestCluster) -> bool {
    cluster.leader().map_or(false, |leader| {
        let append_index = leader.machine.append_index();
        leader.machine.commit_index() == append_index && cluster.all_applied(append_index)
    })
}

#[test]
fn learner_catches_up_and_is_promoted() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_until(settled);
    for id in 0..20 {
        cluster.propose(&token_request(TokenType::Property, &format!("key{}", id), id));
    }
    cluster.run_until(settled);

    let learner = cluster.add_node();
    let leader = cluster.leader_index().unwrap();
    assert!(cluster.nodes[leader].machine.add_member(learner).unwrap());
    assert!(cluster.nodes[leader].machine.replication_members().contains(&learner));
    assert!(!cluster.nodes[leader].machine.voting_members().contains(&learner));

    cluster
        .run_until(|cluster| {
            settled(cluster)
                && cluster
                    .nodes
                    .iter()
                    .all(|node| node.machine.voting_members().contains(&learner))
        })
        .inspect(|cluster| {
            let leader = cluster.leader().unwrap();
            assert_eq!(leader.machine.voting_members().len(), 4);
            assert_eq!(leader.machine.shipping_mode(&learner), Some(Mode::Pipeline));

            let node = cluster.node(learner);
            assert_eq!(node.machine.role(), Role::Follower);
            assert_eq!(node.machine.leader(), Some(leader.id));
            assert_eq!(node.registry(TokenType::Property).len(), 20);
            assert_eq!(node.registry(TokenType::Property).get_id("key7"), Some(7));
            assert_eq!(node.log_terms(), leader.log_terms());
        });
}

#[test]
fn promoted_member_counts_towards_quorum() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(1, &mut random, config());
    cluster.run_until(TestCluster::has_leader);

    let learner = cluster.add_node();
    assert!(cluster.nodes[0].machine.add_member(learner).unwrap());
    cluster.run_until(|cluster| {
        cluster
            .nodes
            .iter()
            .all(|node| node.machine.voting_members().len() == 2)
            && settled(cluster)
    });

    // With two voting members, nothing commits while the promoted member is unreachable.
    cluster.config = config().isolate(1);
    let commit_index = cluster.nodes[0].machine.commit_index();
    cluster.propose(&token_request(TokenType::Label, "Person", 0));
    assert_eq!(cluster.nodes[0].machine.commit_index(), commit_index);

    cluster.config = config();
    cluster
        .run_until(|cluster| cluster.nodes[0].machine.commit_index() > commit_index)
        .inspect(|cluster| {
            assert_eq!(cluster.nodes[0].registry(TokenType::Label).get_id("Person"), Some(0));
        });
}

#[test]
fn only_the_leader_adds_members() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_for(10);
    let leader = cluster.leader_index().unwrap();
    let follower = (leader + 1) % 3;
    let learner = cluster.add_node();

    assert!(!cluster.nodes[follower].machine.add_member(learner).unwrap());
    assert!(!cluster.nodes[follower].machine.replication_members().contains(&learner));

    let existing = cluster.nodes[follower].id;
    assert!(!cluster.nodes[leader].machine.add_member(existing).unwrap());
}

#[test]
fn learner_without_responses_is_never_promoted() {
    let mut random = init_random();
    let mut cluster = TestCluster::new(3, &mut random, config());
    cluster.run_until(TestCluster::has_leader).run_until(settled);

    let learner = cluster.add_node();
    cluster.config = config().node_down(3);
    let leader = cluster.leader_index().unwrap();
    assert!(cluster.nodes[leader].machine.add_member(learner).unwrap());

    cluster
        .propose(&ReplicatedContent::Barrier)
        .run_for(100)
        .inspect(|cluster| {
            let leader = cluster.leader().unwrap();
            assert_eq!(leader.machine.voting_members().len(), 3);
            assert!(leader.machine.replication_members().contains(&learner));
            assert_eq!(cluster.node(learner).machine.append_index(), -1);
        });
}
