//! Join, leave and steady-state membership

use std::time::Duration;

mod common;
use common::{TestCluster, fast_config, wait_for, wait_for_members, wait_for_other_peers};
use muster_bootable::Bootable;
use muster_coordinator::ErrorKind;
use muster_gossip::{GossipAdaptor, Member, Role, ServerTags, tags};
use muster_gossip_memory::MemoryGossipOptions;
use muster_peerset::PeerAddress;
use muster_peerset_memory::MemoryPeerSetOptions;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_join_across_regions() {
    let mut cluster = TestCluster::new();
    cluster.add_node("a1", "region-a", 0).await;
    cluster.add_node("b1", "region-b", 0).await;

    let seed = vec![cluster.node(1).gossip_addr.clone()];
    assert_eq!(cluster.coordinator(0).join(&seed).await.unwrap(), 1);

    for node in cluster.nodes() {
        assert!(wait_for_members(&node.coordinator, 2, WAIT).await);
    }

    let registry = cluster.coordinator(0).registry();
    assert_eq!(registry.eligible_count("region-a", Some(Role::Server)).await, 1);
    assert_eq!(registry.eligible_count("region-b", Some(Role::Server)).await, 1);
    assert_eq!(registry.eligible_count("region-c", None).await, 0);

    // Servers in other regions never enter the consensus group
    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in cluster.nodes() {
        assert_eq!(node.coordinator.num_other_peers().await.unwrap(), 0);
    }
    assert_eq!(cluster.peers.bootstrap_writes(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_counts_only_reachable_addresses() {
    let mut cluster = TestCluster::new();
    cluster.add_node("s1", "global", 0).await;
    cluster.add_node("s2", "global", 0).await;
    cluster.add_node("s3", "global", 0).await;

    cluster.gossip.set_reachable(&cluster.node(2).gossip_addr, false);
    let addresses = vec![
        cluster.node(1).gossip_addr.clone(),
        cluster.node(2).gossip_addr.clone(),
        "127.0.0.1:1".to_string(),
    ];
    assert_eq!(cluster.coordinator(0).join(&addresses).await.unwrap(), 1);

    assert!(wait_for_members(cluster.coordinator(0), 2, WAIT).await);
    assert!(wait_for_members(cluster.coordinator(1), 2, WAIT).await);
    assert_eq!(cluster.coordinator(2).members().await.len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_empty_join_contacts_nobody() {
    let mut cluster = TestCluster::new();
    cluster.add_node("s1", "global", 0).await;

    assert_eq!(cluster.coordinator(0).join(&[]).await.unwrap(), 0);
    assert_eq!(cluster.coordinator(0).members().await.len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_members_converge_through_one_seed() {
    let mut cluster = TestCluster::new();
    for name in ["s1", "s2", "s3", "s4"] {
        cluster.add_node(name, "global", 0).await;
    }
    cluster.join_all().await;

    for node in cluster.nodes() {
        assert!(
            wait_for_members(&node.coordinator, 4, WAIT).await,
            "{} did not converge",
            node.name()
        );
        let mut names: Vec<String> = node
            .coordinator
            .members()
            .await
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["s1", "s2", "s3", "s4"]);
    }

    // Every node counts the same eligible servers once gossip has converged
    let mut counts = Vec::new();
    for node in cluster.nodes() {
        counts.push(
            node.coordinator
                .registry()
                .eligible_count("global", Some(Role::Server))
                .await,
        );
    }
    assert_eq!(counts, [4, 4, 4, 4]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leave_is_idempotent_and_final() {
    let mut cluster = TestCluster::new();
    cluster.add_node("a1", "region-a", 0).await;
    cluster.add_node("a2", "region-a", 0).await;
    cluster.join_all().await;
    assert!(wait_for_members(cluster.coordinator(0), 2, WAIT).await);

    let leaving = cluster.coordinator(1);
    leaving.leave().await.unwrap();
    leaving.leave().await.unwrap();
    assert!(wait_for_members(cluster.coordinator(0), 1, WAIT).await);

    let seed = vec![cluster.node(0).gossip_addr.clone()];
    let err = leaving.join(&seed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // The cluster keeps accepting new members after a departure
    cluster.add_node("b1", "region-b", 0).await;
    let seed = vec![cluster.node(0).gossip_addr.clone()];
    assert_eq!(cluster.coordinator(2).join(&seed).await.unwrap(), 1);
    assert!(wait_for_members(cluster.coordinator(0), 2, WAIT).await);
    assert!(wait_for_members(cluster.coordinator(2), 2, WAIT).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_removes_left_but_keeps_failed_servers() {
    let mut cluster = TestCluster::new();
    for name in ["s1", "s2", "s3", "s4"] {
        cluster.add_node(name, "global", 2).await;
    }
    cluster.join_all().await;

    for node in cluster.nodes() {
        assert!(wait_for_other_peers(&node.coordinator, 3, WAIT).await);
    }
    let leader = cluster.peers.leader().expect("group has a leader");
    let followers: Vec<usize> = (0..cluster.nodes().len())
        .filter(|&i| cluster.node(i).rpc_addr != leader)
        .collect();
    let leaver = followers[0];
    let crasher = followers[1];
    let leaver_addr = cluster.node(leaver).rpc_addr.clone();
    let crasher_addr = cluster.node(crasher).rpc_addr.clone();

    cluster.coordinator(leaver).leave().await.unwrap();
    assert!(
        wait_for(WAIT, || {
            let peers = cluster.peers.clone();
            let leader = leader.clone();
            let leaver_addr = leaver_addr.clone();
            async move { !peers.configuration_of(&leader).contains(&leaver_addr) }
        })
        .await,
        "gracefully departed server was not removed"
    );

    cluster.coordinator(crasher).shutdown().await.unwrap();
    let leader_index = (0..cluster.nodes().len())
        .find(|&i| cluster.node(i).rpc_addr == leader)
        .expect("leader is a cluster node");
    assert!(wait_for_members(cluster.coordinator(leader_index), 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let config = cluster.peers.configuration_of(&leader);
    assert!(config.contains(&crasher_addr), "failed server was removed");
    assert_eq!(config.len(), 3);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_timeout() {
    let mut cluster = TestCluster::new();
    cluster.add_node("s1", "global", 0).await;

    let mut config = fast_config("s2", "global", 0);
    config.join_timeout = Duration::from_millis(50);
    cluster
        .add_node_with(
            config,
            MemoryGossipOptions {
                join_latency: Some(Duration::from_millis(500)),
                ..MemoryGossipOptions::default()
            },
            MemoryPeerSetOptions::default(),
        )
        .await;

    let seed = vec![cluster.node(0).gossip_addr.clone()];
    let err = cluster.coordinator(1).join(&seed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_without_transport() {
    let mut cluster = TestCluster::new();
    cluster.add_node("s1", "global", 0).await;
    cluster.add_node("s2", "global", 0).await;

    cluster
        .gossip
        .set_transport_available(&cluster.node(1).gossip_addr, false);
    let seed = vec![cluster.node(0).gossip_addr.clone()];
    let err = cluster.coordinator(1).join(&seed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    cluster
        .gossip
        .set_transport_available(&cluster.node(1).gossip_addr, true);
    assert_eq!(cluster.coordinator(1).join(&seed).await.unwrap(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_malformed_tags_are_reported_not_fatal() {
    let mut cluster = TestCluster::new();
    cluster.add_node("s1", "global", 2).await;

    let mut raw_tags = ServerTags::new("global", 2, 29_000).to_tags();
    raw_tags.insert(tags::EXPECT.to_string(), "lots".to_string());
    let raw = cluster
        .gossip
        .bind(Member::new("odd", "127.0.0.1:19000", raw_tags))
        .unwrap();
    let seed = vec![cluster.node(0).gossip_addr.clone()];
    assert_eq!(raw.join(&seed).await.unwrap(), 1);

    assert!(wait_for_members(cluster.coordinator(0), 2, WAIT).await);
    assert!(
        wait_for(WAIT, || {
            let coordinator = cluster.coordinator(0).clone();
            async move { coordinator.diagnostics().inconsistent_tags == 1 }
        })
        .await
    );

    let diagnostics = cluster.coordinator(0).diagnostics();
    assert_eq!(diagnostics.candidates_seen, 1);
    assert_eq!(cluster.peers.bootstrap_writes(), 0);
    assert!(
        !cluster
            .peers
            .configuration_of(&PeerAddress::parse("127.0.0.1:29000").unwrap())
            .is_bootstrapped()
    );

    raw.shutdown().await.unwrap();
    cluster.shutdown().await;
}
