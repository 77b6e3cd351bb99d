//! Shared helpers for coordinator integration tests

#![allow(dead_code)]

mod test_cluster;

pub use test_cluster::{
    TestCluster, TestCoordinator, TestNode, fast_config, wait_for, wait_for_bootstrap,
    wait_for_members, wait_for_other_peers,
};
