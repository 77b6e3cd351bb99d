//! Test cluster utilities for integration testing

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use muster_bootable::Bootable;
use muster_coordinator::{BackoffConfig, BootstrapState, Coordinator, CoordinatorConfig};
use muster_gossip::Member;
use muster_gossip_memory::{MemoryGossip, MemoryGossipNetwork, MemoryGossipOptions};
use muster_peerset::PeerAddress;
use muster_peerset_memory::{MemoryPeerSet, MemoryPeerSetNetwork, MemoryPeerSetOptions};
use tracing::info;

/// Coordinator over the in-memory adaptors
pub type TestCoordinator = Coordinator<MemoryGossip, MemoryPeerSet>;

const GOSSIP_PORT_BASE: u16 = 14_000;
const RPC_PORT_BASE: u16 = 24_000;

/// Configuration with short timers suitable for tests
pub fn fast_config(name: &str, region: &str, expect: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        node_name: name.to_string(),
        region: region.to_string(),
        bootstrap_expect: expect,
        reconcile_interval: Some(Duration::from_millis(50)),
        join_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        },
        shutdown_timeout: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    }
}

/// One server of a test cluster
pub struct TestNode {
    /// Configuration the node was started with
    pub config: CoordinatorConfig,
    /// Gossip address
    pub gossip_addr: String,
    /// Consensus address
    pub rpc_addr: PeerAddress,
    /// Gossip handle, for fault injection
    pub gossip: MemoryGossip,
    /// The coordinator under test
    pub coordinator: Arc<TestCoordinator>,
}

impl TestNode {
    /// Node name
    pub fn name(&self) -> &str {
        &self.config.node_name
    }
}

/// Test cluster manager
pub struct TestCluster {
    /// Shared gossip network
    pub gossip: MemoryGossipNetwork,
    /// Shared consensus state
    pub peers: MemoryPeerSetNetwork,
    nodes: Vec<TestNode>,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Self {
            gossip: MemoryGossipNetwork::new(),
            peers: MemoryPeerSetNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Add and start a node with [`fast_config`]
    pub async fn add_node(&mut self, name: &str, region: &str, expect: u32) -> usize {
        self.add_node_with(
            fast_config(name, region, expect),
            MemoryGossipOptions::default(),
            MemoryPeerSetOptions::default(),
        )
        .await
    }

    /// Add and start a node with explicit configuration
    pub async fn add_node_with(
        &mut self,
        config: CoordinatorConfig,
        gossip_options: MemoryGossipOptions,
        peer_options: MemoryPeerSetOptions,
    ) -> usize {
        let index = self.nodes.len();
        let offset = u16::try_from(index).expect("too many test nodes");
        let gossip_addr = format!("127.0.0.1:{}", GOSSIP_PORT_BASE + offset);
        let rpc_port = RPC_PORT_BASE + offset;
        let rpc_addr = PeerAddress::parse(format!("127.0.0.1:{rpc_port}")).unwrap();

        let node = self
            .start_node(config, gossip_addr, rpc_addr, rpc_port, gossip_options, peer_options)
            .await;
        self.nodes.push(node);
        index
    }

    async fn start_node(
        &self,
        config: CoordinatorConfig,
        gossip_addr: String,
        rpc_addr: PeerAddress,
        rpc_port: u16,
        gossip_options: MemoryGossipOptions,
        peer_options: MemoryPeerSetOptions,
    ) -> TestNode {
        let member = Member::new(
            config.node_name.as_str(),
            gossip_addr.clone(),
            config.server_tags(rpc_port).to_tags(),
        );
        let gossip = self
            .gossip
            .bind_with_options(member, gossip_options)
            .expect("failed to bind gossip");
        let peer_set = self.peers.open_with_options(rpc_addr.clone(), peer_options);

        let coordinator = Arc::new(
            Coordinator::new(config.clone(), gossip.clone(), peer_set)
                .expect("failed to create coordinator"),
        );
        coordinator.start().await.expect("failed to start coordinator");
        info!("Started test node {} at {}", config.node_name, gossip_addr);

        TestNode {
            config,
            gossip_addr,
            rpc_addr,
            gossip,
            coordinator,
        }
    }

    /// Stop a node and start a fresh coordinator on the same addresses and
    /// durable consensus store
    pub async fn restart_node(&mut self, index: usize) {
        let old = &self.nodes[index];
        old.coordinator
            .shutdown()
            .await
            .expect("failed to stop coordinator");

        let config = old.config.clone();
        let gossip_addr = old.gossip_addr.clone();
        let rpc_addr = old.rpc_addr.clone();
        let rpc_port = rpc_addr.port();

        let node = self
            .start_node(
                config,
                gossip_addr,
                rpc_addr,
                rpc_port,
                MemoryGossipOptions::default(),
                MemoryPeerSetOptions::default(),
            )
            .await;
        self.nodes[index] = node;
    }

    /// Consensus address the next added node will get
    pub fn next_rpc_addr(&self) -> PeerAddress {
        let offset = u16::try_from(self.nodes.len()).expect("too many test nodes");
        PeerAddress::parse(format!("127.0.0.1:{}", RPC_PORT_BASE + offset)).unwrap()
    }

    /// Node by index
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Coordinator by index
    pub fn coordinator(&self, index: usize) -> &Arc<TestCoordinator> {
        &self.nodes[index].coordinator
    }

    /// All nodes
    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// Join every node to the first one
    pub async fn join_all(&self) {
        let seed = vec![self.nodes[0].gossip_addr.clone()];
        for node in &self.nodes[1..] {
            let contacted = node.coordinator.join(&seed).await.expect("join failed");
            assert_eq!(contacted, 1);
        }
    }

    /// Shut every coordinator down
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.coordinator.shutdown().await;
        }
    }
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Wait until the coordinator reports `count` members
pub async fn wait_for_members(
    coordinator: &Arc<TestCoordinator>,
    count: usize,
    timeout: Duration,
) -> bool {
    wait_for(timeout, || {
        let coordinator = coordinator.clone();
        async move { coordinator.members().await.len() == count }
    })
    .await
}

/// Wait until the coordinator has a consensus group
pub async fn wait_for_bootstrap(coordinator: &Arc<TestCoordinator>, timeout: Duration) -> bool {
    wait_for(timeout, || {
        let coordinator = coordinator.clone();
        async move { coordinator.bootstrap_state() == BootstrapState::Bootstrapped }
    })
    .await
}

/// Wait until the coordinator sees `count` other consensus peers
pub async fn wait_for_other_peers(
    coordinator: &Arc<TestCoordinator>,
    count: usize,
    timeout: Duration,
) -> bool {
    wait_for(timeout, || {
        let coordinator = coordinator.clone();
        async move { coordinator.num_other_peers().await.is_ok_and(|n| n == count) }
    })
    .await
}
