//! In-memory gossip implementation for testing
//!
//! Every node bound to the same [`MemoryGossipNetwork`] lives in this process.
//! Joins merge memberships immediately (a full push-pull between the two
//! clusters), graceful leaves are seen as `Left` and shutdowns as `Failed`, so
//! the coordinator can be exercised end to end without sockets.
//!
//! The network is an explicit handle rather than a process-wide registry, so
//! independent tests never observe each other's nodes.

mod error;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_gossip::{GossipAdaptor, Member, MemberEvent, MemberEventStream, MemberId, MemberStatus};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use error::Error;

/// Default capacity of each subscriber's event channel.
const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Configuration for a memory gossip node
#[derive(Debug, Clone)]
pub struct MemoryGossipOptions {
    /// Capacity of each subscription channel
    pub event_buffer: usize,

    /// Artificial delay applied to every join, to exercise caller timeouts
    pub join_latency: Option<Duration>,
}

impl Default for MemoryGossipOptions {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            join_latency: None,
        }
    }
}

/// State of one bound node.
struct NodeState {
    local: Member,
    view: BTreeMap<MemberId, Member>,
    subscribers: Vec<flume::Sender<MemberEvent>>,
    running: bool,
    left: bool,
    event_buffer: usize,
}

impl NodeState {
    fn is_live(&self) -> bool {
        self.running && !self.left
    }

    fn emit(&mut self, event: &MemberEvent) {
        let owner = self.local.id.clone();
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                warn!("Dropping gossip event {} for {}: subscriber is full", event, owner);
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }
}

#[derive(Default)]
struct NetworkState {
    /// Nodes keyed by gossip address
    nodes: HashMap<String, NodeState>,
    /// Addresses that cannot be contacted by joins
    unreachable: HashSet<String>,
    /// Nodes whose own transport is switched off
    transport_down: HashSet<String>,
}

impl NetworkState {
    fn node(&self, addr: &str) -> Result<&NodeState, Error> {
        let node = self
            .nodes
            .get(addr)
            .ok_or_else(|| Error::NotRunning(addr.to_string()))?;
        if !node.running {
            return Err(Error::NotRunning(addr.to_string()));
        }
        if node.left {
            return Err(Error::AlreadyLeft(addr.to_string()));
        }
        Ok(node)
    }

    fn is_contactable(&self, addr: &str) -> bool {
        !self.unreachable.contains(addr) && self.nodes.get(addr).is_some_and(NodeState::is_live)
    }

    /// Every live node reachable through the views of `seeds`.
    fn cluster_of(&self, seeds: &[&str]) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = seeds.iter().map(|s| (*s).to_string()).collect();

        while let Some(addr) = queue.pop_front() {
            let Some(node) = self.nodes.get(&addr) else {
                continue;
            };
            if !node.is_live() || !seen.insert(addr) {
                continue;
            }
            for member in node.view.values() {
                if !seen.contains(&member.addr) {
                    queue.push_back(member.addr.clone());
                }
            }
        }

        seen.into_iter().collect()
    }

    /// Push-pull: every node in the cluster learns every other node's current
    /// record.
    fn merge(&mut self, seeds: &[&str]) {
        let cluster = self.cluster_of(seeds);
        let records: Vec<Member> = cluster
            .iter()
            .filter_map(|addr| self.nodes.get(addr))
            .map(|node| node.local.clone())
            .collect();

        for addr in &cluster {
            let Some(node) = self.nodes.get_mut(addr) else {
                continue;
            };
            for record in &records {
                let event = match node.view.get(&record.id) {
                    None => MemberEvent::Joined(record.clone()),
                    Some(known) if known != record => MemberEvent::Updated(record.clone()),
                    Some(_) => continue,
                };
                node.view.insert(record.id.clone(), record.clone());
                if record.id != node.local.id {
                    node.emit(&event);
                }
            }
        }
    }

    /// Remove `departed` from every other live view, delivering `make_event`.
    fn broadcast_departure(&mut self, departed: &Member, make_event: fn(Member) -> MemberEvent) {
        for (addr, node) in &mut self.nodes {
            if *addr == departed.addr || !node.is_live() {
                continue;
            }
            if node.view.remove(&departed.id).is_some() {
                node.emit(&make_event(departed.clone()));
            }
        }
    }
}

/// A simulated gossip network shared by every node of a test cluster.
#[derive(Clone, Default)]
pub struct MemoryGossipNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryGossipNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGossipNetwork")
            .field("nodes", &self.state.lock().nodes.len())
            .finish_non_exhaustive()
    }
}

impl MemoryGossipNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a node with default options.
    ///
    /// # Errors
    ///
    /// Fails if a running node already owns the address.
    pub fn bind(&self, local: Member) -> Result<MemoryGossip, Error> {
        self.bind_with_options(local, MemoryGossipOptions::default())
    }

    /// Bind a node. A stopped node at the same address is replaced, which is
    /// how tests model a restart.
    ///
    /// # Errors
    ///
    /// Fails if a running node already owns the address.
    pub fn bind_with_options(
        &self,
        local: Member,
        options: MemoryGossipOptions,
    ) -> Result<MemoryGossip, Error> {
        let mut state = self.state.lock();

        if state.nodes.get(&local.addr).is_some_and(|n| n.running) {
            return Err(Error::AddressInUse(local.addr));
        }

        let local = local.with_status(MemberStatus::Alive);
        let mut view = BTreeMap::new();
        view.insert(local.id.clone(), local.clone());

        info!("Memory gossip node {} bound at {}", local.id, local.addr);

        let addr = local.addr.clone();
        state.nodes.insert(
            addr.clone(),
            NodeState {
                local,
                view,
                subscribers: Vec::new(),
                running: true,
                left: false,
                event_buffer: options.event_buffer.max(1),
            },
        );

        Ok(MemoryGossip {
            network: self.clone(),
            addr,
            join_latency: options.join_latency,
        })
    }

    /// Make joins to `addr` fail (or succeed again).
    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(addr);
        } else {
            state.unreachable.insert(addr.to_string());
        }
    }

    /// Switch the transport of the node at `addr` off (or on again); joins and
    /// leaves issued by that node fail while it is off.
    pub fn set_transport_available(&self, addr: &str, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.transport_down.remove(addr);
        } else {
            state.transport_down.insert(addr.to_string());
        }
    }

    /// Crash the node at `addr`: peers observe it as failed.
    pub fn fail(&self, addr: &str) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get_mut(addr) else {
            return;
        };
        if !node.running {
            return;
        }
        node.running = false;
        node.subscribers.clear();
        let was_left = node.left;
        let departed = node.local.clone().with_status(MemberStatus::Failed);

        if !was_left {
            info!("Memory gossip node {} failed", departed.id);
            state.broadcast_departure(&departed, MemberEvent::Failed);
        }
    }

    /// Addresses of every node currently running.
    pub fn running_addresses(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut addrs: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.running)
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort();
        addrs
    }
}

/// One node's handle onto a [`MemoryGossipNetwork`].
#[derive(Clone)]
pub struct MemoryGossip {
    network: MemoryGossipNetwork,
    addr: String,
    join_latency: Option<Duration>,
}

impl std::fmt::Debug for MemoryGossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGossip")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl MemoryGossip {
    /// Gossip address of this node.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The network this node is bound to.
    pub fn network(&self) -> &MemoryGossipNetwork {
        &self.network
    }

    /// Replace this node's tags and propagate an update to its cluster.
    ///
    /// # Errors
    ///
    /// Fails if the node is not running or has left.
    pub fn set_tags(&self, tags: BTreeMap<String, String>) -> Result<(), Error> {
        let mut state = self.network.state.lock();
        state.node(&self.addr)?;

        let updated = {
            let Some(node) = state.nodes.get_mut(&self.addr) else {
                return Err(Error::NotRunning(self.addr.clone()));
            };
            node.local.tags = tags;
            node.view.insert(node.local.id.clone(), node.local.clone());
            node.local.clone()
        };

        debug!("Propagating tag update for {}", updated.id);
        for (addr, node) in &mut state.nodes {
            if !node.is_live() {
                continue;
            }
            if *addr == self.addr || node.view.contains_key(&updated.id) {
                node.view.insert(updated.id.clone(), updated.clone());
                node.emit(&MemberEvent::Updated(updated.clone()));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl GossipAdaptor for MemoryGossip {
    type Error = Error;

    fn local_member(&self) -> Member {
        let state = self.network.state.lock();
        state.nodes.get(&self.addr).map_or_else(
            || Member::new("unknown", self.addr.clone(), BTreeMap::new()),
            |node| node.local.clone(),
        )
    }

    fn subscribe(&self) -> MemberEventStream {
        let mut state = self.network.state.lock();
        match state.nodes.get_mut(&self.addr) {
            Some(node) if node.is_live() => {
                let (tx, rx) = flume::bounded(node.event_buffer);
                node.subscribers.push(tx);
                Box::pin(rx.into_stream())
            }
            _ => Box::pin(futures::stream::empty()),
        }
    }

    async fn join(&self, addresses: &[String]) -> Result<usize, Self::Error> {
        {
            let state = self.network.state.lock();
            state.node(&self.addr)?;
            if state.transport_down.contains(&self.addr) {
                return Err(Error::TransportUnavailable(self.addr.clone()));
            }
        }

        if let Some(latency) = self.join_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.network.state.lock();
        state.node(&self.addr)?;

        let mut contacted = 0;
        for target in addresses {
            if *target == self.addr {
                contacted += 1;
                continue;
            }
            if !state.is_contactable(target) {
                debug!("Memory gossip {} could not contact {}", self.addr, target);
                continue;
            }
            state.merge(&[self.addr.as_str(), target.as_str()]);
            contacted += 1;
        }

        info!(
            "Memory gossip {} contacted {} of {} addresses",
            self.addr,
            contacted,
            addresses.len()
        );
        Ok(contacted)
    }

    async fn leave(&self) -> Result<(), Self::Error> {
        let mut state = self.network.state.lock();

        let departed = {
            let Some(node) = state.nodes.get_mut(&self.addr) else {
                return Err(Error::NotRunning(self.addr.clone()));
            };
            if node.left {
                return Ok(());
            }
            if !node.running {
                return Err(Error::NotRunning(self.addr.clone()));
            }
            node.local.clone().with_status(MemberStatus::Left)
        };

        if state.transport_down.contains(&self.addr) {
            return Err(Error::TransportUnavailable(self.addr.clone()));
        }

        if let Some(node) = state.nodes.get_mut(&self.addr) {
            node.left = true;
            node.local.status = MemberStatus::Left;
            node.view.retain(|id, _| *id == departed.id);
        }

        info!("Memory gossip node {} left the cluster", departed.id);
        state.broadcast_departure(&departed, MemberEvent::Left);
        Ok(())
    }

    async fn members(&self) -> Result<Vec<Member>, Self::Error> {
        let state = self.network.state.lock();
        let node = state
            .nodes
            .get(&self.addr)
            .filter(|node| node.running)
            .ok_or_else(|| Error::NotRunning(self.addr.clone()))?;
        Ok(node.view.values().cloned().collect())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.network.fail(&self.addr);
        Ok(())
    }
}
