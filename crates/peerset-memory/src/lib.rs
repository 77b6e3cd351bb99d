//! In-memory consensus peer set for testing
//!
//! Models the parts of a consensus engine the coordinator depends on:
//! per-node durable configuration storage that survives a restart, an atomic
//! bootstrap that refuses to run if any proposed peer already holds a
//! configuration, and leader-only membership changes. There is no log and no
//! election; the node that bootstraps becomes leader and tests can move
//! leadership explicitly.

mod error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster_peerset::{Configuration, PeerAddress, PeerSetAdaptor};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use error::{Error, PeerSetResult};

#[derive(Default)]
struct NetworkState {
    /// Durable configuration per node
    stores: HashMap<PeerAddress, Configuration>,
    /// Current leader of the (single) group
    leader: Option<PeerAddress>,
    /// Remaining injected bootstrap failures per node
    bootstrap_faults: HashMap<PeerAddress, usize>,
    /// Remaining injected read failures per node
    read_faults: HashMap<PeerAddress, usize>,
    /// Successful bootstrap writes across the network
    bootstrap_writes: usize,
}

impl NetworkState {
    fn take_fault(faults: &mut HashMap<PeerAddress, usize>, addr: &PeerAddress) -> bool {
        match faults.get_mut(addr) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn configuration(&self, addr: &PeerAddress) -> Configuration {
        self.stores.get(addr).cloned().unwrap_or_default()
    }

    /// Replicate `config` to every voter in it.
    fn replicate(&mut self, config: &Configuration) {
        for peer in &config.peers {
            self.stores.insert(peer.clone(), config.clone());
        }
    }

    fn require_leader(&self, addr: &PeerAddress) -> Result<(), Error> {
        if self.leader.as_ref() == Some(addr) {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.leader.clone(),
            })
        }
    }
}

/// Shared consensus state of a test cluster.
#[derive(Clone, Default)]
pub struct MemoryPeerSetNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryPeerSetNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryPeerSetNetwork")
            .field("stores", &state.stores.len())
            .field("leader", &state.leader)
            .finish()
    }
}

impl MemoryPeerSetNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the peer set of the node at `addr`, reusing its store if the node
    /// ran before.
    pub fn open(&self, addr: PeerAddress) -> MemoryPeerSet {
        self.open_with_options(addr, MemoryPeerSetOptions::default())
    }

    /// Open with explicit options.
    pub fn open_with_options(
        &self,
        addr: PeerAddress,
        options: MemoryPeerSetOptions,
    ) -> MemoryPeerSet {
        let existing = self
            .state
            .lock()
            .stores
            .get(&addr)
            .is_some_and(Configuration::is_bootstrapped);
        debug!("Opening peer set for {} (existing configuration: {})", addr, existing);

        MemoryPeerSet {
            network: self.clone(),
            addr,
            write_delay: options.write_delay,
        }
    }

    /// Durable configuration of the node at `addr`.
    pub fn configuration_of(&self, addr: &PeerAddress) -> Configuration {
        self.state.lock().configuration(addr)
    }

    /// Number of successful bootstrap writes so far.
    pub fn bootstrap_writes(&self) -> usize {
        self.state.lock().bootstrap_writes
    }

    /// Current leader.
    pub fn leader(&self) -> Option<PeerAddress> {
        self.state.lock().leader.clone()
    }

    /// Move leadership (or clear it).
    pub fn set_leader(&self, leader: Option<PeerAddress>) {
        info!("Leadership moved to {:?}", leader);
        self.state.lock().leader = leader;
    }

    /// Make the next `count` bootstrap writes from `addr` fail with a storage
    /// fault.
    pub fn fail_next_bootstraps(&self, addr: &PeerAddress, count: usize) {
        self.state
            .lock()
            .bootstrap_faults
            .insert(addr.clone(), count);
    }

    /// Make the next `count` configuration reads on `addr` fail.
    pub fn fail_next_reads(&self, addr: &PeerAddress, count: usize) {
        self.state.lock().read_faults.insert(addr.clone(), count);
    }

    /// Seed a node's durable store, as if it had run before.
    pub fn persist(&self, addr: &PeerAddress, config: Configuration) {
        self.state.lock().stores.insert(addr.clone(), config);
    }
}

/// Options for one node's peer set
#[derive(Clone, Debug, Default)]
pub struct MemoryPeerSetOptions {
    /// Delay applied before each bootstrap write takes effect
    pub write_delay: Option<Duration>,
}

/// One node's handle onto a [`MemoryPeerSetNetwork`].
#[derive(Clone)]
pub struct MemoryPeerSet {
    network: MemoryPeerSetNetwork,
    addr: PeerAddress,
    write_delay: Option<Duration>,
}

impl std::fmt::Debug for MemoryPeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeerSet")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl MemoryPeerSet {
    /// The network this node belongs to.
    pub fn network(&self) -> &MemoryPeerSetNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerSetAdaptor for MemoryPeerSet {
    type Error = Error;

    fn local_address(&self) -> PeerAddress {
        self.addr.clone()
    }

    async fn current_configuration(&self) -> PeerSetResult<Configuration> {
        let mut state = self.network.state.lock();
        if NetworkState::take_fault(&mut state.read_faults, &self.addr) {
            return Err(Error::Storage(self.addr.clone()));
        }
        Ok(state.configuration(&self.addr))
    }

    async fn bootstrap(&self, peers: &[PeerAddress]) -> PeerSetResult<()> {
        if peers.is_empty() {
            return Err(Error::EmptyPeerSet);
        }

        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.network.state.lock();

        if NetworkState::take_fault(&mut state.bootstrap_faults, &self.addr) {
            warn!("Injected storage fault on bootstrap from {}", self.addr);
            return Err(Error::Storage(self.addr.clone()));
        }

        // Test-and-set across this node and every proposed peer
        let holder = std::iter::once(&self.addr)
            .chain(peers.iter())
            .find(|addr| state.configuration(addr).is_bootstrapped());
        if let Some(holder) = holder {
            return Err(Error::AlreadyBootstrapped(holder.clone()));
        }

        let config = Configuration::new(peers.iter().cloned());
        state.replicate(&config);
        state.leader = Some(self.addr.clone());
        state.bootstrap_writes += 1;

        info!(
            "Bootstrapped consensus group from {} with {} peers",
            self.addr,
            config.len()
        );
        Ok(())
    }

    async fn add_peer(&self, addr: &PeerAddress) -> PeerSetResult<()> {
        let mut state = self.network.state.lock();
        state.require_leader(&self.addr)?;

        let mut config = state.configuration(&self.addr);
        if config.peers.insert(addr.clone()) {
            info!("Leader {} added peer {}", self.addr, addr);
            state.replicate(&config);
        }
        Ok(())
    }

    async fn remove_peer(&self, addr: &PeerAddress) -> PeerSetResult<()> {
        let mut state = self.network.state.lock();
        state.require_leader(&self.addr)?;

        let mut config = state.configuration(&self.addr);
        if !config.peers.remove(addr) {
            return Ok(());
        }

        info!("Leader {} removed peer {}", self.addr, addr);
        state.replicate(&config);
        if *addr == self.addr {
            state.leader = config.peers.iter().next().cloned();
        }
        Ok(())
    }

    async fn is_leader(&self) -> bool {
        self.network.state.lock().leader.as_ref() == Some(&self.addr)
    }
}
