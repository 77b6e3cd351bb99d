//! Bootstrap reconciler
//!
//! Decides when it is safe to write the initial consensus configuration and
//! writes it at most once. A server bootstraps only when it can see exactly
//! `bootstrap_expect` servers of its region that declare the same expected
//! count and protocol versions, and only if it is itself among the
//! deterministically selected set. Servers that disagree on the expected count
//! never become candidates. If enough of them are visible to bootstrap a group
//! of their own, nobody bootstraps, so two pools configured differently stall
//! instead of forming two groups.
//!
//! The engine's bootstrap is a test-and-set: if any selected server already
//! holds a configuration the write fails with `AlreadyBootstrapped` and the
//! reconciler adopts the existing group instead of retrying.
//!
//! Once bootstrapped, the leader keeps the consensus membership in step with
//! gossip: it adds local-region servers the configuration is missing and
//! removes servers that left gracefully. Failed servers are left alone.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use muster_gossip::{Member, ServerTags};
use muster_peerset::{
    Configuration, PeerAddress, PeerSetAdaptor, PeerSetAdaptorError, PeerSetErrorKind,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::CoordinatorConfig;
use crate::diagnostics::BootstrapDiagnostics;
use crate::error::{CoordinatorResult, Error, ErrorKind};
use crate::registry::{BootstrapView, PeerRegistry};
use crate::state::ReconcilerState;

/// Drives bootstrap and steady-state membership reconciliation.
pub struct Reconciler<P>
where
    P: PeerSetAdaptor,
{
    local: Member,
    local_tags: ServerTags,
    local_addr: PeerAddress,
    expect: u32,
    write_timeout: Duration,
    reconcile_interval: Option<Duration>,
    registry: Arc<PeerRegistry>,
    peer_set: Arc<P>,
    state: watch::Sender<ReconcilerState>,
    /// Single-writer guard around an evaluation
    guard: tokio::sync::Mutex<()>,
    /// Set when a trigger arrives while an evaluation is in flight
    rerun: AtomicBool,
    backoff: Mutex<Backoff>,
    diagnostics: Mutex<BootstrapDiagnostics>,
    departures: flume::Receiver<PeerAddress>,
    pending_removals: Mutex<BTreeSet<PeerAddress>>,
    /// Cancelled once the reconciler stops accepting triggers
    stopped: CancellationToken,
}

impl<P> Reconciler<P>
where
    P: PeerSetAdaptor,
{
    /// Create a reconciler for the local server.
    ///
    /// `departures` carries the consensus addresses of local-region servers
    /// that left gossip gracefully.
    pub fn new(
        config: &CoordinatorConfig,
        local: Member,
        local_tags: ServerTags,
        registry: Arc<PeerRegistry>,
        peer_set: Arc<P>,
        departures: flume::Receiver<PeerAddress>,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Idle);
        let local_addr = peer_set.local_address();

        Self {
            local,
            local_tags,
            local_addr,
            expect: config.bootstrap_expect,
            write_timeout: config.write_timeout,
            reconcile_interval: config.reconcile_interval,
            registry,
            peer_set,
            state,
            guard: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
            backoff: Mutex::new(Backoff::new(config.backoff.clone())),
            diagnostics: Mutex::new(BootstrapDiagnostics {
                expected: config.bootstrap_expect,
                ..BootstrapDiagnostics::default()
            }),
            departures,
            pending_removals: Mutex::new(BTreeSet::new()),
            stopped: CancellationToken::new(),
        }
    }

    /// Stop accepting triggers. An evaluation already in flight completes.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    /// Whether [`Reconciler::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Current phase
    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// Snapshot of the bootstrap diagnostics
    pub fn diagnostics(&self) -> BootstrapDiagnostics {
        let mut diagnostics = self.diagnostics.lock().clone();
        diagnostics.state = self.state();
        diagnostics
    }

    /// Start the background loop: evaluate on every registry change, on the
    /// periodic tick if one is configured, and when a backoff delay expires.
    pub fn start_reconciling(
        self: Arc<Self>,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) {
        let token = cancellation_token.clone();

        task_tracker.spawn(async move {
            info!("Starting bootstrap reconciler for {}", self.local.id);

            let mut changes = self.registry.subscribe();
            let mut ticker = self.reconcile_interval.map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });

            // Initial evaluation covers restarts and members seeded before start
            self.trigger().await;

            loop {
                let retry_at = self.backoff.lock().retry_at();

                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Bootstrap reconciler shutting down");
                        return;
                    }
                    _ = self.stopped.cancelled() => {
                        info!("Bootstrap reconciler stopped");
                        return;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            debug!("Registry dropped, stopping reconciler");
                            return;
                        }
                        debug!("Registry change detected");
                        self.trigger().await;
                    }
                    () = next_tick(&mut ticker) => {
                        debug!("Periodic reconciliation");
                        self.trigger().await;
                    }
                    () = sleep_until(retry_at) => {
                        self.backoff.lock().clear_retry();
                        debug!("Bootstrap backoff elapsed, retrying");
                        self.trigger().await;
                    }
                }
            }
        });
    }

    /// Run an evaluation now.
    ///
    /// If one is already in flight this returns immediately and the in-flight
    /// evaluation runs exactly once more after it finishes, however many
    /// triggers arrived meanwhile. Does nothing once stopped.
    pub async fn trigger(&self) {
        if self.is_stopped() {
            debug!("Reconciler stopped, ignoring trigger");
            return;
        }
        self.rerun.store(true, Ordering::SeqCst);

        loop {
            let Ok(guard) = self.guard.try_lock() else {
                return;
            };
            if self.is_stopped() || !self.rerun.swap(false, Ordering::SeqCst) {
                return;
            }
            self.evaluate().await;
            drop(guard);
        }
    }

    async fn evaluate(&self) {
        self.diagnostics.lock().evaluations += 1;

        if self.state() == ReconcilerState::Bootstrapped {
            if let Err(e) = self.reconcile_members().await {
                warn!("Membership reconciliation failed: {}", e);
            }
            return;
        }

        if !self.backoff.lock().ready() {
            debug!("Bootstrap write is backing off");
            return;
        }

        self.set_state(ReconcilerState::Evaluating);

        match self.try_bootstrap().await {
            Ok(true) => {
                self.backoff.lock().reset();
                self.set_state(ReconcilerState::Bootstrapped);
                info!("{} is part of a bootstrapped consensus group", self.local.id);

                if let Err(e) = self.reconcile_members().await {
                    warn!("Membership reconciliation failed: {}", e);
                }
            }
            Ok(false) => self.set_state(ReconcilerState::Idle),
            Err(e) => {
                self.set_state(ReconcilerState::Idle);
                debug!("Bootstrap evaluation ended without a configuration: {}", e);
            }
        }
    }

    /// One pass of the bootstrap algorithm. `Ok(true)` means a configuration
    /// now exists.
    async fn try_bootstrap(&self) -> CoordinatorResult<bool> {
        let existing = self.read_configuration().await?;
        if existing.is_bootstrapped() {
            info!(
                "Found existing configuration with {} peers, adopting it",
                existing.len()
            );
            return Ok(true);
        }

        // Bootstrap disabled: only an existing configuration is adopted
        if self.expect == 0 {
            return Ok(false);
        }

        let view = self
            .registry
            .bootstrap_view(&self.local, &self.local_tags)
            .await;
        self.record_view(&view);

        if view.competing_groups() > 0 {
            if let Some(stall) = self.diagnostics().stall() {
                warn!("{}", stall);
            }
            return Ok(false);
        }

        let Some(selected) = view.select(self.expect as usize) else {
            match self.diagnostics().stall() {
                Some(stall) => info!("{}", stall),
                None => debug!(
                    "Waiting for servers: {} of {} expected",
                    view.candidates.len(),
                    self.expect
                ),
            }
            return Ok(false);
        };

        if !selected.iter().any(|c| c.id == self.local.id) {
            info!(
                "{} servers visible but {} is not among the {} selected, waiting to be added",
                view.candidates.len(),
                self.local.id,
                self.expect
            );
            return Ok(false);
        }

        let peers: Vec<PeerAddress> = selected.iter().map(|c| c.addr.clone()).collect();
        info!(?peers, "Bootstrapping consensus group with {} servers", peers.len());

        match tokio::time::timeout(self.write_timeout, self.peer_set.bootstrap(&peers)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                let err = Error::from_peer_set("writing initial configuration", e);
                if !err.is_bootstrap_race() {
                    return Err(self.write_failed(Error::with_source(
                        ErrorKind::BootstrapWrite,
                        "writing initial configuration",
                        err,
                    )));
                }

                info!("{}; adopting the existing group", err);
                match self.read_configuration().await {
                    Ok(config) => debug!("Adopted configuration with {} peers", config.len()),
                    Err(e) => debug!("Configuration not yet replicated here: {}", e),
                }
                Ok(true)
            }
            Err(_) => Err(self.write_failed(Error::timeout(format!(
                "bootstrap write did not complete within {:?}",
                self.write_timeout
            )))),
        }
    }

    /// Leader-only steady-state pass.
    async fn reconcile_members(&self) -> CoordinatorResult<()> {
        self.collect_departures();

        if !self.is_leader().await {
            let dropped = std::mem::take(&mut *self.pending_removals.lock());
            if !dropped.is_empty() {
                debug!("Not the leader, dropping {} pending removals", dropped.len());
            }
            return Ok(());
        }

        let config = self.read_configuration().await?;
        let view = self
            .registry
            .bootstrap_view(&self.local, &self.local_tags)
            .await;

        for server in &view.region_servers {
            if config.contains(&server.addr) {
                continue;
            }
            info!("Adding server {} ({}) to the consensus group", server.id, server.addr);
            match self.with_timeout(self.peer_set.add_peer(&server.addr)).await {
                Ok(()) => {}
                Err(e) if is_not_leader(&e) => {
                    debug!("Lost leadership while adding {}", server.addr);
                    self.pending_removals.lock().clear();
                    return Ok(());
                }
                Err(e) => error!("Failed to add {}: {}", server.addr, e),
            }
        }

        let removals: Vec<PeerAddress> = self.pending_removals.lock().iter().cloned().collect();
        for addr in removals {
            let rejoined = view.region_servers.iter().any(|s| s.addr == addr);
            if rejoined || !config.contains(&addr) {
                self.pending_removals.lock().remove(&addr);
                continue;
            }

            info!("Removing departed server {} from the consensus group", addr);
            match self.with_timeout(self.peer_set.remove_peer(&addr)).await {
                Ok(()) => {
                    self.pending_removals.lock().remove(&addr);
                }
                Err(e) if is_not_leader(&e) => {
                    debug!("Lost leadership while removing {}", addr);
                    self.pending_removals.lock().clear();
                    return Ok(());
                }
                Err(e) => warn!("Failed to remove {}, will retry: {}", addr, e),
            }
        }

        Ok(())
    }

    /// Leadership as reported by the engine; an engine that does not answer
    /// within the write timeout is treated as not leading.
    async fn is_leader(&self) -> bool {
        match tokio::time::timeout(self.write_timeout, self.peer_set.is_leader()).await {
            Ok(leader) => leader,
            Err(_) => {
                warn!(
                    "Leadership check did not complete within {:?}",
                    self.write_timeout
                );
                false
            }
        }
    }

    /// Read the configuration, bounded by the write timeout.
    pub(crate) async fn read_configuration(&self) -> CoordinatorResult<Configuration> {
        match tokio::time::timeout(self.write_timeout, self.peer_set.current_configuration()).await
        {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(e)) => Err(Error::from_peer_set("reading configuration", e)),
            Err(_) => Err(Error::timeout(format!(
                "configuration read did not complete within {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Address this server uses in the consensus configuration.
    pub fn local_address(&self) -> &PeerAddress {
        &self.local_addr
    }

    async fn with_timeout<F>(&self, op: F) -> Result<(), OpError<P::Error>>
    where
        F: Future<Output = Result<(), P::Error>>,
    {
        match tokio::time::timeout(self.write_timeout, op).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OpError::Engine(e)),
            Err(_) => Err(OpError::TimedOut(self.write_timeout)),
        }
    }

    fn collect_departures(&self) {
        let mut pending = self.pending_removals.lock();
        for addr in self.departures.try_iter() {
            pending.insert(addr);
        }
    }

    fn record_view(&self, view: &BootstrapView) {
        let mut diagnostics = self.diagnostics.lock();
        diagnostics.candidates_seen = view.candidates.len();
        diagnostics.mismatched_expect = view.mismatched_expect;
        diagnostics.competing_groups = view.competing_groups();
        diagnostics.inconsistent_tags = view.inconsistent_tags;
        diagnostics.incompatible_version = view.incompatible_version;
    }

    fn write_failed(&self, err: Error) -> Error {
        let delay = self.backoff.lock().record_failure();
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.write_failures = diagnostics.write_failures.saturating_add(1);
            diagnostics.last_error = Some(err.to_string());
        }
        warn!("{}; retrying in {:?}", err, delay);
        err
    }

    fn set_state(&self, next: ReconcilerState) {
        self.state.send_if_modified(|state| {
            // Bootstrapped is terminal
            if *state == next || *state == ReconcilerState::Bootstrapped {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Failure of a leader-mediated membership change.
#[derive(Debug, thiserror::Error)]
enum OpError<E: PeerSetAdaptorError> {
    #[error("{0}")]
    Engine(E),
    #[error("no answer within {0:?}")]
    TimedOut(Duration),
}

fn is_not_leader<E: PeerSetAdaptorError>(err: &OpError<E>) -> bool {
    matches!(err, OpError::Engine(e) if e.kind() == PeerSetErrorKind::NotLeader)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use muster_gossip::MemberEvent;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Debug, thiserror::Error)]
    #[error("fake engine error: {0:?}")]
    struct FakeError(PeerSetErrorKind);

    impl PeerSetAdaptorError for FakeError {
        fn kind(&self) -> PeerSetErrorKind {
            self.0
        }
    }

    /// Single-node engine that records what it was asked to do.
    #[derive(Default)]
    struct FakeEngine {
        config: Mutex<Configuration>,
        bootstraps: AtomicUsize,
        fail_bootstrap: Mutex<Option<PeerSetErrorKind>>,
        delay: Option<Duration>,
        unresponsive_leader: bool,
    }

    #[async_trait]
    impl PeerSetAdaptor for FakeEngine {
        type Error = FakeError;

        fn local_address(&self) -> PeerAddress {
            PeerAddress::parse("10.0.0.1:7001").unwrap()
        }

        async fn current_configuration(&self) -> Result<Configuration, FakeError> {
            Ok(self.config.lock().clone())
        }

        async fn bootstrap(&self, peers: &[PeerAddress]) -> Result<(), FakeError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(kind) = self.fail_bootstrap.lock().take() {
                return Err(FakeError(kind));
            }
            self.bootstraps.fetch_add(1, Ordering::SeqCst);
            *self.config.lock() = Configuration::new(peers.iter().cloned());
            Ok(())
        }

        async fn add_peer(&self, addr: &PeerAddress) -> Result<(), FakeError> {
            self.config.lock().peers.insert(addr.clone());
            Ok(())
        }

        async fn remove_peer(&self, addr: &PeerAddress) -> Result<(), FakeError> {
            self.config.lock().peers.remove(addr);
            Ok(())
        }

        async fn is_leader(&self) -> bool {
            if self.unresponsive_leader {
                return futures::future::pending().await;
            }
            self.config.lock().is_bootstrapped()
        }
    }

    fn addr(id: usize) -> PeerAddress {
        PeerAddress::parse(format!("10.0.0.{id}:7001")).unwrap()
    }

    fn server(id: usize, expect: u32) -> Member {
        Member::new(
            format!("node-{id}"),
            format!("10.0.0.{id}:4648"),
            ServerTags::new("global", expect, 7001).to_tags(),
        )
    }

    fn reconciler(
        expect: u32,
        engine: FakeEngine,
    ) -> (Arc<Reconciler<FakeEngine>>, Arc<PeerRegistry>) {
        let config = CoordinatorConfig {
            node_name: "node-1".to_string(),
            bootstrap_expect: expect,
            ..CoordinatorConfig::default()
        };
        let local = server(1, expect);
        let tags = local.server_tags().unwrap();
        let registry = Arc::new(PeerRegistry::new());
        let (_tx, rx) = flume::bounded(16);
        let reconciler = Reconciler::new(
            &config,
            local,
            tags,
            registry.clone(),
            Arc::new(engine),
            rx,
        );
        (Arc::new(reconciler), registry)
    }

    #[tokio::test]
    async fn expect_zero_never_bootstraps() {
        let (reconciler, _) = reconciler(0, FakeEngine::default());

        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expect_zero_adopts_existing_configuration() {
        let engine = FakeEngine::default();
        *engine.config.lock() = Configuration::new([addr(1)]);
        let (reconciler, registry) = reconciler(0, engine);
        registry.apply(MemberEvent::Joined(server(2, 0))).await;

        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Bootstrapped);
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 0);
        // As leader it grows the group even though it never bootstraps
        let config = reconciler.peer_set.config.lock().clone();
        assert!(config.contains(&addr(2)));
    }

    #[tokio::test]
    async fn stopped_reconciler_ignores_triggers() {
        let (reconciler, _) = reconciler(1, FakeEngine::default());

        reconciler.stop();
        reconciler.trigger().await;

        assert!(reconciler.is_stopped());
        assert_eq!(reconciler.diagnostics().evaluations, 0);
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 0);
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_leadership_check_is_bounded() {
        let engine = FakeEngine {
            unresponsive_leader: true,
            ..FakeEngine::default()
        };
        *engine.config.lock() = Configuration::new([addr(1)]);
        let (reconciler, registry) = reconciler(1, engine);
        registry.apply(MemberEvent::Joined(server(2, 1))).await;

        reconciler.trigger().await;
        // The guard was released, so a second trigger evaluates again
        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Bootstrapped);
        assert_eq!(reconciler.diagnostics().evaluations, 2);
        assert_eq!(reconciler.peer_set.config.lock().len(), 1);
    }

    #[tokio::test]
    async fn waits_for_threshold_then_bootstraps_once() {
        let (reconciler, registry) = reconciler(2, FakeEngine::default());

        reconciler.trigger().await;
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        assert_eq!(reconciler.diagnostics().candidates_seen, 1);

        registry.apply(MemberEvent::Joined(server(2, 2))).await;
        reconciler.trigger().await;
        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Bootstrapped);
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 1);
        let config = reconciler.peer_set.config.lock().clone();
        assert_eq!(config.len(), 2);
    }

    #[tokio::test]
    async fn not_selected_does_not_write() {
        let (reconciler, registry) = reconciler(1, FakeEngine::default());
        // node-0 sorts before node-1 and takes the only slot
        registry.apply(MemberEvent::Joined(server(0, 1))).await;

        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn race_is_adopted_without_retry() {
        let engine = FakeEngine::default();
        *engine.fail_bootstrap.lock() = Some(PeerSetErrorKind::AlreadyBootstrapped);
        let (reconciler, _) = reconciler(1, engine);

        reconciler.trigger().await;

        assert_eq!(reconciler.state(), ReconcilerState::Bootstrapped);
        let diagnostics = reconciler.diagnostics();
        assert_eq!(diagnostics.write_failures, 0);
        assert!(diagnostics.last_error.is_none());
        assert!(logs_contain("adopting the existing group"));
    }

    #[tokio::test]
    async fn storage_fault_backs_off() {
        let engine = FakeEngine::default();
        *engine.fail_bootstrap.lock() = Some(PeerSetErrorKind::Storage);
        let (reconciler, _) = reconciler(1, engine);

        reconciler.trigger().await;
        assert_eq!(reconciler.state(), ReconcilerState::Idle);
        let diagnostics = reconciler.diagnostics();
        assert_eq!(diagnostics.write_failures, 1);
        assert!(diagnostics.last_error.unwrap().contains("Bootstrap write error"));

        // Still inside the backoff window: no attempt
        reconciler.trigger().await;
        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 0);
        assert!(reconciler.backoff.lock().retry_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_coalesce() {
        let engine = FakeEngine {
            delay: Some(Duration::from_millis(100)),
            ..FakeEngine::default()
        };
        let (reconciler, _) = reconciler(1, engine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.trigger().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(reconciler.peer_set.bootstraps.load(Ordering::SeqCst), 1);
        assert!(reconciler.diagnostics().evaluations <= 2);
    }
}
