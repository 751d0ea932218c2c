//! # Iterative Lookup Engine
//!
//! The α-parallel, partial-failure-tolerant search for the peers closest to
//! a target id.
//!
//! ## Lifecycle
//!
//! A lookup is configured through [`LookupBuilder`] and started with
//! [`LookupBuilder::commit`], which spawns one task that owns the whole
//! lookup state. The state moves `Pending → Fulfilled` when the exact
//! target is confirmed, or `Pending → Expired` on stall, deadline, empty
//! seed set, or cancellation. Both transitions are terminal and fire exactly
//! one of the `on_success` / `on_failure` callbacks.
//!
//! ## Round Protocol (recursive form)
//!
//! 1. Seed with the closest `k` peers the routing table knows.
//! 2. Pick up to α un-queried peers, preferring ones strictly closer to the
//!    target than anything queried so far (ties broken by lowest id).
//! 3. Dispatch `find_node` to each with a per-query timeout; responders move
//!    to `fulfilled`, timeouts are accounted for the same way.
//! 4. Merge every returned peer into `discovered` and into the routing
//!    table. A returned peer with the target id fulfills the lookup and
//!    preempts the rest of the round.
//! 5. Continue while the best distance among un-queried discoveries strictly
//!    improves; otherwise expire.
//!
//! Non-recursive lookups run exactly one round against the seeds.
//!
//! ## Concurrency
//!
//! Responses reach the task through the [`PeerRpc`] futures it awaits; a
//! global deadline arm preempts whatever round is in flight. Observers read
//! consistent snapshots over a watch channel, so no lock is ever shared with
//! the hot path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::identity::NodeId;
use crate::protocols::PeerRpc;
use crate::routing::{announce_with_eviction, Peer, RoutingHandle};

/// Default wall-clock budget for a lookup.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(10);

/// Default per-query timeout; one slow peer costs at most this much of a
/// round.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Status & Error
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStatus {
    Pending,
    Fulfilled,
    Expired,
}

/// Why a lookup expired. Never surfaced as a `Result` (lookups always
/// resolve through their callbacks) but recorded in the snapshot for
/// diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// Deadline hit, or progress stalled with every query accounted for.
    Timeout,
    /// The routing table had no peers to seed from.
    NoSeeds,
    /// Cancelled by the caller.
    Cancelled,
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::Timeout => write!(f, "lookup expired without locating the target"),
            LookupError::NoSeeds => write!(f, "routing table is empty, lookup cannot start"),
            LookupError::Cancelled => write!(f, "lookup cancelled"),
        }
    }
}

impl std::error::Error for LookupError {}

// ============================================================================
// Snapshot
// ============================================================================

/// Observable state of a lookup. `discovered` holds ids, not peer entries:
/// the routing table owns peers; resolve through it at use time.
#[derive(Clone, Debug)]
pub struct LookupSnapshot {
    pub id: Uuid,
    pub target: NodeId,
    pub status: LookupStatus,
    pub failure: Option<LookupError>,
    pub queried: HashSet<NodeId>,
    pub outstanding: HashSet<NodeId>,
    pub fulfilled: HashSet<NodeId>,
    pub discovered: HashSet<NodeId>,
    pub target_found: Option<Peer>,
    pub query_ts: Instant,
    pub expiration_ts: Instant,
}

// ============================================================================
// Builder
// ============================================================================

pub type SuccessCallback = Box<dyn FnOnce(Peer) + Send + 'static>;
pub type FailureCallback = Box<dyn FnOnce() + Send + 'static>;

/// Tuning shared by every lookup a node issues.
#[derive(Clone, Copy, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
}

impl Default for LookupParams {
    fn default() -> Self {
        Self {
            k: crate::routing::DEFAULT_K,
            alpha: crate::routing::DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

enum Expiry {
    After(Duration),
    At(Instant),
}

/// Configures one lookup; consumed by [`LookupBuilder::commit`].
pub struct LookupBuilder {
    routing: RoutingHandle,
    rpc: Arc<dyn PeerRpc>,
    params: LookupParams,
    target: NodeId,
    recursive: bool,
    expiry: Expiry,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl LookupBuilder {
    pub fn new(
        routing: RoutingHandle,
        rpc: Arc<dyn PeerRpc>,
        params: LookupParams,
        target: NodeId,
    ) -> Self {
        Self {
            routing,
            rpc,
            params,
            target,
            recursive: false,
            expiry: Expiry::After(DEFAULT_EXPIRATION),
            on_success: None,
            on_failure: None,
        }
    }

    /// Keep polling newly discovered closer peers until progress stalls.
    pub fn recursive(mut self, value: bool) -> Self {
        self.recursive = value;
        self
    }

    /// Wall-clock budget, relative to commit.
    pub fn expiration(mut self, duration: Duration) -> Self {
        self.expiry = Expiry::After(duration);
        self
    }

    /// Absolute deadline.
    pub fn expiration_at(mut self, instant: Instant) -> Self {
        self.expiry = Expiry::At(instant);
        self
    }

    /// Invoked at most once, when the exact target is confirmed.
    pub fn on_success(mut self, callback: impl FnOnce(Peer) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Invoked at most once, on expiry without success.
    pub fn on_failure(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Start the lookup. The returned handle observes progress, awaits the
    /// terminal state, and cancels.
    pub fn commit(self) -> LookupHandle {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let deadline = match self.expiry {
            Expiry::After(duration) => now + duration,
            Expiry::At(instant) => instant,
        };

        let snapshot = LookupSnapshot {
            id,
            target: self.target,
            status: LookupStatus::Pending,
            failure: None,
            queried: HashSet::new(),
            outstanding: HashSet::new(),
            fulfilled: HashSet::new(),
            discovered: HashSet::new(),
            target_found: None,
            query_ts: now,
            expiration_ts: deadline,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        let task = LookupTask {
            id,
            target: self.target,
            recursive: self.recursive,
            deadline,
            params: self.params,
            routing: self.routing,
            rpc: self.rpc,
            queried: HashSet::new(),
            outstanding: HashSet::new(),
            fulfilled: HashSet::new(),
            discovered: HashMap::new(),
            target_found: None,
            snapshot_tx,
            on_success: self.on_success,
            on_failure: self.on_failure,
        };
        tokio::spawn(task.run(cancel_rx));

        LookupHandle { id, target: self.target, snapshot: snapshot_rx, cancel: cancel_tx }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Caller's view of a committed lookup.
#[derive(Clone)]
pub struct LookupHandle {
    id: Uuid,
    target: NodeId,
    snapshot: watch::Receiver<LookupSnapshot>,
    cancel: mpsc::Sender<()>,
}

impl LookupHandle {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Current state; cheap, consistent copy.
    pub fn snapshot(&self) -> LookupSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Await the terminal state.
    pub async fn wait(&mut self) -> LookupSnapshot {
        loop {
            let current = self.snapshot.borrow().clone();
            if current.status != LookupStatus::Pending {
                return current;
            }
            if self.snapshot.changed().await.is_err() {
                return self.snapshot.borrow().clone();
            }
        }
    }

    /// Transition to Expired; outstanding requests are abandoned and
    /// `on_failure` fires unless the lookup already resolved. Cancelling a
    /// resolved lookup is a no-op.
    pub fn cancel(&self) {
        let _ = self.cancel.try_send(());
    }
}

impl std::fmt::Debug for LookupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}

// ============================================================================
// Task (owns the state machine)
// ============================================================================

#[derive(Clone, Copy)]
enum Outcome {
    Fulfilled,
    Stalled,
    NoSeeds,
    Deadline,
    Cancelled,
}

struct LookupTask {
    id: Uuid,
    target: NodeId,
    recursive: bool,
    deadline: Instant,
    params: LookupParams,
    routing: RoutingHandle,
    rpc: Arc<dyn PeerRpc>,
    queried: HashSet<NodeId>,
    outstanding: HashSet<NodeId>,
    fulfilled: HashSet<NodeId>,
    /// Un-evicted view of everything learned, keyed by id. The routing table
    /// remains the owner of record; this map only feeds candidate selection.
    discovered: HashMap<NodeId, Peer>,
    target_found: Option<Peer>,
    snapshot_tx: watch::Sender<LookupSnapshot>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl LookupTask {
    async fn run(mut self, mut cancel: mpsc::Receiver<()>) {
        let deadline = self.deadline;
        let outcome = tokio::select! {
            outcome = self.drive() => outcome,
            _ = sleep_until(deadline) => Outcome::Deadline,
            _ = cancel.recv() => Outcome::Cancelled,
        };
        self.finish(outcome);
    }

    async fn drive(&mut self) -> Outcome {
        // Fast path: the target is already in the table.
        if let Some(peer) = self.routing.get_node(&self.target).await {
            self.discovered.insert(peer.id(), peer.clone());
            self.target_found = Some(peer);
            return Outcome::Fulfilled;
        }

        let seeds = self.routing.closest_nodes(&self.target).await;
        if seeds.is_empty() {
            return Outcome::NoSeeds;
        }
        for seed in seeds {
            self.discovered.insert(seed.id(), seed);
        }
        self.publish();

        loop {
            let batch = self.select_candidates();
            if batch.is_empty() {
                return Outcome::Stalled;
            }

            let best_before = self.best_unqueried_distance();
            self.round(batch).await;

            if self.target_found.is_some() {
                return Outcome::Fulfilled;
            }
            if !self.recursive {
                return Outcome::Stalled;
            }
            let improved = match (self.best_unqueried_distance(), best_before) {
                (Some(now), Some(before)) => now < before,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !improved {
                trace!(lookup = %self.id, "no closer peers learned, expiring");
                return Outcome::Stalled;
            }
        }
    }

    /// Smallest distance to the target among discovered-but-unqueried peers.
    fn best_unqueried_distance(&self) -> Option<u32> {
        self.discovered
            .values()
            .filter(|peer| !self.queried.contains(&peer.id()))
            .map(|peer| peer.id().distance(&self.target))
            .min()
    }

    /// Up to α un-queried peers: those strictly closer than everything
    /// queried so far when any exist, otherwise the α closest remaining.
    /// Distance ties select the lowest numeric id.
    fn select_candidates(&self) -> Vec<Peer> {
        let mut unqueried: Vec<&Peer> = self
            .discovered
            .values()
            .filter(|peer| !self.queried.contains(&peer.id()))
            .collect();
        unqueried.sort_by_key(|peer| (peer.id().distance(&self.target), peer.id().as_u128()));

        let best_queried = self
            .queried
            .iter()
            .map(|id| id.distance(&self.target))
            .min();

        let closer: Vec<&Peer> = match best_queried {
            Some(best) => unqueried
                .iter()
                .copied()
                .filter(|peer| peer.id().distance(&self.target) < best)
                .collect(),
            None => Vec::new(),
        };

        let pool = if closer.is_empty() { unqueried } else { closer };
        pool.into_iter().take(self.params.alpha).cloned().collect()
    }

    /// One α-parallel round. Every dispatched peer ends up in `fulfilled`,
    /// by response or by timeout; discoveries are merged as they arrive.
    async fn round(&mut self, batch: Vec<Peer>) {
        let mut queries = JoinSet::new();
        for peer in batch {
            self.queried.insert(peer.id());
            self.outstanding.insert(peer.id());

            let rpc = self.rpc.clone();
            let lookup_id = self.id;
            let target = self.target;
            let query_timeout = self.params.query_timeout;
            queries.spawn(async move {
                let result = timeout(query_timeout, rpc.find_node(&peer, lookup_id, target)).await;
                (peer, result)
            });
        }
        self.publish();

        while let Some(joined) = queries.join_next().await {
            let (peer, result) = match joined {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            self.outstanding.remove(&peer.id());
            self.fulfilled.insert(peer.id());

            match result {
                Ok(Ok(found)) => {
                    self.merge_discoveries(found).await;
                }
                Ok(Err(error)) => {
                    debug!(lookup = %self.id, peer = %peer.id(), error = %error, "query failed");
                }
                Err(_) => {
                    trace!(lookup = %self.id, peer = %peer.id(), "query timed out");
                }
            }
            self.publish();

            if self.target_found.is_some() {
                // Success preempts the remainder of the round; outstanding
                // queries are abandoned with the JoinSet.
                queries.abort_all();
                for id in self.outstanding.drain() {
                    self.fulfilled.insert(id);
                }
                self.publish();
                return;
            }
        }
    }

    async fn merge_discoveries(&mut self, found: Vec<Peer>) {
        let local_id = self.routing.local_id();
        for peer in found {
            if peer.id() == local_id {
                continue;
            }
            announce_with_eviction(&self.routing, &self.rpc, peer.clone(), self.params.query_timeout)
                .await;
            if peer.id() == self.target && self.target_found.is_none() {
                self.target_found = Some(peer.clone());
            }
            self.discovered.entry(peer.id()).or_insert(peer);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.queried = self.queried.clone();
            snapshot.outstanding = self.outstanding.clone();
            snapshot.fulfilled = self.fulfilled.clone();
            snapshot.discovered = self.discovered.keys().copied().collect();
            snapshot.target_found = self.target_found.clone();
        });
    }

    fn finish(mut self, outcome: Outcome) {
        match outcome {
            Outcome::Fulfilled => {
                let peer = self
                    .target_found
                    .clone()
                    .expect("fulfilled outcome always carries the target peer");
                self.snapshot_tx.send_modify(|snapshot| {
                    snapshot.status = LookupStatus::Fulfilled;
                    snapshot.target_found = Some(peer.clone());
                    snapshot.discovered = self.discovered.keys().copied().collect();
                    snapshot.queried = self.queried.clone();
                    snapshot.outstanding.clear();
                    snapshot.fulfilled = self.fulfilled.clone();
                });
                debug!(lookup = %self.id, target = %self.target, "lookup fulfilled");
                if let Some(callback) = self.on_success.take() {
                    callback(peer);
                }
            }
            Outcome::Stalled | Outcome::NoSeeds | Outcome::Deadline | Outcome::Cancelled => {
                let failure = match outcome {
                    Outcome::NoSeeds => LookupError::NoSeeds,
                    Outcome::Cancelled => LookupError::Cancelled,
                    _ => LookupError::Timeout,
                };
                self.snapshot_tx.send_modify(|snapshot| {
                    snapshot.status = LookupStatus::Expired;
                    snapshot.failure = Some(failure);
                    snapshot.discovered = self.discovered.keys().copied().collect();
                    snapshot.queried = self.queried.clone();
                    snapshot.outstanding.clear();
                    snapshot.fulfilled = self.fulfilled.clone();
                });
                debug!(
                    lookup = %self.id,
                    target = %self.target,
                    reason = %failure,
                    discovered = self.discovered.len(),
                    "lookup expired"
                );
                if let Some(callback) = self.on_failure.take() {
                    callback();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, MIN_KEY_BITS};
    use crate::routing::DEFAULT_ALPHA;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory network: per-peer canned `find_node` answers, with optional
    /// per-peer delays and a log of who was queried.
    struct FakeRpc {
        responses: Mutex<HashMap<NodeId, Vec<Peer>>>,
        delays: Mutex<HashMap<NodeId, Duration>>,
        queried: Mutex<Vec<NodeId>>,
    }

    impl FakeRpc {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                queried: Mutex::new(Vec::new()),
            })
        }

        fn respond(&self, peer: NodeId, found: Vec<Peer>) {
            self.responses.lock().unwrap().insert(peer, found);
        }

        fn delay(&self, peer: NodeId, duration: Duration) {
            self.delays.lock().unwrap().insert(peer, duration);
        }

        fn queried(&self) -> Vec<NodeId> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerRpc for FakeRpc {
        async fn find_node(
            &self,
            to: &Peer,
            _lookup_id: Uuid,
            _target: NodeId,
        ) -> anyhow::Result<Vec<Peer>> {
            self.queried.lock().unwrap().push(to.id());
            let delay = self.delays.lock().unwrap().get(&to.id()).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let response = self.responses.lock().unwrap().get(&to.id()).cloned();
            response.ok_or_else(|| anyhow!("peer unreachable"))
        }

        async fn ping(&self, _to: &Peer) -> anyhow::Result<()> {
            Ok(())
        }

        async fn request_address(&self, _to: &Peer) -> anyhow::Result<std::net::SocketAddr> {
            Err(anyhow!("not supported"))
        }
    }

    fn peer(id: u128) -> Peer {
        // One shared key template keeps test setup fast; distance logic
        // never consults the key.
        use std::sync::OnceLock;
        static TEMPLATE: OnceLock<Keypair> = OnceLock::new();
        let keypair = TEMPLATE
            .get_or_init(|| Keypair::generate_with_bits(MIN_KEY_BITS).expect("keypair"));
        Peer::new(keypair.public_key().clone(), None).with_forced_id(NodeId::from_u128(id))
    }

    fn params() -> LookupParams {
        LookupParams {
            k: 20,
            alpha: DEFAULT_ALPHA,
            query_timeout: Duration::from_millis(200),
        }
    }

    async fn seeded_routing(local: u128, seeds: &[u128]) -> RoutingHandle {
        let routing = RoutingHandle::spawn(NodeId::from_u128(local), 20, DEFAULT_ALPHA);
        for &id in seeds {
            assert!(routing.announce(peer(id)).await.is_none());
        }
        routing
    }

    #[tokio::test]
    async fn target_already_in_table_fulfills_immediately() {
        let target = 0x77u128;
        let routing = seeded_routing(0x1, &[target, 0x99]).await;
        let rpc = FakeRpc::new();

        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let hits_cb = hits.clone();
        let misses_cb = misses.clone();

        let mut handle =
            LookupBuilder::new(routing, rpc, params(), NodeId::from_u128(target))
                .on_success(move |peer| {
                    assert_eq!(peer.id().as_u128(), target);
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                })
                .on_failure(move || {
                    misses_cb.fetch_add(1, Ordering::SeqCst);
                })
                .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Fulfilled);
        assert_eq!(snapshot.target_found.as_ref().unwrap().id().as_u128(), target);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cold_start_expires_with_no_seeds() {
        let routing = RoutingHandle::spawn(NodeId::from_u128(0x1), 20, DEFAULT_ALPHA);
        let rpc = FakeRpc::new();

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_cb = failures.clone();

        let mut handle = LookupBuilder::new(routing, rpc, params(), NodeId::from_u128(0xAB))
            .on_failure(move || {
                failures_cb.fetch_add(1, Ordering::SeqCst);
            })
            .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert_eq!(snapshot.failure, Some(LookupError::NoSeeds));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recursive_lookup_finds_target_through_referrals() {
        // local knows A; A knows B; B knows the target.
        let local = 0x1u128;
        let a = 0xF000;
        let b = 0xF00;
        let target = 0xF1;

        let routing = seeded_routing(local, &[a]).await;
        let rpc = FakeRpc::new();
        rpc.respond(NodeId::from_u128(a), vec![peer(b)]);
        rpc.respond(NodeId::from_u128(b), vec![peer(target)]);

        let mut handle = LookupBuilder::new(
            routing.clone(),
            rpc.clone(),
            params(),
            NodeId::from_u128(target),
        )
        .recursive(true)
        .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Fulfilled);
        assert_eq!(snapshot.target_found.unwrap().id().as_u128(), target);
        assert_eq!(rpc.queried(), vec![NodeId::from_u128(a), NodeId::from_u128(b)]);

        // Discoveries were merged into the routing table along the way.
        assert!(routing.get_node(&NodeId::from_u128(b)).await.is_some());
        assert!(routing.get_node(&NodeId::from_u128(target)).await.is_some());
    }

    #[tokio::test]
    async fn recursive_lookup_expires_when_progress_stalls() {
        // Seeds sit at distance 10 from the target; round one discovers
        // distance-6 peers, round two returns more distance-6 peers. No
        // strict improvement, so the lookup expires with the union of all
        // learned peers in `discovered`.
        let target = 0x1000u128;
        let seed1 = target ^ 0x200;
        let seed2 = target ^ 0x201;
        let hop1 = target ^ 0x20;
        let hop2 = target ^ 0x21;
        let hop3 = target ^ 0x22;
        let hop4 = target ^ 0x23;

        let routing = seeded_routing(0x1, &[seed1, seed2]).await;
        let rpc = FakeRpc::new();
        rpc.respond(NodeId::from_u128(seed1), vec![peer(hop1), peer(hop2)]);
        rpc.respond(NodeId::from_u128(seed2), vec![peer(hop1)]);
        rpc.respond(NodeId::from_u128(hop1), vec![peer(hop3)]);
        rpc.respond(NodeId::from_u128(hop2), vec![peer(hop4)]);
        rpc.respond(NodeId::from_u128(hop3), vec![]);
        rpc.respond(NodeId::from_u128(hop4), vec![]);

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_cb = failures.clone();

        let mut handle =
            LookupBuilder::new(routing, rpc, params(), NodeId::from_u128(target))
                .recursive(true)
                .on_failure(move || {
                    failures_cb.fetch_add(1, Ordering::SeqCst);
                })
                .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert_eq!(snapshot.failure, Some(LookupError::Timeout));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        for id in [seed1, seed2, hop1, hop2] {
            assert!(
                snapshot.discovered.contains(&NodeId::from_u128(id)),
                "discovered must contain {:x}",
                id
            );
        }
        // The distance-6 peers were queried once each, set semantics.
        let queried = snapshot.queried;
        assert!(queried.contains(&NodeId::from_u128(hop1)));
        assert!(queried.contains(&NodeId::from_u128(hop2)));
    }

    #[tokio::test]
    async fn non_recursive_runs_exactly_one_round() {
        let target = 0x4000u128;
        let seeds: Vec<u128> = (0..6).map(|i| target ^ (0x100 + i)).collect();
        let routing = seeded_routing(0x1, &seeds).await;

        let rpc = FakeRpc::new();
        for &seed in &seeds {
            // Referrals closer than any seed; a recursive lookup would chase
            // them, a non-recursive one must not.
            rpc.respond(NodeId::from_u128(seed), vec![peer(target ^ 0x10)]);
        }
        rpc.respond(NodeId::from_u128(target ^ 0x10), vec![peer(target)]);

        let mut handle =
            LookupBuilder::new(routing, rpc.clone(), params(), NodeId::from_u128(target))
                .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert_eq!(
            rpc.queried().len(),
            DEFAULT_ALPHA,
            "one round of alpha queries, no recursion"
        );
        assert!(snapshot.discovered.contains(&NodeId::from_u128(target ^ 0x10)));
    }

    #[tokio::test]
    async fn slow_peer_is_accounted_for_by_query_timeout() {
        let target = 0x4000u128;
        let fast = target ^ 0x101;
        let slow = target ^ 0x102;

        let routing = seeded_routing(0x1, &[fast, slow]).await;
        let rpc = FakeRpc::new();
        rpc.respond(NodeId::from_u128(fast), vec![]);
        rpc.respond(NodeId::from_u128(slow), vec![peer(target)]);
        rpc.delay(NodeId::from_u128(slow), Duration::from_secs(5));

        let mut handle =
            LookupBuilder::new(routing, rpc, params(), NodeId::from_u128(target)).commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert!(snapshot.fulfilled.contains(&NodeId::from_u128(slow)), "timeout accounted for");
        assert!(snapshot.outstanding.is_empty());
        assert!(
            snapshot.target_found.is_none(),
            "slow answer arrived after the per-query timeout"
        );
    }

    #[tokio::test]
    async fn global_deadline_preempts_a_hung_round() {
        let target = 0x4000u128;
        let seed = target ^ 0x100;
        let routing = seeded_routing(0x1, &[seed]).await;

        let rpc = FakeRpc::new();
        rpc.respond(NodeId::from_u128(seed), vec![peer(target ^ 0x10)]);
        rpc.delay(NodeId::from_u128(seed), Duration::from_secs(30));

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_cb = failures.clone();

        let mut handle = LookupBuilder::new(
            routing,
            rpc,
            LookupParams { query_timeout: Duration::from_secs(60), ..params() },
            NodeId::from_u128(target),
        )
        .expiration(Duration::from_millis(100))
        .on_failure(move || {
            failures_cb.fetch_add(1, Ordering::SeqCst);
        })
        .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert_eq!(snapshot.failure, Some(LookupError::Timeout));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_expires_and_fires_failure_once() {
        let target = 0x4000u128;
        let seed = target ^ 0x100;
        let routing = seeded_routing(0x1, &[seed]).await;

        let rpc = FakeRpc::new();
        rpc.delay(NodeId::from_u128(seed), Duration::from_secs(30));
        rpc.respond(NodeId::from_u128(seed), vec![]);

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_cb = failures.clone();

        let mut handle = LookupBuilder::new(
            routing,
            rpc,
            LookupParams { query_timeout: Duration::from_secs(60), ..params() },
            NodeId::from_u128(target),
        )
        .recursive(true)
        .expiration(Duration::from_secs(60))
        .on_failure(move || {
            failures_cb.fetch_add(1, Ordering::SeqCst);
        })
        .commit();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        handle.cancel(); // second cancel is a no-op

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Expired);
        assert_eq!(snapshot.failure, Some(LookupError::Cancelled));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ties_select_lowest_numeric_id() {
        // Two seeds at the same distance from the target; with alpha = 1
        // the engine must query the numerically lower id first.
        let target = 0x4000u128;
        let low = target ^ 0x100; // 0x4100
        let high = target ^ 0x101; // 0x4101, same distance (bit 9)
        assert_eq!(
            NodeId::from_u128(low).distance(&NodeId::from_u128(target)),
            NodeId::from_u128(high).distance(&NodeId::from_u128(target))
        );

        let routing = seeded_routing(0x1, &[high, low]).await;
        let rpc = FakeRpc::new();
        rpc.respond(NodeId::from_u128(low), vec![peer(target)]);
        rpc.respond(NodeId::from_u128(high), vec![]);

        let mut handle = LookupBuilder::new(
            routing,
            rpc.clone(),
            LookupParams { alpha: 1, ..params() },
            NodeId::from_u128(target),
        )
        .recursive(true)
        .commit();

        let snapshot = handle.wait().await;
        assert_eq!(snapshot.status, LookupStatus::Fulfilled);
        assert_eq!(rpc.queried()[0], NodeId::from_u128(low.min(high)));
    }
}
