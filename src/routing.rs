//! # XOR-Metric Routing Table
//!
//! The registry of known remote peers, bucketed by XOR distance from the
//! local id.
//!
//! ## Bucket Model
//!
//! 128 buckets indexed by distance `d ∈ [1, 128]` (distance 0 is the local
//! node itself and never enters the table). Each bucket holds at most `k`
//! peers ordered least-recently-seen first, so the head is always the next
//! eviction candidate.
//!
//! ## Replacement Policy
//!
//! A full bucket never accepts a newcomer outright. The caller receives a
//! [`PendingEviction`] naming the current head; it pings the head and reports
//! back. A live head keeps its seat (moved to tail) and the newcomer is
//! discarded; a dead head is evicted and the newcomer appended. Long-lived
//! peers therefore accumulate, which is the classic defense against
//! churn-based table poisoning.
//!
//! ## Actor Architecture
//!
//! - [`RoutingHandle`]: cheap-to-clone public handle
//! - `RoutingActor`: owns every bucket and the id index, processes commands
//!   sequentially over an async channel
//!
//! All mutations are linearized by the actor, which is what makes the
//! per-bucket ordering guarantees trivial; the eviction ping happens outside
//! the actor so no await point ever holds table state.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{NodeId, PeerEnvelope, PublicKey};
use crate::packet::PeerRecord;

/// Bucket capacity (the Kademlia replication parameter).
pub const DEFAULT_K: usize = 20;

/// Lookup concurrency factor; also bounds how many candidates
/// `closest_nodes` gathers before sorting (`alpha * k`).
pub const DEFAULT_ALPHA: usize = 3;

/// Number of distance buckets; ids are 128-bit.
pub const BUCKET_COUNT: usize = 128;

/// Command channel depth for the routing actor.
const COMMAND_BACKLOG: usize = 128;

// ============================================================================
// Peer
// ============================================================================

/// A remote node as the routing table knows it.
///
/// The id is always derived from the public key at construction; a peer can
/// never be created with a claimed id that disagrees with its key.
#[derive(Clone, Debug)]
pub struct Peer {
    id: NodeId,
    envelope: PeerEnvelope,
    /// Physical address, once disclosed. Addresses drift; the periodic ping
    /// clears entries that stop answering.
    pub address: Option<SocketAddr>,
    pub last_seen: Instant,
    pub directly_connected: bool,
    /// Crypto-blame counter: bad signatures and undecryptable payloads
    /// attributed to this peer.
    pub failures: u32,
}

impl Peer {
    pub fn new(public_key: PublicKey, address: Option<SocketAddr>) -> Self {
        Self {
            id: public_key.id(),
            envelope: PeerEnvelope::new(public_key),
            address,
            last_seen: Instant::now(),
            directly_connected: address.is_some(),
            failures: 0,
        }
    }

    pub fn from_record(record: &PeerRecord) -> Self {
        Self::new(record.public_key.clone(), record.address)
    }

    pub fn to_record(&self) -> PeerRecord {
        PeerRecord::new(self.envelope.public_key().clone(), self.address)
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        self.envelope.public_key()
    }

    /// Asymmetric operations against this peer (encrypt to it, verify its
    /// signatures).
    #[inline]
    pub fn envelope(&self) -> &PeerEnvelope {
        &self.envelope
    }

    pub fn fingerprint(&self) -> String {
        self.envelope.public_key().fingerprint()
    }

    /// Break the id/key binding for distance-shape tests. Distance logic
    /// never consults the key, so crafted ids exercise the same paths.
    #[cfg(test)]
    pub(crate) fn with_forced_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }
}

/// Announce a peer, resolving a full bucket's eviction question in the
/// background: the head is pinged with `ping_timeout`, and the verdict is
/// reported back to the table.
///
/// This is the one announce path everyone uses (lookup response merging,
/// inbound packet refreshes, bootstrap), so the replacement policy cannot
/// be bypassed.
pub async fn announce_with_eviction(
    routing: &RoutingHandle,
    rpc: &std::sync::Arc<dyn crate::protocols::PeerRpc>,
    peer: Peer,
    ping_timeout: std::time::Duration,
) {
    if let Some(pending) = routing.announce(peer).await {
        let routing = routing.clone();
        let rpc = rpc.clone();
        tokio::spawn(async move {
            let head_alive = tokio::time::timeout(ping_timeout, rpc.ping(&pending.head))
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);
            routing.apply_eviction(pending, head_alive).await;
        });
    }
}

// ============================================================================
// K-Bucket
// ============================================================================

/// Outcome of offering a peer to its bucket.
#[derive(Debug)]
enum TouchOutcome {
    Inserted,
    Refreshed,
    Full { head: Box<Peer>, candidate: Box<Peer> },
}

/// A full bucket's eviction question: ping `head`; if it answers, the
/// candidate is dropped, otherwise the head is. Resolved via
/// [`RoutingHandle::apply_eviction`].
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub distance: u32,
    pub head: Peer,
    pub candidate: Peer,
}

#[derive(Debug, Default)]
struct KBucket {
    /// Least-recently-seen first; the tail is the freshest entry.
    peers: Vec<Peer>,
}

impl KBucket {
    fn touch(&mut self, peer: Peer, k: usize) -> TouchOutcome {
        if let Some(pos) = self.peers.iter().position(|p| p.id == peer.id) {
            let mut existing = self.peers.remove(pos);
            existing.last_seen = peer.last_seen;
            if peer.address.is_some() {
                existing.address = peer.address;
            }
            existing.directly_connected |= peer.directly_connected;
            self.peers.push(existing);
            return TouchOutcome::Refreshed;
        }

        if self.peers.len() < k {
            self.peers.push(peer);
            TouchOutcome::Inserted
        } else {
            let head = self.peers[0].clone();
            TouchOutcome::Full { head: Box::new(head), candidate: Box::new(peer) }
        }
    }

    fn refresh(&mut self, id: &NodeId) {
        if let Some(pos) = self.peers.iter().position(|p| &p.id == id) {
            let peer = self.peers.remove(pos);
            self.peers.push(peer);
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| &p.id == id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }

    fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| &p.id == id)
    }
}

// ============================================================================
// Routing Table (actor-owned state)
// ============================================================================

/// The table proper. Owned by the actor at runtime; kept as a standalone
/// type so unit tests can drive it synchronously.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    local_id: NodeId,
    k: usize,
    alpha: usize,
    buckets: Vec<KBucket>,
    /// id → distance, the only table-wide index. Distance locates the
    /// bucket; the bucket scan is bounded by `k`.
    index: HashMap<NodeId, u32>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize, alpha: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(KBucket::default());
        }
        Self { local_id, k, alpha, buckets, index: HashMap::new() }
    }

    #[inline]
    fn bucket_of(&self, distance: u32) -> &KBucket {
        &self.buckets[(distance - 1) as usize]
    }

    #[inline]
    fn bucket_of_mut(&mut self, distance: u32) -> &mut KBucket {
        &mut self.buckets[(distance - 1) as usize]
    }

    /// Offer a peer to the table. `None` means the peer was inserted or
    /// refreshed; `Some` hands back the eviction question for a full bucket.
    pub fn announce(&mut self, peer: Peer) -> Option<PendingEviction> {
        if peer.id == self.local_id {
            return None;
        }
        let distance = self.local_id.distance(&peer.id);
        let k = self.k;
        match self.bucket_of_mut(distance).touch(peer, k) {
            TouchOutcome::Inserted => {
                trace!(distance, "peer inserted");
                self.reindex(distance);
                None
            }
            TouchOutcome::Refreshed => None,
            TouchOutcome::Full { head, candidate } => Some(PendingEviction {
                distance,
                head: *head,
                candidate: *candidate,
            }),
        }
    }

    fn reindex(&mut self, distance: u32) {
        let ids: Vec<NodeId> = self.bucket_of(distance).peers.iter().map(|p| p.id).collect();
        for id in ids {
            self.index.insert(id, distance);
        }
    }

    /// Resolve an eviction question with the head-ping verdict.
    ///
    /// Tolerates races: if the head has meanwhile left the bucket, or the
    /// candidate was admitted by another path, the call degrades to a
    /// refresh/no-op rather than double-inserting.
    pub fn apply_eviction(&mut self, pending: PendingEviction, head_alive: bool) {
        let k = self.k;
        let bucket = self.bucket_of_mut(pending.distance);
        if head_alive {
            bucket.refresh(&pending.head.id());
            debug!(
                distance = pending.distance,
                head = %pending.head.id(),
                "bucket full, head answered ping; candidate discarded"
            );
            return;
        }

        if bucket.remove(&pending.head.id()) {
            self.index.remove(&pending.head.id());
        }
        let bucket = self.bucket_of_mut(pending.distance);
        let candidate_id = pending.candidate.id();
        if bucket.get(&candidate_id).is_none() && bucket.peers.len() < k {
            bucket.peers.push(pending.candidate);
            self.index.insert(candidate_id, pending.distance);
            debug!(
                distance = pending.distance,
                evicted = %pending.head.id(),
                admitted = %candidate_id,
                "bucket head evicted after ping timeout"
            );
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Peer> {
        let distance = *self.index.get(id)?;
        self.bucket_of(distance).get(id)
    }

    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        let distance = *self.index.get(id)?;
        self.bucket_of_mut(distance).get_mut(id)
    }

    /// All peers at an exact distance.
    pub fn get_nodes(&self, distance: u32) -> Vec<Peer> {
        if distance == 0 || distance > BUCKET_COUNT as u32 {
            return Vec::new();
        }
        self.bucket_of(distance).peers.clone()
    }

    /// The closest `k` known peers to `target`.
    ///
    /// Walks buckets outward from `distance(local, target)` until `alpha * k`
    /// candidates are gathered or every bucket is exhausted, then sorts by
    /// distance to the target with the low-id tie-break.
    pub fn closest_nodes(&self, target: &NodeId) -> Vec<Peer> {
        let center = self.local_id.distance(target).clamp(1, BUCKET_COUNT as u32);
        let gather_cap = self.alpha * self.k;
        let mut candidates: Vec<Peer> = Vec::new();

        // Outward walk: center, center-1, center+1, center-2, ...
        candidates.extend(self.bucket_of(center).peers.iter().cloned());
        for offset in 1..BUCKET_COUNT as u32 {
            if candidates.len() >= gather_cap {
                break;
            }
            for distance in [center.checked_sub(offset), Some(center + offset)]
                .into_iter()
                .flatten()
            {
                if distance == 0 || distance > BUCKET_COUNT as u32 {
                    continue;
                }
                candidates.extend(self.bucket_of(distance).peers.iter().cloned());
            }
        }

        candidates.sort_by_key(|peer| (peer.id().distance(target), peer.id().as_u128()));
        candidates.truncate(self.k);
        candidates
    }

    /// Refresh a peer on valid inbound traffic: bump `last_seen` and move it
    /// to its bucket's tail.
    pub fn mark_seen(&mut self, id: &NodeId) {
        let Some(&distance) = self.index.get(id) else {
            return;
        };
        let bucket = self.bucket_of_mut(distance);
        if let Some(peer) = bucket.get_mut(id) {
            peer.last_seen = Instant::now();
        }
        bucket.refresh(id);
    }

    pub fn record_failure(&mut self, id: &NodeId) -> u32 {
        match self.get_node_mut(id) {
            Some(peer) => {
                peer.failures += 1;
                peer.failures
            }
            None => 0,
        }
    }

    /// Periodic-ping fallout: the peer stopped answering, so its address is
    /// no longer trusted and it is no longer directly connected.
    pub fn demote(&mut self, id: &NodeId) {
        if let Some(peer) = self.get_node_mut(id) {
            peer.address = None;
            peer.directly_connected = false;
        }
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.buckets.iter().flat_map(|b| b.peers.iter().cloned()).collect()
    }

    pub fn direct_peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .filter(|p| p.directly_connected && p.address.is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }
}

// ============================================================================
// Actor & Handle
// ============================================================================

enum Command {
    Announce(Box<Peer>, oneshot::Sender<Option<PendingEviction>>),
    ApplyEviction(Box<PendingEviction>, bool),
    GetNode(NodeId, oneshot::Sender<Option<Peer>>),
    GetNodes(u32, oneshot::Sender<Vec<Peer>>),
    ClosestNodes(NodeId, oneshot::Sender<Vec<Peer>>),
    MarkSeen(NodeId),
    RecordFailure(NodeId, oneshot::Sender<u32>),
    Demote(NodeId),
    AllPeers(oneshot::Sender<Vec<Peer>>),
    DirectPeers(oneshot::Sender<Vec<Peer>>),
    Len(oneshot::Sender<usize>),
}

struct RoutingActor {
    table: RoutingTable,
    commands: mpsc::Receiver<Command>,
}

impl RoutingActor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Announce(peer, reply) => {
                    let _ = reply.send(self.table.announce(*peer));
                }
                Command::ApplyEviction(pending, head_alive) => {
                    self.table.apply_eviction(*pending, head_alive);
                }
                Command::GetNode(id, reply) => {
                    let _ = reply.send(self.table.get_node(&id).cloned());
                }
                Command::GetNodes(distance, reply) => {
                    let _ = reply.send(self.table.get_nodes(distance));
                }
                Command::ClosestNodes(target, reply) => {
                    let _ = reply.send(self.table.closest_nodes(&target));
                }
                Command::MarkSeen(id) => self.table.mark_seen(&id),
                Command::RecordFailure(id, reply) => {
                    let _ = reply.send(self.table.record_failure(&id));
                }
                Command::Demote(id) => self.table.demote(&id),
                Command::AllPeers(reply) => {
                    let _ = reply.send(self.table.all_peers());
                }
                Command::DirectPeers(reply) => {
                    let _ = reply.send(self.table.direct_peers());
                }
                Command::Len(reply) => {
                    let _ = reply.send(self.table.len());
                }
            }
        }
    }
}

/// Public handle to the routing actor. Cloning is cheap; all clones talk to
/// the same table.
#[derive(Clone)]
pub struct RoutingHandle {
    commands: mpsc::Sender<Command>,
    local_id: NodeId,
}

impl RoutingHandle {
    /// Spawn the actor and return its handle.
    pub fn spawn(local_id: NodeId, k: usize, alpha: usize) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BACKLOG);
        let actor = RoutingActor { table: RoutingTable::new(local_id, k, alpha), commands: rx };
        tokio::spawn(actor.run());
        Self { commands: tx, local_id }
    }

    #[inline]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Offer a peer. A `Some` return is the caller's obligation to ping the
    /// bucket head and report via [`RoutingHandle::apply_eviction`].
    pub async fn announce(&self, peer: Peer) -> Option<PendingEviction> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Announce(Box::new(peer), tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn apply_eviction(&self, pending: PendingEviction, head_alive: bool) {
        let _ = self
            .commands
            .send(Command::ApplyEviction(Box::new(pending), head_alive))
            .await;
    }

    pub async fn get_node(&self, id: &NodeId) -> Option<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::GetNode(*id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn get_nodes(&self, distance: u32) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::GetNodes(distance, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn closest_nodes(&self, target: &NodeId) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ClosestNodes(*target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Refresh a peer that just produced valid inbound traffic.
    pub async fn mark_seen(&self, id: &NodeId) {
        let _ = self.commands.send(Command::MarkSeen(*id)).await;
    }

    /// Bump the crypto-blame counter; returns the new count (0 for unknown
    /// peers).
    pub async fn record_failure(&self, id: &NodeId) -> u32 {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::RecordFailure(*id, tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn demote(&self, id: &NodeId) {
        let _ = self.commands.send(Command::Demote(*id)).await;
    }

    pub async fn all_peers(&self) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::AllPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Peers with a disclosed address, the broadcast fan-out set.
    pub async fn direct_peers(&self) -> Vec<Peer> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::DirectPeers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl std::fmt::Debug for RoutingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingHandle")
            .field("local_id", &self.local_id)
            .finish()
    }
}
