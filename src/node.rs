//! # Node Facade
//!
//! [`WeftNode`] ties the layers together: frames arrive from the transport
//! binding via [`WeftNode::handle_datagram`], flow through the frame and
//! packet codecs, and are dispatched to the routing table, the lookup
//! correlation maps, or the broadcast fan-out. Outbound, the node implements
//! [`PeerRpc`] over the packet catalogue so the lookup engine never sees a
//! socket.
//!
//! ## Correlation
//!
//! Request/response kinds correlate by embedded ids: pongs echo the ping's
//! packet id, lookup replies carry the lookup id, address replies echo the
//! request's packet id. Pending waiters live in bounded maps and remove
//! themselves on completion or cancellation.
//!
//! ## Broadcast
//!
//! Broadcast packets fan out to every directly connected peer. Receivers
//! deduplicate on the packet UUID with a bounded LRU, clamp the TTL, handle
//! locally when addressed, and forward with the TTL decremented while it
//! stays above zero.
//!
//! ## Maintenance
//!
//! Every known peer with an address is pinged periodically; non-responders
//! are demoted (address cleared, no longer directly connected) so stale
//! addresses cannot linger in the table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::identity::{Keypair, NodeId};
use crate::lookup::{LookupBuilder, LookupParams, DEFAULT_QUERY_TIMEOUT};
use crate::packet::{
    AddressReplyPacket, AddressRequestPacket, AnnouncementPacket, BroadcastPacket, EnvelopePacket,
    HandshakePacket, LookupPacket, LookupReplyPacket, Packet, PeerRecord, PingPacket, PongPacket,
    DEFAULT_BROADCAST_TTL,
};
use crate::protocols::{PeerRpc, Transport, PROTOCOL_VERSION};
use crate::routing::{
    announce_with_eviction, Peer, RoutingHandle, DEFAULT_ALPHA, DEFAULT_K,
};
use crate::wire::{FrameCodec, PacketCodec, PacketRegistry};

/// Liveness ping cadence. Addresses drift; ten minutes bounds how stale a
/// "directly connected" claim can get.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(600);

/// Recent broadcast UUIDs remembered for loop suppression.
const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Per-source frame accumulators kept alive at once.
const MAX_SOURCES: usize = 256;

/// Sources we already warned about for malformed length prefixes.
const OVERFLOW_LOG_CAPACITY: usize = 128;

/// Depth of the sealed-payload delivery channel.
const ENVELOPE_BACKLOG: usize = 64;

/// A sealed payload addressed to this node, decrypted and ready for the
/// application. The sender is anonymous by construction.
#[derive(Debug)]
pub struct EnvelopeDelivery {
    pub payload: Vec<u8>,
}

// ============================================================================
// Builder
// ============================================================================

/// Configuration for a [`WeftNode`]. Follows the consume-on-build pattern:
/// every setter returns the builder, `build` produces the node.
pub struct NodeBuilder {
    keypair: Option<Keypair>,
    registry: Option<Arc<PacketRegistry>>,
    advertised_address: Option<SocketAddr>,
    k: usize,
    alpha: usize,
    query_timeout: Duration,
    ping_interval: Duration,
    max_broadcast_ttl: u16,
    dedup_capacity: usize,
    disclose_address: bool,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            keypair: None,
            registry: None,
            advertised_address: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_broadcast_ttl: DEFAULT_BROADCAST_TTL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            disclose_address: true,
        }
    }
}

impl NodeBuilder {
    /// Use an existing keypair instead of generating one at build time.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Replace the default packet registry, e.g. one extended with
    /// application kinds via [`PacketRegistry::builder_for`].
    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The address peers can reach this node on; disclosed in reply to
    /// address requests. Without one, address requests go unanswered.
    pub fn advertised_address(mut self, address: SocketAddr) -> Self {
        self.advertised_address = Some(address);
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Cap applied to the TTL of received broadcasts.
    pub fn max_broadcast_ttl(mut self, ttl: u16) -> Self {
        self.max_broadcast_ttl = ttl;
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity.max(1);
        self
    }

    /// Refuse to answer address requests (routing-only deployments).
    pub fn withhold_address(mut self) -> Self {
        self.disclose_address = false;
        self
    }

    /// Build the node, spawning its routing actor and maintenance task.
    /// Must run inside a Tokio runtime.
    pub fn build(self, transport: Arc<dyn Transport>) -> Result<WeftNode> {
        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None => Keypair::generate().context("keypair generation failed")?,
        };
        let registry = self.registry.unwrap_or_else(PacketRegistry::with_defaults);
        let routing = RoutingHandle::spawn(keypair.id(), self.k, self.alpha);
        let (envelope_tx, envelope_rx) = mpsc::channel(ENVELOPE_BACKLOG);

        let node = WeftNode {
            inner: Arc::new(Inner {
                keypair,
                routing,
                codec: PacketCodec::new(registry),
                transport,
                params: LookupParams {
                    k: self.k,
                    alpha: self.alpha,
                    query_timeout: self.query_timeout,
                },
                advertised_address: self.advertised_address,
                max_broadcast_ttl: self.max_broadcast_ttl,
                disclose_address: self.disclose_address,
                pending_pongs: Mutex::new(HashMap::new()),
                pending_lookups: Mutex::new(HashMap::new()),
                pending_addresses: Mutex::new(HashMap::new()),
                by_address: Mutex::new(HashMap::new()),
                seen_broadcasts: Mutex::new(LruCache::new(
                    NonZeroUsize::new(self.dedup_capacity).expect("capacity clamped to >= 1"),
                )),
                sources: Mutex::new(LruCache::new(
                    NonZeroUsize::new(MAX_SOURCES).expect("MAX_SOURCES is non-zero"),
                )),
                overflow_logged: Mutex::new(LruCache::new(
                    NonZeroUsize::new(OVERFLOW_LOG_CAPACITY)
                        .expect("OVERFLOW_LOG_CAPACITY is non-zero"),
                )),
                envelope_tx,
                envelope_rx_slot: Mutex::new(Some(envelope_rx)),
            }),
        };

        node.spawn_periodic_ping(self.ping_interval);
        info!(id = %node.id(), fingerprint = %node.fingerprint(), "node ready");
        Ok(node)
    }
}

// ============================================================================
// Node
// ============================================================================

struct Inner {
    keypair: Keypair,
    routing: RoutingHandle,
    codec: PacketCodec,
    transport: Arc<dyn Transport>,
    params: LookupParams,
    advertised_address: Option<SocketAddr>,
    max_broadcast_ttl: u16,
    disclose_address: bool,

    /// ping packet id → waiter.
    pending_pongs: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    /// (lookup id, responder id) → waiter.
    pending_lookups: Mutex<HashMap<(Uuid, NodeId), oneshot::Sender<Vec<PeerRecord>>>>,
    /// address-request packet id → waiter.
    pending_addresses: Mutex<HashMap<Uuid, oneshot::Sender<SocketAddr>>>,
    /// Last known id per source address, for attributing inbound traffic.
    by_address: Mutex<HashMap<SocketAddr, NodeId>>,

    seen_broadcasts: Mutex<LruCache<Uuid, ()>>,
    /// Per-source frame accumulators; frames may split across datagrams.
    sources: Mutex<LruCache<SocketAddr, FrameCodec>>,
    /// Sources already blamed for a poisoned length prefix, to log once.
    overflow_logged: Mutex<LruCache<SocketAddr, ()>>,

    envelope_tx: mpsc::Sender<EnvelopeDelivery>,
    envelope_rx_slot: Mutex<Option<mpsc::Receiver<EnvelopeDelivery>>>,
}

/// The local node. Cheap to clone; all clones share one identity, routing
/// table, and transport.
#[derive(Clone)]
pub struct WeftNode {
    inner: Arc<Inner>,
}

impl WeftNode {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.inner.keypair.id()
    }

    pub fn fingerprint(&self) -> String {
        self.inner.keypair.fingerprint()
    }

    #[inline]
    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    #[inline]
    pub fn routing(&self) -> &RoutingHandle {
        &self.inner.routing
    }

    #[inline]
    pub fn registry(&self) -> &Arc<PacketRegistry> {
        self.inner.codec.registry()
    }

    /// Take the delivery channel for sealed payloads addressed to this node.
    /// Yields `None` after the first call.
    pub fn envelope_deliveries(&self) -> Option<mpsc::Receiver<EnvelopeDelivery>> {
        self.inner.envelope_rx_slot.lock().expect("mutex poisoned").take()
    }

    // ------------------------------------------------------------------
    // Outbound surface
    // ------------------------------------------------------------------

    /// Start configuring a lookup for `target`.
    pub fn lookup(&self, target: NodeId) -> LookupBuilder {
        LookupBuilder::new(
            self.inner.routing.clone(),
            Arc::new(self.clone()) as Arc<dyn PeerRpc>,
            self.inner.params,
            target,
        )
    }

    /// Introduce ourselves to a peer at a known address: handshake followed
    /// by our announcement. The usual first step after learning a bootstrap
    /// address.
    pub async fn introduce_to(&self, address: SocketAddr) -> Result<()> {
        let handshake = HandshakePacket::new(PROTOCOL_VERSION, self.fingerprint());
        self.send_packet(address, &handshake).await?;
        let announcement =
            AnnouncementPacket::new(PROTOCOL_VERSION, self.inner.keypair.public_key().clone());
        self.send_packet(address, &announcement).await
    }

    /// Seal `plaintext` to the peer owning `target` and flood it with the
    /// default TTL. The payload must fit one RSA block.
    pub async fn send_sealed(&self, target: &Peer, plaintext: &[u8]) -> Result<()> {
        let sealed = target
            .envelope()
            .encrypt(plaintext)
            .context("sealing payload to target key")?;
        let packet = EnvelopePacket::new(target.id(), sealed);
        self.broadcast(packet).await
    }

    /// Fan a broadcast packet out to every directly connected peer.
    pub async fn broadcast(&self, mut packet: impl BroadcastPacket) -> Result<()> {
        let ttl = packet.ttl().min(self.inner.max_broadcast_ttl);
        packet.set_ttl(ttl);

        // Remember our own id so an echo from a neighbor is not re-flooded.
        self.inner
            .seen_broadcasts
            .lock()
            .expect("mutex poisoned")
            .put(packet.id(), ());

        let peers = self.inner.routing.direct_peers().await;
        if peers.is_empty() {
            debug!(kind = packet.kind(), "broadcast with no directly connected peers");
            return Ok(());
        }
        for peer in peers {
            if let Some(address) = peer.address {
                if let Err(error) = self.send_packet(address, &packet).await {
                    debug!(peer = %peer.id(), error = %error, "broadcast leg failed");
                }
            }
        }
        Ok(())
    }

    async fn send_packet(&self, address: SocketAddr, packet: &dyn Packet) -> Result<()> {
        let body = self
            .inner
            .codec
            .encode(packet)
            .with_context(|| format!("encoding {:?}", packet.kind()))?;
        let frame = FrameCodec::encode(&body).context("framing packet")?;
        self.inner.transport.send(address, frame.into_vec()).await
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Entry point for the transport binding: all bytes received from `src`.
    ///
    /// Malformed frames are contained: a bad frame is dropped and its
    /// siblings still dispatch; a poisoned length prefix discards the
    /// source's accumulation buffer and is logged once per source.
    pub async fn handle_datagram(&self, src: SocketAddr, bytes: &[u8]) {
        let frames = {
            let mut sources = self.inner.sources.lock().expect("mutex poisoned");
            let codec = sources.get_or_insert_mut(src, FrameCodec::new);
            codec.decode(bytes)
        };

        let frames = match frames {
            Ok(frames) => frames,
            Err(error) => {
                let mut logged = self.inner.overflow_logged.lock().expect("mutex poisoned");
                if logged.put(src, ()).is_none() {
                    warn!(%src, %error, "dropping malformed frame stream");
                }
                return;
            }
        };

        for mut frame in frames {
            match self.inner.codec.decode(&mut frame) {
                Ok(packet) => self.dispatch(src, packet).await,
                Err(error) => {
                    debug!(%src, %error, "dropping undecodable frame");
                    // A peer shipping unparseable key material is suspect.
                    if matches!(error, crate::buffer::DecodeError::MalformedKey) {
                        if let Some(id) = self.peer_for(src) {
                            self.inner.routing.record_failure(&id).await;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, src: SocketAddr, packet: Box<dyn Packet>) {
        trace!(%src, kind = packet.kind(), id = %packet.id(), "packet received");
        if let Some(id) = self.peer_for(src) {
            self.inner.routing.mark_seen(&id).await;
        }

        let kind = packet.kind();
        if kind == HandshakePacket::KIND {
            if let Some(handshake) = packet.as_any().downcast_ref::<HandshakePacket>() {
                self.on_handshake(src, handshake).await;
            }
        } else if kind == AnnouncementPacket::KIND {
            if let Some(announcement) = packet.as_any().downcast_ref::<AnnouncementPacket>() {
                self.on_announcement(src, announcement).await;
            }
        } else if kind == PingPacket::KIND {
            let pong = PongPacket::new(packet.id());
            if let Err(error) = self.send_packet(src, &pong).await {
                debug!(%src, error = %error, "pong send failed");
            }
        } else if kind == PongPacket::KIND {
            if let Some(pong) = packet.as_any().downcast_ref::<PongPacket>() {
                let waiter = self
                    .inner
                    .pending_pongs
                    .lock()
                    .expect("mutex poisoned")
                    .remove(&pong.ping_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
        } else if kind == LookupPacket::KIND {
            if let Some(request) = packet.as_any().downcast_ref::<LookupPacket>() {
                self.on_lookup_request(src, request).await;
            }
        } else if kind == LookupReplyPacket::KIND {
            if let Some(reply) = packet.as_any().downcast_ref::<LookupReplyPacket>() {
                self.on_lookup_reply(src, reply).await;
            }
        } else if kind == AddressRequestPacket::KIND {
            if self.inner.disclose_address {
                if let Some(address) = self.inner.advertised_address {
                    let reply = AddressReplyPacket::new(packet.id(), address);
                    if let Err(error) = self.send_packet(src, &reply).await {
                        debug!(%src, error = %error, "address reply failed");
                    }
                }
            }
        } else if kind == AddressReplyPacket::KIND {
            if let Some(reply) = packet.as_any().downcast_ref::<AddressReplyPacket>() {
                let waiter = self
                    .inner
                    .pending_addresses
                    .lock()
                    .expect("mutex poisoned")
                    .remove(&reply.request_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(reply.address);
                }
            }
        } else if self.registry().is_broadcast(kind).unwrap_or(false) {
            self.on_broadcast(src, packet).await;
        } else {
            // Registered by an extension but not handled here; extension
            // traffic is outside the core dispatch.
            trace!(kind, "no core handler for packet kind");
        }
    }

    async fn on_handshake(&self, src: SocketAddr, handshake: &HandshakePacket) {
        if !handshake.version.is_compatible_with(&PROTOCOL_VERSION) {
            warn!(
                %src,
                theirs = %handshake.version,
                ours = %PROTOCOL_VERSION,
                "incompatible protocol version, ignoring handshake"
            );
            return;
        }
        debug!(%src, fingerprint = %handshake.fingerprint, "handshake received");
        // Answer with our identity so the peer can route to us by id.
        let announcement =
            AnnouncementPacket::new(PROTOCOL_VERSION, self.inner.keypair.public_key().clone());
        if let Err(error) = self.send_packet(src, &announcement).await {
            debug!(%src, error = %error, "announcement send failed");
        }
    }

    async fn on_announcement(&self, src: SocketAddr, announcement: &AnnouncementPacket) {
        if !announcement.version.is_compatible_with(&PROTOCOL_VERSION) {
            warn!(%src, theirs = %announcement.version, "incompatible announcement dropped");
            return;
        }
        let peer = Peer::new(announcement.public_key.clone(), Some(src));
        if peer.id() == self.id() {
            return;
        }
        debug!(peer = %peer.id(), %src, "peer announced");
        self.inner
            .by_address
            .lock()
            .expect("mutex poisoned")
            .insert(src, peer.id());
        let rpc: Arc<dyn PeerRpc> = Arc::new(self.clone());
        announce_with_eviction(&self.inner.routing, &rpc, peer, self.inner.params.query_timeout)
            .await;
    }

    async fn on_lookup_request(&self, src: SocketAddr, request: &LookupPacket) {
        let closest = self.inner.routing.closest_nodes(&request.target).await;
        let records: Vec<PeerRecord> = closest.iter().map(Peer::to_record).collect();
        trace!(
            %src,
            lookup = %request.lookup_id,
            target = %request.target,
            count = records.len(),
            "answering lookup"
        );
        let reply = LookupReplyPacket::new(request.lookup_id, records);
        if let Err(error) = self.send_packet(src, &reply).await {
            debug!(%src, error = %error, "lookup reply failed");
        }
    }

    async fn on_lookup_reply(&self, src: SocketAddr, reply: &LookupReplyPacket) {
        // Merge first, correlate second: peers learned from a late reply
        // still feed the table even though no waiter remains (and no
        // callback re-fires).
        let rpc: Arc<dyn PeerRpc> = Arc::new(self.clone());
        for record in &reply.peers {
            if record.id() == self.id() {
                continue;
            }
            announce_with_eviction(
                &self.inner.routing,
                &rpc,
                Peer::from_record(record),
                self.inner.params.query_timeout,
            )
            .await;
        }

        let Some(responder) = self.peer_for(src) else {
            trace!(%src, lookup = %reply.lookup_id, "reply from unattributed source, merged only");
            return;
        };
        let waiter = self
            .inner
            .pending_lookups
            .lock()
            .expect("mutex poisoned")
            .remove(&(reply.lookup_id, responder));
        if let Some(waiter) = waiter {
            let _ = waiter.send(reply.peers.clone());
        }
    }

    async fn on_broadcast(&self, src: SocketAddr, mut packet: Box<dyn Packet>) {
        // Dedup on the packet UUID; a repeat from any neighbor is dropped.
        {
            let mut seen = self.inner.seen_broadcasts.lock().expect("mutex poisoned");
            if seen.put(packet.id(), ()).is_some() {
                trace!(id = %packet.id(), "duplicate broadcast suppressed");
                return;
            }
        }

        let ttl = packet
            .broadcast_ttl()
            .unwrap_or(0)
            .min(self.inner.max_broadcast_ttl);

        let mut consumed = false;
        if let Some(envelope) = packet.as_any().downcast_ref::<EnvelopePacket>() {
            if envelope.target == self.id() {
                consumed = true;
                match self.inner.keypair.decrypt(&envelope.sealed) {
                    Ok(payload) => {
                        debug!(id = %packet.id(), bytes = payload.len(), "sealed payload delivered");
                        let _ = self.inner.envelope_tx.send(EnvelopeDelivery { payload }).await;
                    }
                    Err(error) => {
                        debug!(id = %packet.id(), %error, "undecryptable envelope dropped");
                        if let Some(source) = self.peer_for(src) {
                            let failures = self.inner.routing.record_failure(&source).await;
                            trace!(peer = %source, failures, "crypto blame recorded");
                        }
                    }
                }
            }
        }
        if consumed {
            return;
        }

        // Forward while hops remain, to everyone but the source.
        let remaining = ttl.saturating_sub(1);
        if remaining == 0 {
            trace!(id = %packet.id(), "broadcast TTL exhausted");
            return;
        }
        packet.set_broadcast_ttl(remaining);
        for peer in self.inner.routing.direct_peers().await {
            match peer.address {
                Some(address) if address != src => {
                    if let Err(error) = self.send_packet(address, packet.as_ref()).await {
                        debug!(peer = %peer.id(), error = %error, "broadcast forward failed");
                    }
                }
                _ => {}
            }
        }
    }

    fn peer_for(&self, src: SocketAddr) -> Option<NodeId> {
        self.inner.by_address.lock().expect("mutex poisoned").get(&src).copied()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn spawn_periodic_ping(&self, interval: Duration) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                node.ping_all_known_peers().await;
            }
        });
    }

    /// One liveness sweep: ping every peer with an address, demote the ones
    /// that stay silent.
    async fn ping_all_known_peers(&self) {
        let peers = self.inner.routing.all_peers().await;
        for peer in peers {
            if peer.address.is_none() {
                continue;
            }
            let alive = timeout(self.inner.params.query_timeout, self.ping(&peer))
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);
            if alive {
                self.inner.routing.mark_seen(&peer.id()).await;
            } else {
                debug!(peer = %peer.id(), "peer silent, demoting");
                self.inner.routing.demote(&peer.id()).await;
            }
        }
    }
}

impl std::fmt::Debug for WeftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeftNode").field("id", &self.id()).finish()
    }
}

// ============================================================================
// Pending-entry guard
// ============================================================================

/// Removes a pending correlation entry when the waiting future goes away,
/// whether it resolved, timed out, or was cancelled mid-poll.
struct PendingGuard<'a, K: std::hash::Hash + Eq, V> {
    map: &'a Mutex<HashMap<K, V>>,
    key: Option<K>,
}

impl<'a, K: std::hash::Hash + Eq, V> PendingGuard<'a, K, V> {
    fn register(map: &'a Mutex<HashMap<K, V>>, key: K, value: V) -> Self
    where
        K: Clone,
    {
        map.lock().expect("mutex poisoned").insert(key.clone(), value);
        Self { map, key: Some(key) }
    }
}

impl<K: std::hash::Hash + Eq, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.lock().expect("mutex poisoned").remove(&key);
        }
    }
}

// ============================================================================
// PeerRpc over the packet catalogue
// ============================================================================

#[async_trait]
impl PeerRpc for WeftNode {
    async fn find_node(&self, to: &Peer, lookup_id: Uuid, target: NodeId) -> Result<Vec<Peer>> {
        let address = to.address.ok_or_else(|| anyhow!("peer has no known address"))?;
        self.inner
            .by_address
            .lock()
            .expect("mutex poisoned")
            .insert(address, to.id());

        let (tx, rx) = oneshot::channel();
        let _guard =
            PendingGuard::register(&self.inner.pending_lookups, (lookup_id, to.id()), tx);

        let request = LookupPacket::new(lookup_id, target);
        self.send_packet(address, &request).await?;

        let records = rx.await.context("lookup reply channel closed")?;
        Ok(records
            .iter()
            .filter(|record| record.id() != self.id())
            .map(Peer::from_record)
            .collect())
    }

    async fn ping(&self, to: &Peer) -> Result<()> {
        let address = to.address.ok_or_else(|| anyhow!("peer has no known address"))?;

        let ping = PingPacket::new();
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard::register(&self.inner.pending_pongs, ping.id(), tx);

        self.send_packet(address, &ping).await?;
        rx.await.context("pong channel closed")
    }

    async fn request_address(&self, to: &Peer) -> Result<SocketAddr> {
        let address = to.address.ok_or_else(|| anyhow!("peer has no known address"))?;

        let request = AddressRequestPacket::new();
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard::register(&self.inner.pending_addresses, request.id(), tx);

        self.send_packet(address, &request).await?;
        let disclosed = rx.await.context("address reply channel closed")?;

        // A successful disclosure upgrades the peer to directly connected.
        let mut updated = to.clone();
        updated.address = Some(disclosed);
        updated.directly_connected = true;
        let rpc: Arc<dyn PeerRpc> = Arc::new(self.clone());
        announce_with_eviction(
            &self.inner.routing,
            &rpc,
            updated,
            self.inner.params.query_timeout,
        )
        .await;
        Ok(disclosed)
    }
}
