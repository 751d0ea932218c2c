//! Collaborator trait definitions for the overlay core.
//!
//! The core never touches sockets. Everything it needs from the outside
//! world is expressed here:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Transport`] | deliver encoded frame bytes to a peer address |
//! | [`PeerRpc`] | request/response operations against a single peer |
//!
//! Traits live here, separate from their implementations, so the lookup
//! engine can depend on [`PeerRpc`] without depending on the node facade
//! that implements it (and so tests can substitute in-memory fakes).

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::identity::NodeId;
use crate::routing::Peer;
use crate::storage::Version;

/// Version stamped into handshake and announcement packets.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0, 0);

/// Outbound byte delivery. The transport owns sockets, the core owns frames;
/// inbound traffic enters through `WeftNode::handle_datagram`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one datagram's worth of frame bytes to `addr`.
    async fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()>;
}

/// Request/response operations against a single peer.
///
/// Implementations correlate replies to requests (the node facade does this
/// with packet and lookup ids over [`Transport`]); callers see plain futures.
/// Every method is cancellable by dropping the future.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Ask `to` for the closest peers it knows to `target`. The lookup id is
    /// stamped into the request so concurrent lookups stay distinguishable.
    ///
    /// Implementations derive every returned peer's id from its key; a
    /// claimed id never crosses this boundary.
    async fn find_node(&self, to: &Peer, lookup_id: Uuid, target: NodeId) -> Result<Vec<Peer>>;

    /// Liveness probe; resolves once the matching pong arrives.
    async fn ping(&self, to: &Peer) -> Result<()>;

    /// Ask `to` to disclose its current address.
    async fn request_address(&self, to: &Peer) -> Result<SocketAddr>;
}
