//! # Packet Types
//!
//! Every unit of communication on the overlay is a packet: a registered kind
//! string, a fresh UUID, and a kind-specific payload. Broadcast packets
//! additionally carry a hop-count TTL directly after the UUID.
//!
//! ## Catalogue
//!
//! | kind | shape | purpose |
//! |------|-------|---------|
//! | `weft/handshake` | standard | protocol version + key fingerprint |
//! | `weft/announce` | standard | protocol version + full public key |
//! | `weft/ping` / `weft/pong` | standard | liveness probe and correlated echo |
//! | `weft/lookup` | standard | FindNode request with lookup id + target |
//! | `weft/lookup-reply` | standard | peers the responder knows near the target |
//! | `weft/addr-request` / `weft/addr-reply` | standard | address disclosure |
//! | `weft/envelope` | broadcast | sealed payload flooded toward a target id |
//!
//! The packet UUID is assigned at construction and serves as the
//! deduplication key at broadcast receivers; it is never reused when a
//! broadcast is forwarded, only the TTL changes.

use std::any::Any;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::buffer::{Buffer, DecodeError};
use crate::identity::{NodeId, PublicKey};
use crate::storage::{StorageValue, Version};

/// Default hop budget for freshly built broadcast packets.
pub const DEFAULT_BROADCAST_TTL: u16 = 8;

// ============================================================================
// Traits
// ============================================================================

/// A decodable, dispatchable unit of communication.
///
/// `as_any` exists so dispatch code can recover the concrete type after the
/// registry has produced a boxed packet; packets carry no other runtime type
/// machinery.
pub trait Packet: Send + Sync + std::fmt::Debug {
    /// The packet's own identifier, assigned at construction.
    fn id(&self) -> Uuid;

    /// The registered kind token.
    fn kind(&self) -> &'static str;

    /// Append the kind-specific payload (everything after the UUID and
    /// optional TTL) to `buf`.
    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError>;

    /// Hop budget for broadcast packets, `None` for point-to-point kinds.
    /// The codec writes the TTL exactly when this returns `Some`.
    fn broadcast_ttl(&self) -> Option<u16> {
        None
    }

    /// Replace the hop budget. No-op on point-to-point kinds; forwarders
    /// call this with the decremented value before re-encoding.
    fn set_broadcast_ttl(&mut self, _ttl: u16) {}

    fn as_any(&self) -> &dyn Any;
}

/// A packet flooded across the overlay rather than sent point-to-point.
///
/// The typed TTL accessors let fan-out code clamp and decrement without
/// round-tripping through the optional [`Packet::broadcast_ttl`].
pub trait BroadcastPacket: Packet {
    /// Remaining hop budget.
    fn ttl(&self) -> u16;

    fn set_ttl(&mut self, ttl: u16);
}

// ============================================================================
// Peer Record (wire form of a discovered peer)
// ============================================================================

/// What a lookup reply says about one peer: its key (from which the id is
/// derived locally, never trusted from the wire) and, when disclosed, the
/// address it answers on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub public_key: PublicKey,
    pub address: Option<SocketAddr>,
}

impl PeerRecord {
    pub fn new(public_key: PublicKey, address: Option<SocketAddr>) -> Self {
        Self { public_key, address }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.public_key.id()
    }
}

impl StorageValue for PeerRecord {
    fn write_to(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_public_key(&self.public_key)?;
        match &self.address {
            Some(addr) => {
                buf.write_u8(1)?.write_string(&addr.to_string())?;
            }
            None => {
                buf.write_u8(0)?;
            }
        }
        Ok(())
    }

    fn read_from(buf: &mut Buffer) -> Result<Self, DecodeError> {
        let public_key = buf.read_public_key()?;
        let address = match buf.read_u8()? {
            0 => None,
            _ => Some(
                buf.read_string()?
                    .parse()
                    .map_err(|_| DecodeError::MalformedAddress)?,
            ),
        };
        Ok(Self { public_key, address })
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// First packet on a fresh contact: protocol version plus the sender's key
/// fingerprint, enough for early mismatch detection without shipping the
/// full key.
#[derive(Clone, Debug)]
pub struct HandshakePacket {
    id: Uuid,
    pub version: Version,
    pub fingerprint: String,
}

impl HandshakePacket {
    pub const KIND: &'static str = "weft/handshake";

    pub fn new(version: Version, fingerprint: String) -> Self {
        Self { id: Uuid::new_v4(), version, fingerprint }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let version = buf.read_value::<Version>()?;
        let fingerprint = buf.read_string()?;
        Ok(Box::new(Self { id, version, fingerprint }))
    }
}

impl Packet for HandshakePacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_value(&self.version)?.write_string(&self.fingerprint)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Announcement
// ============================================================================

/// Identity disclosure: the full public key, from which the receiver derives
/// the sender's id and enters it into the routing table.
#[derive(Clone, Debug)]
pub struct AnnouncementPacket {
    id: Uuid,
    pub version: Version,
    pub public_key: PublicKey,
}

impl AnnouncementPacket {
    pub const KIND: &'static str = "weft/announce";

    pub fn new(version: Version, public_key: PublicKey) -> Self {
        Self { id: Uuid::new_v4(), version, public_key }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let version = buf.read_value::<Version>()?;
        let public_key = buf.read_public_key()?;
        Ok(Box::new(Self { id, version, public_key }))
    }
}

impl Packet for AnnouncementPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_value(&self.version)?.write_public_key(&self.public_key)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Ping / Pong
// ============================================================================

#[derive(Clone, Debug)]
pub struct PingPacket {
    id: Uuid,
}

impl PingPacket {
    pub const KIND: &'static str = "weft/ping";

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn decode(id: Uuid, _buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        Ok(Box::new(Self { id }))
    }
}

impl Packet for PingPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, _buf: &mut Buffer) -> Result<(), DecodeError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Echo for a [`PingPacket`], correlated by the ping's packet id.
#[derive(Clone, Debug)]
pub struct PongPacket {
    id: Uuid,
    pub ping_id: Uuid,
}

impl PongPacket {
    pub const KIND: &'static str = "weft/pong";

    pub fn new(ping_id: Uuid) -> Self {
        Self { id: Uuid::new_v4(), ping_id }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let ping_id = buf.read_uuid()?;
        Ok(Box::new(Self { id, ping_id }))
    }
}

impl Packet for PongPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_uuid(&self.ping_id)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Lookup Request / Reply
// ============================================================================

/// FindNode: asks the receiver for the closest peers it knows to `target`.
/// The lookup id travels in both directions so concurrent lookups for the
/// same target stay distinguishable.
#[derive(Clone, Debug)]
pub struct LookupPacket {
    id: Uuid,
    pub lookup_id: Uuid,
    pub target: NodeId,
}

impl LookupPacket {
    pub const KIND: &'static str = "weft/lookup";

    pub fn new(lookup_id: Uuid, target: NodeId) -> Self {
        Self { id: Uuid::new_v4(), lookup_id, target }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let lookup_id = buf.read_uuid()?;
        let target = NodeId::from_uuid(buf.read_uuid()?);
        Ok(Box::new(Self { id, lookup_id, target }))
    }
}

impl Packet for LookupPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_uuid(&self.lookup_id)?.write_uuid(&self.target.as_uuid())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Debug)]
pub struct LookupReplyPacket {
    id: Uuid,
    pub lookup_id: Uuid,
    pub peers: Vec<PeerRecord>,
}

impl LookupReplyPacket {
    pub const KIND: &'static str = "weft/lookup-reply";

    /// Upper bound on peers accepted in one reply. A reply never usefully
    /// carries more than `k` entries; the cap stops a hostile responder from
    /// forcing unbounded key parsing.
    pub const MAX_PEERS: usize = 64;

    pub fn new(lookup_id: Uuid, peers: Vec<PeerRecord>) -> Self {
        Self { id: Uuid::new_v4(), lookup_id, peers }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let lookup_id = buf.read_uuid()?;
        let count = buf.read_var_u32()? as usize;
        if count > Self::MAX_PEERS {
            return Err(DecodeError::CapacityExceeded);
        }
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(buf.read_value::<PeerRecord>()?);
        }
        Ok(Box::new(Self { id, lookup_id, peers }))
    }
}

impl Packet for LookupReplyPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_uuid(&self.lookup_id)?
            .write_var_u32(self.peers.len() as u32)?;
        for peer in &self.peers {
            buf.write_value(peer)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Address Disclosure
// ============================================================================

/// Asks the receiver to disclose the address it can currently be reached on.
/// Receivers are free to reject (by not answering); routing-only nodes
/// typically will.
#[derive(Clone, Debug)]
pub struct AddressRequestPacket {
    id: Uuid,
}

impl AddressRequestPacket {
    pub const KIND: &'static str = "weft/addr-request";

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn decode(id: Uuid, _buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        Ok(Box::new(Self { id }))
    }
}

impl Packet for AddressRequestPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, _buf: &mut Buffer) -> Result<(), DecodeError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Debug)]
pub struct AddressReplyPacket {
    id: Uuid,
    pub request_id: Uuid,
    pub address: SocketAddr,
}

impl AddressReplyPacket {
    pub const KIND: &'static str = "weft/addr-reply";

    pub fn new(request_id: Uuid, address: SocketAddr) -> Self {
        Self { id: Uuid::new_v4(), request_id, address }
    }

    pub fn decode(id: Uuid, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let request_id = buf.read_uuid()?;
        let address = buf
            .read_string()?
            .parse()
            .map_err(|_| DecodeError::MalformedAddress)?;
        Ok(Box::new(Self { id, request_id, address }))
    }
}

impl Packet for AddressReplyPacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_uuid(&self.request_id)?
            .write_string(&self.address.to_string())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Envelope (broadcast)
// ============================================================================

/// Routed delivery for peers without a direct connection: a payload sealed to
/// the target's public key, flooded across the overlay with a hop budget.
/// Everyone except the target sees only ciphertext; the target recognizes
/// itself by the embedded id and decrypts.
#[derive(Clone, Debug)]
pub struct EnvelopePacket {
    id: Uuid,
    ttl: u16,
    pub target: NodeId,
    pub sealed: Vec<u8>,
}

impl EnvelopePacket {
    pub const KIND: &'static str = "weft/envelope";

    pub fn new(target: NodeId, sealed: Vec<u8>) -> Self {
        Self::with_ttl(target, sealed, DEFAULT_BROADCAST_TTL)
    }

    pub fn with_ttl(target: NodeId, sealed: Vec<u8>, ttl: u16) -> Self {
        Self { id: Uuid::new_v4(), ttl, target, sealed }
    }

    pub fn decode(id: Uuid, ttl: u16, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let target = NodeId::from_uuid(buf.read_uuid()?);
        let sealed = buf.read_byte_array()?;
        Ok(Box::new(Self { id, ttl, target, sealed }))
    }
}

impl Packet for EnvelopePacket {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn write_payload(&self, buf: &mut Buffer) -> Result<(), DecodeError> {
        buf.write_uuid(&self.target.as_uuid())?
            .write_byte_array(&self.sealed)?;
        Ok(())
    }

    fn broadcast_ttl(&self) -> Option<u16> {
        Some(self.ttl)
    }

    fn set_broadcast_ttl(&mut self, ttl: u16) {
        self.ttl = ttl;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl BroadcastPacket for EnvelopePacket {
    fn ttl(&self) -> u16 {
        self.ttl
    }

    fn set_ttl(&mut self, ttl: u16) {
        self.ttl = ttl;
    }
}
