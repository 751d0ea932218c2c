//! # Framing and Packet Codec
//!
//! Two layers sit between raw datagram bytes and typed packets:
//!
//! - [`FrameCodec`]: length-delimited framing. A frame is
//!   `varint(len) || payload`; the receive path accumulates bytes and
//!   extracts every complete frame, leaving partial tails buffered for the
//!   next datagram.
//! - [`PacketCodec`]: typed packets over frames. A packet body is
//!   `string(kind) || uuid || [short(ttl) if broadcast] || payload`, with the
//!   kind resolved through an explicit [`PacketRegistry`] of decoder
//!   factories: registration is the single point of validation, decode is a
//!   direct call.
//!
//! ## Registry Contract
//!
//! A built registry is immutable and safe to share across threads behind an
//! `Arc`. Mutation happens through [`RegistryBuilder`], which composes
//! chain-ably and rejects duplicate kinds at registration time. The factory
//! shape (standard vs. broadcast) is part of the registration, so a kind can
//! never be decoded with the wrong frame layout.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::buffer::{Buffer, DecodeError};
use crate::packet::{
    AddressReplyPacket, AddressRequestPacket, AnnouncementPacket, EnvelopePacket, HandshakePacket,
    LookupPacket, LookupReplyPacket, Packet, PingPacket, PongPacket,
};

/// Upper bound on the accumulation buffer. A source that streams more than
/// this without ever completing a frame is discarded wholesale.
const MAX_PENDING_BYTES: usize = 1 << 20;

// ============================================================================
// Frame Codec
// ============================================================================

/// Length-delimited frame extraction with partial-frame retention.
///
/// One codec instance exists per traffic source; frames from different
/// sources never share an accumulation buffer.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending: Buffer,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a payload into its wire frame.
    pub fn encode(payload: &Buffer) -> Result<Buffer, DecodeError> {
        let mut out = Buffer::with_capacity(payload.readable_bytes() + 5);
        out.write_buffer(payload)?;
        Ok(out)
    }

    /// Feed received bytes and drain every complete frame.
    ///
    /// Incomplete trailing data stays buffered. A malformed length prefix
    /// poisons the stream (there is no way to resynchronize), so the pending
    /// buffer is dropped and the error surfaced once.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<Vec<Buffer>, DecodeError> {
        if self.pending.readable_bytes() + bytes.len() > MAX_PENDING_BYTES {
            self.pending = Buffer::new();
            return Err(DecodeError::CapacityExceeded);
        }
        self.pending.write_raw(bytes)?;

        let mut frames = Vec::new();
        while self.pending.is_u32_varint_available() {
            self.pending.mark_reader_index();
            let len = match self.pending.read_var_u32() {
                Ok(len) => len as usize,
                Err(err) => {
                    self.pending = Buffer::new();
                    return Err(err);
                }
            };
            if self.pending.readable_bytes() < len {
                self.pending.reset_reader_index();
                break;
            }
            frames.push(Buffer::from_vec(self.pending.read_raw(len)?));
        }

        // Compact: drop the consumed prefix so the buffer never grows without
        // bound across long-lived connections.
        if self.pending.reader_index() > 0 {
            self.pending = Buffer::from_vec(self.pending.readable().to_vec());
        }
        Ok(frames)
    }

    /// Bytes buffered awaiting frame completion.
    pub fn pending_bytes(&self) -> usize {
        self.pending.readable_bytes()
    }
}

// ============================================================================
// Packet Registry
// ============================================================================

/// Decoder for a point-to-point packet kind: `(packet_id, payload)`.
pub type StandardDecoder = fn(Uuid, &mut Buffer) -> Result<Box<dyn Packet>, DecodeError>;

/// Decoder for a broadcast packet kind: `(packet_id, ttl, payload)`.
pub type BroadcastDecoder = fn(Uuid, u16, &mut Buffer) -> Result<Box<dyn Packet>, DecodeError>;

/// A registered decoder factory. The variant fixes the frame layout the
/// codec uses for the kind.
#[derive(Clone, Copy)]
pub enum PacketDecoder {
    Standard(StandardDecoder),
    Broadcast(BroadcastDecoder),
}

impl std::fmt::Debug for PacketDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketDecoder::Standard(_) => write!(f, "PacketDecoder::Standard"),
            PacketDecoder::Broadcast(_) => write!(f, "PacketDecoder::Broadcast"),
        }
    }
}

/// Registration failures, reported by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateKind(String),
    UnknownKind(String),
    EmptyKind,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateKind(kind) => {
                write!(f, "packet kind {:?} is already registered", kind)
            }
            RegistryError::UnknownKind(kind) => {
                write!(f, "packet kind {:?} is not registered", kind)
            }
            RegistryError::EmptyKind => write!(f, "packet kind must not be empty"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Immutable map from kind tokens to decoder factories.
///
/// Kind strings are opaque to the codec; the built-in packets use stable
/// `weft/...` tokens. Registrations must agree across interoperating nodes
/// for the handshake-related kinds; application kinds may vary per
/// deployment.
#[derive(Debug)]
pub struct PacketRegistry {
    decoders: HashMap<String, PacketDecoder>,
}

impl PacketRegistry {
    /// Start from an empty registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { decoders: HashMap::new() }
    }

    /// A registry with every built-in kind registered.
    pub fn with_defaults() -> Arc<Self> {
        RegistryBuilder::defaults()
            .build()
            .expect("built-in kinds are distinct")
    }

    /// Derive a builder seeded with this registry's registrations.
    pub fn builder_for(&self) -> RegistryBuilder {
        RegistryBuilder { decoders: self.decoders.clone() }
    }

    /// Resolve the decoder for a kind token.
    pub fn decoder(&self, kind: &str) -> Option<PacketDecoder> {
        self.decoders.get(kind).copied()
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Whether the kind decodes with the broadcast frame layout.
    pub fn is_broadcast(&self, kind: &str) -> Option<bool> {
        self.decoders
            .get(kind)
            .map(|decoder| matches!(decoder, PacketDecoder::Broadcast(_)))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

/// Chainable, single-threaded construction of a [`PacketRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    decoders: HashMap<String, PacketDecoder>,
}

impl RegistryBuilder {
    /// Builder pre-loaded with the built-in packet kinds.
    pub fn defaults() -> Self {
        let built_in: [(&str, PacketDecoder); 9] = [
            (HandshakePacket::KIND, PacketDecoder::Standard(HandshakePacket::decode)),
            (AnnouncementPacket::KIND, PacketDecoder::Standard(AnnouncementPacket::decode)),
            (PingPacket::KIND, PacketDecoder::Standard(PingPacket::decode)),
            (PongPacket::KIND, PacketDecoder::Standard(PongPacket::decode)),
            (LookupPacket::KIND, PacketDecoder::Standard(LookupPacket::decode)),
            (LookupReplyPacket::KIND, PacketDecoder::Standard(LookupReplyPacket::decode)),
            (AddressRequestPacket::KIND, PacketDecoder::Standard(AddressRequestPacket::decode)),
            (AddressReplyPacket::KIND, PacketDecoder::Standard(AddressReplyPacket::decode)),
            (EnvelopePacket::KIND, PacketDecoder::Broadcast(EnvelopePacket::decode)),
        ];

        let mut builder = Self::default();
        for (kind, decoder) in built_in {
            builder
                .register(kind, decoder)
                .expect("built-in kinds are distinct");
        }
        builder
    }

    /// Register a kind. Duplicate kinds are an error; use
    /// [`RegistryBuilder::register_if_unknown`] for idempotent registration.
    pub fn register(
        &mut self,
        kind: &str,
        decoder: PacketDecoder,
    ) -> Result<&mut Self, RegistryError> {
        if kind.is_empty() {
            return Err(RegistryError::EmptyKind);
        }
        if self.decoders.contains_key(kind) {
            return Err(RegistryError::DuplicateKind(kind.to_string()));
        }
        self.decoders.insert(kind.to_string(), decoder);
        Ok(self)
    }

    /// Register a kind unless it is already present.
    pub fn register_if_unknown(&mut self, kind: &str, decoder: PacketDecoder) -> &mut Self {
        if !kind.is_empty() {
            self.decoders.entry(kind.to_string()).or_insert(decoder);
        }
        self
    }

    /// Remove a kind. Unknown kinds are an error; use
    /// [`RegistryBuilder::remove_if_known`] for idempotent removal.
    pub fn remove(&mut self, kind: &str) -> Result<&mut Self, RegistryError> {
        if self.decoders.remove(kind).is_none() {
            return Err(RegistryError::UnknownKind(kind.to_string()));
        }
        Ok(self)
    }

    pub fn remove_if_known(&mut self, kind: &str) -> &mut Self {
        self.decoders.remove(kind);
        self
    }

    pub fn is_known(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn clear(&mut self) -> &mut Self {
        self.decoders.clear();
        self
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Freeze into an immutable, shareable registry.
    pub fn build(&self) -> Result<Arc<PacketRegistry>, RegistryError> {
        Ok(Arc::new(PacketRegistry { decoders: self.decoders.clone() }))
    }
}

// ============================================================================
// Packet Codec
// ============================================================================

/// Serializes packets into frame payloads and back, driven by the registry.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    registry: Arc<PacketRegistry>,
}

impl PacketCodec {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Encode a packet body: kind, UUID, optional TTL, payload.
    ///
    /// Encoding a kind that is not registered is refused: the peer could
    /// never decode it, so the mistake surfaces here rather than on the wire.
    pub fn encode(&self, packet: &dyn Packet) -> Result<Buffer, DecodeError> {
        if !self.registry.is_registered(packet.kind()) {
            return Err(DecodeError::UnknownPacket(packet.kind().to_string()));
        }
        let mut buf = Buffer::with_capacity(64);
        buf.write_string(packet.kind())?.write_uuid(&packet.id())?;
        if let Some(ttl) = packet.broadcast_ttl() {
            buf.write_short(ttl)?;
        }
        packet.write_payload(&mut buf)?;
        Ok(buf)
    }

    /// Decode one packet body, consuming the buffer's readable region up to
    /// whatever the kind's decoder takes.
    pub fn decode(&self, buf: &mut Buffer) -> Result<Box<dyn Packet>, DecodeError> {
        let kind = buf.read_string()?;
        let decoder = match self.registry.decoder(&kind) {
            Some(decoder) => decoder,
            None => {
                debug!(kind = %kind, "dropping packet with unregistered kind");
                return Err(DecodeError::UnknownPacket(kind));
            }
        };
        let id = buf.read_uuid()?;
        match decoder {
            PacketDecoder::Standard(decode) => decode(id, buf),
            PacketDecoder::Broadcast(decode) => {
                let ttl = buf.read_short()?;
                decode(id, ttl, buf)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, NodeId, MIN_KEY_BITS};
    use crate::packet::{PeerRecord, DEFAULT_BROADCAST_TTL};
    use crate::storage::Version;

    fn codec() -> PacketCodec {
        PacketCodec::new(PacketRegistry::with_defaults())
    }

    fn test_keypair() -> Keypair {
        Keypair::generate_with_bits(MIN_KEY_BITS).expect("keypair")
    }

    #[test]
    fn frame_round_trip_single() {
        let mut payload = Buffer::new();
        payload.write_string("hello").unwrap();
        let frame = FrameCodec::encode(&payload).unwrap();

        let mut rx = FrameCodec::new();
        let frames = rx.decode(frame.readable()).unwrap();
        assert_eq!(frames.len(), 1);
        let mut decoded = frames.into_iter().next().unwrap();
        assert_eq!(decoded.read_string().unwrap(), "hello");
    }

    #[test]
    fn frames_survive_every_split_point() {
        // Three frames concatenated, then delivered in two chunks split at
        // every possible byte boundary; the frame count and contents must
        // be identical regardless of placement.
        let mut wire = Vec::new();
        for i in 0u32..3 {
            let mut payload = Buffer::new();
            payload.write_var_u32(i).unwrap();
            payload.write_string(&format!("frame-{}", i)).unwrap();
            wire.extend_from_slice(FrameCodec::encode(&payload).unwrap().readable());
        }

        for split in 0..=wire.len() {
            let mut rx = FrameCodec::new();
            let mut frames = rx.decode(&wire[..split]).unwrap();
            frames.extend(rx.decode(&wire[split..]).unwrap());
            assert_eq!(frames.len(), 3, "split at {}", split);
            for (i, frame) in frames.iter_mut().enumerate() {
                assert_eq!(frame.read_var_u32().unwrap(), i as u32);
                assert_eq!(frame.read_string().unwrap(), format!("frame-{}", i));
            }
            assert_eq!(rx.pending_bytes(), 0);
        }
    }

    #[test]
    fn partial_frame_stays_pending() {
        let mut payload = Buffer::new();
        payload.write_raw(&[9u8; 100]).unwrap();
        let frame = FrameCodec::encode(&payload).unwrap();
        let bytes = frame.readable();

        let mut rx = FrameCodec::new();
        assert!(rx.decode(&bytes[..10]).unwrap().is_empty());
        assert_eq!(rx.pending_bytes(), 10);
        let frames = rx.decode(&bytes[10..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].readable(), &[9u8; 100]);
    }

    #[test]
    fn poisoned_length_prefix_drops_pending() {
        let mut rx = FrameCodec::new();
        let err = rx.decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap_err();
        assert!(matches!(err, DecodeError::VarintOverflow { .. }));
        assert_eq!(rx.pending_bytes(), 0);
    }

    #[test]
    fn handshake_round_trip() {
        let codec = codec();
        let packet = HandshakePacket::new(Version::new(1, 2, 0), "00ff11ee22dd33cc".into());
        let mut body = codec.encode(&packet).unwrap();
        let decoded = codec.decode(&mut body).unwrap();
        let decoded = decoded
            .as_any()
            .downcast_ref::<HandshakePacket>()
            .expect("handshake");
        assert_eq!(decoded.id(), packet.id());
        assert_eq!(decoded.version, packet.version);
        assert_eq!(decoded.fingerprint, packet.fingerprint);
    }

    #[test]
    fn announcement_round_trip() {
        let codec = codec();
        let keypair = test_keypair();
        let packet = AnnouncementPacket::new(Version::new(1, 0, 0), keypair.public_key().clone());
        let mut body = codec.encode(&packet).unwrap();
        let decoded = codec.decode(&mut body).unwrap();
        let decoded = decoded
            .as_any()
            .downcast_ref::<AnnouncementPacket>()
            .expect("announcement");
        assert_eq!(decoded.public_key, *keypair.public_key());
        assert_eq!(decoded.public_key.id(), keypair.id());
    }

    #[test]
    fn lookup_and_reply_round_trip() {
        let codec = codec();
        let keypair = test_keypair();
        let lookup_id = Uuid::new_v4();

        let request = LookupPacket::new(lookup_id, NodeId::from_u128(0xBEEF));
        let mut body = codec.encode(&request).unwrap();
        let decoded = codec.decode(&mut body).unwrap();
        let decoded = decoded.as_any().downcast_ref::<LookupPacket>().unwrap();
        assert_eq!(decoded.lookup_id, lookup_id);
        assert_eq!(decoded.target, NodeId::from_u128(0xBEEF));

        let reply = LookupReplyPacket::new(
            lookup_id,
            vec![PeerRecord::new(
                keypair.public_key().clone(),
                Some("10.0.0.1:9000".parse().unwrap()),
            )],
        );
        let mut body = codec.encode(&reply).unwrap();
        let decoded = codec.decode(&mut body).unwrap();
        let decoded = decoded.as_any().downcast_ref::<LookupReplyPacket>().unwrap();
        assert_eq!(decoded.lookup_id, lookup_id);
        assert_eq!(decoded.peers.len(), 1);
        assert_eq!(decoded.peers[0].id(), keypair.id());
    }

    #[test]
    fn broadcast_ttl_travels_on_the_wire() {
        let codec = codec();
        let packet = EnvelopePacket::with_ttl(NodeId::from_u128(5), vec![0xAB; 16], 5);
        let mut body = codec.encode(&packet).unwrap();
        let decoded = codec.decode(&mut body).unwrap();
        assert_eq!(decoded.broadcast_ttl(), Some(5));
        let decoded = decoded.as_any().downcast_ref::<EnvelopePacket>().unwrap();
        assert_eq!(decoded.sealed, vec![0xAB; 16]);
        assert_eq!(packet.broadcast_ttl(), Some(5));
        assert_ne!(DEFAULT_BROADCAST_TTL, 5);
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let codec = codec();
        let mut body = Buffer::new();
        body.write_string("weft/unheard-of").unwrap();
        body.write_uuid(&Uuid::new_v4()).unwrap();
        match codec.decode(&mut body) {
            Err(DecodeError::UnknownPacket(kind)) => assert_eq!(kind, "weft/unheard-of"),
            other => panic!("expected UnknownPacket, got {:?}", other.map(|p| p.kind())),
        }
    }

    #[test]
    fn encoding_unregistered_kind_is_refused() {
        let registry = PacketRegistry::builder().build().unwrap();
        let codec = PacketCodec::new(registry);
        let packet = PingPacket::new();
        assert!(matches!(
            codec.encode(&packet),
            Err(DecodeError::UnknownPacket(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = RegistryBuilder::defaults();
        assert_eq!(
            builder
                .register(PingPacket::KIND, PacketDecoder::Standard(PingPacket::decode))
                .unwrap_err(),
            RegistryError::DuplicateKind(PingPacket::KIND.into())
        );
        builder.register_if_unknown(PingPacket::KIND, PacketDecoder::Standard(PingPacket::decode));
        assert!(builder.is_known(PingPacket::KIND));
    }

    #[test]
    fn builder_for_extends_without_mutating_original() {
        let registry = PacketRegistry::with_defaults();
        let size = registry.len();

        let mut builder = registry.builder_for();
        builder
            .register("app/custom", PacketDecoder::Standard(PingPacket::decode))
            .unwrap();
        let extended = builder.build().unwrap();

        assert_eq!(registry.len(), size);
        assert_eq!(extended.len(), size + 1);
        assert!(extended.is_registered("app/custom"));
    }

    #[test]
    fn malformed_sibling_frames_do_not_poison_good_ones() {
        // Two packet bodies in one datagram; the first has an unknown kind,
        // the second must still decode.
        let codec = codec();

        let mut bad = Buffer::new();
        bad.write_string("weft/bogus").unwrap();
        bad.write_uuid(&Uuid::new_v4()).unwrap();

        let good = PingPacket::new();
        let good_body = codec.encode(&good).unwrap();

        let mut wire = Vec::new();
        wire.extend_from_slice(FrameCodec::encode(&bad).unwrap().readable());
        wire.extend_from_slice(FrameCodec::encode(&good_body).unwrap().readable());

        let mut rx = FrameCodec::new();
        let mut frames = rx.decode(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(codec.decode(&mut frames[0]).is_err());
        let decoded = codec.decode(&mut frames[1]).unwrap();
        assert_eq!(decoded.id(), good.id());
    }
}
