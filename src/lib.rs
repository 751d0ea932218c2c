//! # Weft - Peer-to-Peer Overlay Core
//!
//! Weft is the core of a Kademlia-style overlay network node: an
//! XOR-metric routing fabric over an authenticated, length-prefixed
//! datagram protocol.
//!
//! ## Subsystems
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `buffer` | length-delimited byte buffer, base-128 varints, typed primitives |
//! | `storage` | self-describing values embedded in packets (`Version`) |
//! | `wire` | framing, packet codec, registry of decoder factories |
//! | `packet` | the packet catalogue (handshake, announce, lookup, broadcast, ...) |
//! | `identity` | RSA identities, key-derived 128-bit node ids, crypto envelope |
//! | `routing` | k-bucket routing table with head-ping replacement |
//! | `lookup` | α-parallel iterative lookup engine |
//! | `protocols` | collaborator traits (`Transport`, `PeerRpc`) |
//! | `node` | the facade wiring dispatch, broadcast, and maintenance together |
//!
//! ## Architecture
//!
//! Shared state is actor-owned: the routing table lives in its own task and
//! is driven over an async command channel, and each committed lookup is
//! owned by exactly one task for its lifetime. Handles are cheap to clone
//! and communicate via `tokio::sync` channels.
//!
//! The transport is an external collaborator. A binding feeds received
//! datagrams into [`WeftNode::handle_datagram`] and implements
//! [`Transport`] for the outbound direction; everything above raw bytes lives
//! here: framing, packet dispatch, routing, lookups, and broadcast fan-out.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft::{Transport, WeftNode};
//!
//! # async fn demo(transport: Arc<dyn Transport>) -> anyhow::Result<()> {
//! let node = WeftNode::builder()
//!     .advertised_address("198.51.100.7:4100".parse()?)
//!     .build(transport)?;
//!
//! node.introduce_to("198.51.100.9:4100".parse()?).await?;
//! let handle = node
//!     .lookup(node.id())
//!     .recursive(true)
//!     .on_failure(|| tracing::info!("join sweep finished"))
//!     .commit();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod identity;
pub mod lookup;
pub mod node;
pub mod packet;
pub mod protocols;
pub mod routing;
pub mod storage;
pub mod wire;

pub use buffer::{Buffer, DecodeError};
pub use identity::{CryptoError, Keypair, NodeId, PeerEnvelope, PublicKey};
pub use lookup::{LookupBuilder, LookupError, LookupHandle, LookupSnapshot, LookupStatus};
pub use node::{EnvelopeDelivery, NodeBuilder, WeftNode};
pub use packet::{BroadcastPacket, Packet};
pub use protocols::{PeerRpc, Transport, PROTOCOL_VERSION};
pub use routing::{Peer, PendingEviction, RoutingHandle};
pub use storage::{StorageValue, Version};
pub use wire::{FrameCodec, PacketCodec, PacketRegistry, RegistryBuilder};
