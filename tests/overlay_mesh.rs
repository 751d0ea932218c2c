//! Integration tests for a simulated overlay mesh.
//!
//! These tests exercise the public interface end to end: nodes wired
//! together through an in-memory transport, exchanging real frames through
//! the real codec, routing table, and lookup engine.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test overlay_mesh -- --nocapture

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::timeout;

use weft::identity::MIN_KEY_BITS;
use weft::lookup::LookupStatus;
use weft::{Keypair, NodeId, PeerRpc, Transport, WeftNode};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug or RUST_LOG=trace for
/// verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Every node registers under its advertised address; a send becomes a
/// spawned `handle_datagram` on the receiver, stamped with the sender's
/// address, exactly as a UDP binding would do it.
struct Mesh {
    nodes: Mutex<HashMap<SocketAddr, WeftNode>>,
    /// Addresses currently unreachable (simulated partition).
    down: Mutex<Vec<SocketAddr>>,
}

struct MeshTransport {
    src: SocketAddr,
    mesh: Arc<Mesh>,
}

#[async_trait]
impl Transport for MeshTransport {
    async fn send(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<()> {
        if self.mesh.down.lock().unwrap().contains(&addr) {
            // Datagram silently lost, like the real thing.
            return Ok(());
        }
        let node = self
            .mesh
            .nodes
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or_else(|| anyhow!("no node listening on {}", addr))?;
        let src = self.src;
        tokio::spawn(async move {
            node.handle_datagram(src, &bytes).await;
        });
        Ok(())
    }
}

fn new_mesh() -> Arc<Mesh> {
    Arc::new(Mesh { nodes: Mutex::new(HashMap::new()), down: Mutex::new(Vec::new()) })
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn spawn_node(mesh: &Arc<Mesh>, port: u16) -> WeftNode {
    let address = addr(port);
    let transport = Arc::new(MeshTransport { src: address, mesh: mesh.clone() });
    let node = WeftNode::builder()
        .keypair(Keypair::generate_with_bits(MIN_KEY_BITS).expect("keypair"))
        .advertised_address(address)
        .query_timeout(Duration::from_millis(500))
        .build(transport)
        .expect("node build");
    mesh.nodes.lock().unwrap().insert(address, node.clone());
    node
}

async fn wait_for_peer(node: &WeftNode, id: NodeId) {
    for _ in 0..300 {
        if node.routing().get_node(&id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {} never entered the table of {}", id, node.id());
}

#[tokio::test]
async fn five_nodes_join_through_one_bootstrap() {
    init_tracing();
    let mesh = new_mesh();
    let bootstrap = spawn_node(&mesh, 5100);
    let mut nodes = vec![bootstrap.clone()];

    for port in 5101..5105 {
        let node = spawn_node(&mesh, port);
        node.introduce_to(addr(5100)).await.expect("introduce");
        wait_for_peer(&bootstrap, node.id()).await;
        wait_for_peer(&node, bootstrap.id()).await;
        nodes.push(node);
    }

    // Each newcomer runs the classic join sweep: a recursive lookup for its
    // own id, which walks the bootstrap's knowledge into its own table.
    for node in &nodes[1..] {
        let mut handle = node
            .lookup(node.id())
            .recursive(true)
            .expiration(Duration::from_secs(5))
            .commit();
        handle.wait().await;
    }

    // After the sweeps, later joiners know about earlier ones without ever
    // having introduced themselves directly.
    let early = nodes[1].id();
    let late = &nodes[4];
    let mut handle = late
        .lookup(early)
        .recursive(true)
        .expiration(Duration::from_secs(5))
        .commit();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.status, LookupStatus::Fulfilled);
    assert_eq!(snapshot.target_found.unwrap().id(), early);
}

#[tokio::test]
async fn lookup_for_absent_id_expires_with_discoveries() {
    init_tracing();
    let mesh = new_mesh();
    let a = spawn_node(&mesh, 5110);
    let b = spawn_node(&mesh, 5111);
    let c = spawn_node(&mesh, 5112);

    a.introduce_to(addr(5111)).await.expect("a->b");
    c.introduce_to(addr(5111)).await.expect("c->b");
    wait_for_peer(&a, b.id()).await;
    wait_for_peer(&b, c.id()).await;

    // No node owns this id; the lookup must expire but still harvest peers.
    let absent = NodeId::from_u128(0xDEAD_BEEF_0000_0000_0000_0000_0000_0001);
    let mut handle = a
        .lookup(absent)
        .recursive(true)
        .expiration(Duration::from_secs(3))
        .commit();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.status, LookupStatus::Expired);
    assert!(snapshot.target_found.is_none());
    assert!(
        snapshot.discovered.contains(&b.id()),
        "the seed peer must appear in discovered"
    );
    // c was learned from b's referral during the sweep.
    wait_for_peer(&a, c.id()).await;
}

#[tokio::test]
async fn callbacks_fire_exactly_once_across_the_mesh() {
    init_tracing();
    use std::sync::atomic::{AtomicUsize, Ordering};

    let mesh = new_mesh();
    let a = spawn_node(&mesh, 5120);
    let b = spawn_node(&mesh, 5121);
    a.introduce_to(addr(5121)).await.expect("introduce");
    wait_for_peer(&a, b.id()).await;

    let successes = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let s = successes.clone();
    let f = failures.clone();
    let mut found = a
        .lookup(b.id())
        .recursive(true)
        .on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_failure(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .commit();
    found.wait().await;

    let s = successes.clone();
    let f = failures.clone();
    let mut missed = a
        .lookup(NodeId::from_u128(0x7777))
        .expiration(Duration::from_secs(2))
        .on_success(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_failure(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .commit();
    missed.wait().await;

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_peers_do_not_sink_the_lookup() {
    init_tracing();
    let mesh = new_mesh();
    let a = spawn_node(&mesh, 5130);
    let b = spawn_node(&mesh, 5131);
    let c = spawn_node(&mesh, 5132);
    let e = spawn_node(&mesh, 5133);
    let d = spawn_node(&mesh, 5134);

    // a knows b, c, and e; only e knows the eventual target d.
    for port in [5131, 5132, 5133] {
        a.introduce_to(addr(port)).await.expect("introduce");
    }
    d.introduce_to(addr(5133)).await.expect("d->e");
    wait_for_peer(&a, b.id()).await;
    wait_for_peer(&a, c.id()).await;
    wait_for_peer(&a, e.id()).await;
    wait_for_peer(&e, d.id()).await;

    // b and c drop off the network; the lookup for d must route around them
    // through e, with the per-query timeout absorbing the losses.
    mesh.down.lock().unwrap().extend([addr(5131), addr(5132)]);

    let mut handle = a
        .lookup(d.id())
        .recursive(true)
        .expiration(Duration::from_secs(10))
        .commit();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.status, LookupStatus::Fulfilled);
    assert_eq!(snapshot.target_found.unwrap().id(), d.id());
    assert!(snapshot.fulfilled.contains(&b.id()) || snapshot.fulfilled.contains(&c.id()));
}

#[tokio::test]
async fn sealed_traffic_crosses_the_mesh_confidentially() {
    init_tracing();
    let mesh = new_mesh();
    let a = spawn_node(&mesh, 5140);
    let relay = spawn_node(&mesh, 5141);
    let target = spawn_node(&mesh, 5142);
    let mut deliveries = target.envelope_deliveries().expect("take receiver");
    let mut relay_deliveries = relay.envelope_deliveries().expect("take receiver");

    a.introduce_to(addr(5141)).await.expect("a->relay");
    target.introduce_to(addr(5141)).await.expect("target->relay");
    wait_for_peer(&a, relay.id()).await;
    wait_for_peer(&relay, target.id()).await;

    let mut handle = a.lookup(target.id()).recursive(true).commit();
    let snapshot = handle.wait().await;
    let peer = snapshot.target_found.expect("target located");

    a.send_sealed(&peer, b"for the target's eyes only").await.expect("send");

    let delivery = timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open");
    assert_eq!(delivery.payload, b"for the target's eyes only");

    // The relay forwarded ciphertext but never received a plaintext.
    let leaked = timeout(Duration::from_millis(300), relay_deliveries.recv()).await;
    assert!(leaked.is_err(), "relay must not decrypt traffic addressed elsewhere");
}

#[tokio::test]
async fn ping_and_address_disclosure_between_strangers() {
    init_tracing();
    let mesh = new_mesh();
    let a = spawn_node(&mesh, 5150);
    let b = spawn_node(&mesh, 5151);

    a.introduce_to(addr(5151)).await.expect("introduce");
    wait_for_peer(&a, b.id()).await;
    let peer_b = a.routing().get_node(&b.id()).await.expect("known");

    timeout(Duration::from_secs(2), a.ping(&peer_b))
        .await
        .expect("pong in time")
        .expect("ping ok");

    let disclosed = timeout(Duration::from_secs(2), a.request_address(&peer_b))
        .await
        .expect("reply in time")
        .expect("disclosure ok");
    assert_eq!(disclosed, addr(5151));
}
