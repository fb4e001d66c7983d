//! End-to-end scenarios over the in-memory simulated LAN: discovery,
//! messaging, coalescing, backpressure, expiry and teardown between
//! whole PeerTalk contexts.

use peertalk_core::testing::{LanEndpoint, SimulatedLan};
use peertalk_core::{
    Config, DisconnectReason, PeerId, PeerTalk, PeerTalkError, PeerTalkHandler, Priority,
};

#[derive(Default)]
struct Recorder {
    discovered: Vec<(PeerId, Vec<u8>)>,
    lost: Vec<PeerId>,
    connected: Vec<PeerId>,
    disconnected: Vec<(PeerId, DisconnectReason)>,
    messages: Vec<(PeerId, Vec<u8>)>,
}

impl PeerTalkHandler for Recorder {
    fn on_peer_discovered(&mut self, peer: PeerId, name: &[u8]) {
        self.discovered.push((peer, name.to_vec()));
    }
    fn on_peer_lost(&mut self, peer: PeerId) {
        self.lost.push(peer);
    }
    fn on_peer_connected(&mut self, peer: PeerId) {
        self.connected.push(peer);
    }
    fn on_peer_disconnected(&mut self, peer: PeerId, reason: DisconnectReason) {
        self.disconnected.push((peer, reason));
    }
    fn on_message_received(&mut self, peer: PeerId, payload: &[u8]) {
        self.messages.push((peer, payload.to_vec()));
    }
}

const ALICE_ADDR: [u8; 4] = [192, 168, 1, 10];
const BOB_ADDR: [u8; 4] = [192, 168, 1, 11];

fn make_node(lan: &SimulatedLan, addr: [u8; 4], name: &str) -> PeerTalk<LanEndpoint> {
    // RUST_LOG=peertalk_core=debug makes a failing scenario readable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut config = Config::new(name);
    config.set_max_peers(8);
    config.set_announce_interval_ms(200);
    config.set_peer_timeout_ms(1_000);
    PeerTalk::new(config, lan.endpoint(addr)).unwrap()
}

fn id_by_name(node: &PeerTalk<LanEndpoint>, name: &[u8]) -> Option<PeerId> {
    let mut ids = [PeerId::INVALID; 8];
    let n = node.peers(&mut ids);
    ids[..n].iter().copied().find(|&id| {
        node.peer_by_id(id)
            .and_then(|info| node.peer_name(info.name_idx))
            .map(|stored| stored == name)
            .unwrap_or(false)
    })
}

/// Drives both nodes for `iters` passes at a 50 ms cadence.
fn run(
    lan: &SimulatedLan,
    a: &mut PeerTalk<LanEndpoint>,
    ha: &mut Recorder,
    b: &mut PeerTalk<LanEndpoint>,
    hb: &mut Recorder,
    iters: usize,
) {
    for _ in 0..iters {
        a.poll(ha);
        b.poll(hb);
        lan.advance(50);
    }
}

/// Discovery plus both recorders, the starting point of most scenarios.
fn discovered_pair(
    lan: &SimulatedLan,
) -> (
    PeerTalk<LanEndpoint>,
    Recorder,
    PeerTalk<LanEndpoint>,
    Recorder,
) {
    let mut a = make_node(lan, ALICE_ADDR, "Alice");
    let mut b = make_node(lan, BOB_ADDR, "Bob");
    a.start_discovery();
    b.start_discovery();
    let mut ha = Recorder::default();
    let mut hb = Recorder::default();
    // Discovery is expected to complete within five announce intervals.
    run(lan, &mut a, &mut ha, &mut b, &mut hb, 20);
    (a, ha, b, hb)
}

/// Connects A to B on top of a discovered pair.
fn connected_pair(
    lan: &SimulatedLan,
) -> (
    PeerTalk<LanEndpoint>,
    Recorder,
    PeerTalk<LanEndpoint>,
    Recorder,
    PeerId,
    PeerId,
) {
    let (mut a, mut ha, mut b, mut hb) = discovered_pair(lan);
    let bob = id_by_name(&a, b"Bob").expect("Alice knows Bob");
    a.connect(bob).unwrap();
    run(lan, &mut a, &mut ha, &mut b, &mut hb, 6);
    let alice = id_by_name(&b, b"Alice").expect("Bob knows Alice");
    assert!(ha.connected.contains(&bob));
    assert!(hb.connected.contains(&alice));
    (a, ha, b, hb, bob, alice)
}

#[test]
fn test_s1_discovery_round_trip() {
    let lan = SimulatedLan::new();
    let (a, ha, b, hb) = discovered_pair(&lan);

    assert!(
        ha.discovered.iter().any(|(_, name)| name == b"Bob"),
        "Alice must discover Bob within five announce intervals"
    );
    assert!(
        hb.discovered.iter().any(|(_, name)| name == b"Alice"),
        "Bob must discover Alice within five announce intervals"
    );

    // The ids resolve through the public lookup surface too.
    assert!(id_by_name(&a, b"Bob").is_some());
    assert!(id_by_name(&b, b"Alice").is_some());
    assert!(a.peers_version() > 0);
}

#[test]
fn test_s2_tcp_messaging() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, alice) = connected_pair(&lan);

    a.send(bob, b"hello\0").unwrap();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 4);

    assert!(
        hb.messages
            .iter()
            .any(|(from, payload)| *from == alice && payload == b"hello\0"),
        "Bob must receive Alice's greeting with the trailing NUL intact"
    );
}

#[test]
fn test_s3_coalescing_delivers_latest_position() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, alice) = connected_pair(&lan);
    let before = hb.messages.len();

    // Position updates share one key: type in the low byte, peer id in
    // the high byte.
    let key = 0x01u16 | (bob.0 << 8);
    for i in 1..=10 {
        let payload = format!("pos:{}", i);
        a.send_ex(bob, payload.as_bytes(), 0, Priority::Normal, key)
            .unwrap();
    }
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 4);

    let received: Vec<&Vec<u8>> = hb.messages[before..]
        .iter()
        .filter(|(from, _)| *from == alice)
        .map(|(_, p)| p)
        .collect();
    assert!(
        !received.is_empty() && received.len() <= 10,
        "between one and ten position updates may arrive, got {}",
        received.len()
    );
    assert_eq!(
        received.last().unwrap().as_slice(),
        b"pos:10",
        "the final state must win"
    );
}

#[test]
fn test_s4_backpressure_under_overload() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, _alice) = connected_pair(&lan);

    // 32 low-priority sends with no poll in between: the 16-slot queue
    // takes the first half and refuses the rest.
    let mut accepted = 0;
    let mut refused = 0;
    for i in 0..32 {
        let payload = format!("m{}", i);
        match a.send_ex(bob, payload.as_bytes(), 0, Priority::Low, 0) {
            Ok(()) => accepted += 1,
            Err(PeerTalkError::BufferFull) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 16);
    assert_eq!(refused, 16);

    // Draining the queue restores capacity.
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 4);
    a.send(bob, b"after drain").unwrap();
}

#[test]
fn test_s5_peer_expiry_after_silent_exit() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, b, _hb) = discovered_pair(&lan);
    let bob = id_by_name(&a, b"Bob").expect("discovered");

    // Bob exits ungracefully: no GOODBYE, no more polls.
    drop(b);
    let mut null = Recorder::default();
    for _ in 0..30 {
        a.poll(&mut null);
        lan.advance(50);
    }

    assert!(
        null.lost.contains(&bob) || ha.lost.contains(&bob),
        "Alice must report Bob lost after the peer timeout"
    );
    assert!(a.peer_by_id(bob).is_none(), "the slot is reclaimed");
}

#[test]
fn test_s6_graceful_disconnect() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, alice) = connected_pair(&lan);

    a.disconnect(bob).unwrap();
    // The slot is tearing down; sends are refused immediately.
    assert_eq!(a.send(bob, b"too late").unwrap_err(), PeerTalkError::NotConnected);

    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 6);

    assert!(
        ha.disconnected
            .iter()
            .any(|&(id, reason)| id == bob && reason == DisconnectReason::Requested),
        "the initiator reports the requested disconnect"
    );
    assert!(
        hb.disconnected
            .iter()
            .any(|&(id, reason)| id == alice && reason == DisconnectReason::Remote),
        "the other side reports a remote disconnect"
    );

    // Whatever discovery has done since (the peers still announce), the
    // old connection is gone.
    match a.peer_by_id(bob) {
        None => {}
        Some(info) => assert_ne!(info.state, peertalk_core::PeerState::Connected),
    }
    let err = a.send(bob, b"x").unwrap_err();
    assert!(
        matches!(err, PeerTalkError::NotConnected | PeerTalkError::PeerNotFound),
        "unexpected error after disconnect: {err}"
    );
}

#[test]
fn test_shutdown_broadcasts_goodbye() {
    let lan = SimulatedLan::new();
    let (mut a, _ha, mut b, mut hb) = discovered_pair(&lan);
    let alice = id_by_name(&b, b"Alice").expect("discovered");

    a.shutdown();
    // Alice is gone; only Bob keeps polling.
    for _ in 0..4 {
        b.poll(&mut hb);
        lan.advance(50);
    }

    assert!(
        hb.lost.contains(&alice),
        "GOODBYE must remove the departing peer immediately, not by timeout"
    );
    assert!(b.peer_by_id(alice).is_none());
}

#[test]
fn test_keepalive_measures_rtt_on_idle_connection() {
    let lan = SimulatedLan::new();
    let mut a = make_node(&lan, ALICE_ADDR, "Alice");
    let mut b = make_node(&lan, BOB_ADDR, "Bob");
    a.start_discovery();
    b.start_discovery();
    let mut ha = Recorder::default();
    let mut hb = Recorder::default();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 20);

    let bob = id_by_name(&a, b"Bob").unwrap();
    a.connect(bob).unwrap();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 6);

    // Silence the announcements so last_seen actually ages, then idle
    // past the default keepalive interval: PING goes out, PONG comes
    // back, and an RTT sample lands in the cold stats.
    a.stop_discovery();
    b.stop_discovery();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 150);
    assert!(
        a.peer_rtt_ms(bob).is_some(),
        "an idle connection must be kept alive and measured"
    );
    assert!(
        ha.disconnected.is_empty(),
        "keepalive must not tear the link down while the peer answers"
    );
}

#[test]
fn test_unreliable_send_uses_datagram_path() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, alice) = connected_pair(&lan);

    a.send_ex(
        bob,
        b"lossy state",
        peertalk_proto::MSG_FLAG_UNRELIABLE,
        Priority::Normal,
        0,
    )
    .unwrap();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 4);

    assert!(
        hb.messages
            .iter()
            .any(|(from, payload)| *from == alice && payload == b"lossy state"),
        "the datagram path must still deliver to the message callback"
    );
}

#[test]
fn test_disconnect_then_reconnect() {
    let lan = SimulatedLan::new();
    let (mut a, mut ha, mut b, mut hb, bob, _alice) = connected_pair(&lan);

    a.disconnect(bob).unwrap();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 8);

    // Both sides keep announcing, so Bob is discoverable again.
    let bob_again = id_by_name(&a, b"Bob").expect("rediscovered after teardown");
    a.connect(bob_again).unwrap();
    let connected_before = ha.connected.len();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 6);
    assert!(
        ha.connected.len() > connected_before,
        "a fresh connection must succeed after a graceful disconnect"
    );

    a.send(bob_again, b"round two").unwrap();
    run(&lan, &mut a, &mut ha, &mut b, &mut hb, 4);
    assert!(hb
        .messages
        .iter()
        .any(|(_, payload)| payload == b"round two"));
}
