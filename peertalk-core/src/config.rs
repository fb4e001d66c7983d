//! Context configuration.

use crate::peer::{MAX_PEERS, MAX_PEER_NAME, TRANSPORT_TCP, TRANSPORT_UDP};
use crate::queue::SLOT_DATA_SIZE;

/// Default discovery datagram port.
pub const DEFAULT_UDP_PORT: u16 = 4242;
/// Default stream listening port.
pub const DEFAULT_TCP_PORT: u16 = 4243;
/// Default ANNOUNCE period, milliseconds.
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u32 = 2_000;
/// Default silence after which a discovered peer is expired
/// (five announce intervals).
pub const DEFAULT_PEER_TIMEOUT_MS: u32 = 10_000;
/// Default outbound connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u32 = 30_000;
/// Default orderly-close timeout on a LAN.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u32 = 3_000;
/// Default idle period before a keepalive PING.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u32 = 5_000;
/// Default per-peer send queue capacity (power of two).
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Settings for a [`crate::PeerTalk`] context, mutated through `set_*`
/// methods before construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) name: Vec<u8>,
    pub(crate) max_peers: usize,
    pub(crate) transports: u8,
    pub(crate) udp_port: u16,
    pub(crate) tcp_port: u16,
    pub(crate) discovery_flags: u16,
    pub(crate) announce_interval_ms: u32,
    pub(crate) announce_jitter_ms: u32,
    pub(crate) peer_timeout_ms: u32,
    pub(crate) connect_timeout_ms: u32,
    pub(crate) close_timeout_ms: u32,
    pub(crate) keepalive_interval_ms: u32,
    pub(crate) queue_capacity: usize,
    pub(crate) max_payload: usize,
    pub(crate) seed: u64,
}

impl Config {
    /// A configuration with the given local name and LAN defaults.
    /// The name is truncated to the wire limit.
    pub fn new(name: &str) -> Self {
        let mut bytes = name.as_bytes().to_vec();
        bytes.truncate(MAX_PEER_NAME);
        Config {
            name: bytes,
            max_peers: 8,
            transports: TRANSPORT_TCP | TRANSPORT_UDP,
            udp_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            discovery_flags: peertalk_proto::DISC_FLAG_ACCEPTING,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            announce_jitter_ms: 0,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_payload: SLOT_DATA_SIZE,
            seed: 0,
        }
    }

    pub fn set_max_peers(&mut self, max: usize) {
        self.max_peers = max.clamp(1, MAX_PEERS);
    }

    pub fn set_transports(&mut self, mask: u8) {
        self.transports = mask;
    }

    pub fn set_udp_port(&mut self, port: u16) {
        self.udp_port = port;
    }

    pub fn set_tcp_port(&mut self, port: u16) {
        self.tcp_port = port;
    }

    /// Discovery flag bits advertised in every ANNOUNCE (HOST,
    /// ACCEPTING, SPECTATOR, READY plus the application byte).
    pub fn set_discovery_flags(&mut self, flags: u16) {
        self.discovery_flags = flags;
    }

    pub fn set_announce_interval_ms(&mut self, ms: u32) {
        self.announce_interval_ms = ms.max(1);
    }

    /// Random spread applied around the announce interval so hosts
    /// sharing a power-on moment do not announce in lockstep.
    pub fn set_announce_jitter_ms(&mut self, ms: u32) {
        self.announce_jitter_ms = ms;
    }

    pub fn set_peer_timeout_ms(&mut self, ms: u32) {
        self.peer_timeout_ms = ms;
    }

    pub fn set_connect_timeout_ms(&mut self, ms: u32) {
        self.connect_timeout_ms = ms;
    }

    pub fn set_close_timeout_ms(&mut self, ms: u32) {
        self.close_timeout_ms = ms;
    }

    pub fn set_keepalive_interval_ms(&mut self, ms: u32) {
        self.keepalive_interval_ms = ms;
    }

    /// Per-peer send queue capacity. Must be a power of two no larger
    /// than [`crate::queue::MAX_QUEUE_SLOTS`]; validated at context
    /// construction.
    pub fn set_queue_capacity(&mut self, capacity: usize) {
        self.queue_capacity = capacity;
    }

    /// Largest payload accepted by `send`. Bounded by the queue slot
    /// size.
    pub fn set_max_payload(&mut self, bytes: usize) {
        self.max_payload = bytes.clamp(1, SLOT_DATA_SIZE);
    }

    /// Seed for the announce jitter generator; fixed seeds give
    /// reproducible schedules in tests.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }
}
