//! Discovery engine.
//!
//! Emits periodic ANNOUNCE broadcasts (with optional jitter so hosts
//! sharing a power-on moment spread out), answers QUERY with a unicast
//! ANNOUNCE, honors GOODBYE, and expires peers that have gone silent.
//! Outbound discovery packets flow through the context-level message
//! queue, so repeated announces coalesce instead of piling up when the
//! main loop falls behind.

use crate::config::Config;
use crate::error::Result;
use crate::events::{DisconnectReason, Event};
use crate::peer::{PeerId, PeerState, MAX_PEERS};
use crate::platform::Platform;
use crate::queue::{MessageQueue, Priority};
use crate::registry::PeerRegistry;
use crate::tick::Ticks;
use peertalk_proto::{DiscoveryKind, DiscoveryPacket, DISCOVERY_MAX_LEN};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Queued discovery packets carry their destination in front of the
/// encoded bytes: four address octets and a big-endian port, all zero
/// for broadcast.
const DEST_HEADER: usize = 6;

/// Capacity of the discovery send queue.
const DISCOVERY_QUEUE_CAP: usize = 8;

const BROADCAST: ([u8; 4], u16) = ([0; 4], 0);

pub(crate) struct DiscoveryEngine {
    enabled: bool,
    last_announce: Ticks,
    next_interval_ms: u32,
    rng: StdRng,
    /// Outgoing discovery packets, drained to the platform each poll.
    pub(crate) queue: MessageQueue,
}

impl DiscoveryEngine {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(DiscoveryEngine {
            enabled: false,
            last_announce: Ticks(0),
            next_interval_ms: config.announce_interval_ms,
            rng: StdRng::seed_from_u64(config.seed),
            queue: MessageQueue::new(DISCOVERY_QUEUE_CAP)?,
        })
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Starts announcing. The first ANNOUNCE goes out on the next poll,
    /// and a QUERY broadcast asks already-running peers to answer
    /// immediately instead of waiting out their own intervals.
    pub(crate) fn start(&mut self, config: &Config, now: Ticks) {
        self.enabled = true;
        self.last_announce = Ticks(now.0.wrapping_sub(self.next_interval_ms));
        self.schedule(config, DiscoveryKind::Query, BROADCAST, now);
        debug!("discovery started");
    }

    /// Stops emission. Ingest stays active: peers that keep announcing
    /// keep refreshing the registry.
    pub(crate) fn stop(&mut self) {
        self.enabled = false;
        debug!("discovery stopped");
    }

    fn coalesce_key(kind: DiscoveryKind, dest: ([u8; 4], u16)) -> u16 {
        // Low byte: packet kind; high byte: destination host. Announces
        // to the same destination collapse to the freshest one.
        kind as u16 | ((dest.0[3] as u16) << 8)
    }

    fn schedule(&mut self, config: &Config, kind: DiscoveryKind, dest: ([u8; 4], u16), now: Ticks) {
        let mut pkt = DiscoveryPacket::new(kind, config.tcp_port, config.transports, &config.name);
        pkt.flags = config.discovery_flags;

        let mut buf = [0u8; DEST_HEADER + DISCOVERY_MAX_LEN];
        buf[..4].copy_from_slice(&dest.0);
        buf[4] = (dest.1 >> 8) as u8;
        buf[5] = (dest.1 & 0xff) as u8;
        let len = match pkt.encode(&mut buf[DEST_HEADER..]) {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "failed to encode discovery packet");
                return;
            }
        };

        let priority = match kind {
            DiscoveryKind::Goodbye => Priority::Critical,
            DiscoveryKind::Announce | DiscoveryKind::Query => Priority::High,
        };
        let key = Self::coalesce_key(kind, dest);
        if let Err(e) = self
            .queue
            .try_push(&buf[..DEST_HEADER + len], priority, 0, key, now)
        {
            warn!(?kind, error = %e, "discovery packet dropped");
        }
    }

    /// Queues the shutdown GOODBYE broadcast.
    pub(crate) fn schedule_goodbye(&mut self, config: &Config, now: Ticks) {
        self.schedule(config, DiscoveryKind::Goodbye, BROADCAST, now);
    }

    /// Periodic work: the jittered ANNOUNCE cadence and the expiry scan
    /// over silent peers.
    pub(crate) fn maintain(
        &mut self,
        config: &Config,
        registry: &mut PeerRegistry,
        events: &mut VecDeque<Event>,
        now: Ticks,
    ) {
        if self.enabled && now.elapsed_since(self.last_announce) >= self.next_interval_ms {
            self.schedule(config, DiscoveryKind::Announce, BROADCAST, now);
            self.last_announce = now;
            self.next_interval_ms = self.jittered_interval(config);
        }

        // Expiry applies to peers discovery is responsible for keeping
        // fresh; connected peers are watched by the keepalive path.
        let stale: SmallVec<[PeerId; MAX_PEERS]> = registry
            .live_ids()
            .filter(|&id| {
                let state = registry.find_by_id(id).map(|h| h.state);
                matches!(state, Some(PeerState::Discovered) | Some(PeerState::Failed))
                    && registry.is_timed_out(id, now, config.peer_timeout_ms)
            })
            .collect();
        for id in stale {
            debug!(peer = %id, "peer expired");
            registry.destroy(id);
            events.push_back(Event::PeerLost(id));
        }
    }

    fn jittered_interval(&mut self, config: &Config) -> u32 {
        let base = config.announce_interval_ms;
        let jitter = config.announce_jitter_ms.min(base.saturating_sub(1));
        if jitter == 0 {
            return base;
        }
        base - jitter + self.rng.gen_range(0..=jitter * 2)
    }

    /// Ingests one received discovery packet.
    pub(crate) fn handle_packet(
        &mut self,
        pkt: &DiscoveryPacket,
        from_addr: [u8; 4],
        from_udp_port: u16,
        config: &Config,
        registry: &mut PeerRegistry,
        events: &mut VecDeque<Event>,
        now: Ticks,
    ) {
        match pkt.kind {
            DiscoveryKind::Announce => {
                let existing = registry.find_by_addr(from_addr, pkt.sender_port);
                let Some(id) = registry.create(&pkt.name, from_addr, pkt.sender_port, now) else {
                    warn!("peer table full, ignoring announcement");
                    return;
                };
                let recovered = registry
                    .find_by_id(id)
                    .map(|h| h.state == PeerState::Failed)
                    .unwrap_or(false);
                if recovered {
                    // Re-announcement recovers a failed peer.
                    let _ = registry.set_state(id, PeerState::Discovered);
                }
                if let Some(hot) = registry.hot_mut(id) {
                    hot.transports_available = pkt.transports;
                }
                if existing.is_none() || recovered {
                    events.push_back(Event::PeerDiscovered(id));
                }
            }
            DiscoveryKind::Query => {
                if self.enabled {
                    // Answer directly to the asker's datagram port.
                    self.schedule(
                        config,
                        DiscoveryKind::Announce,
                        (from_addr, from_udp_port),
                        now,
                    );
                }
            }
            DiscoveryKind::Goodbye => {
                let Some(id) = registry.find_by_addr(from_addr, pkt.sender_port) else {
                    return;
                };
                let state = registry.find_by_id(id).map(|h| h.state);
                match state {
                    Some(PeerState::Connected) | Some(PeerState::Connecting) => {
                        let _ = registry.set_state(id, PeerState::Failed);
                        events.push_back(Event::PeerDisconnected(id, DisconnectReason::Remote));
                    }
                    _ => {
                        registry.destroy(id);
                        events.push_back(Event::PeerLost(id));
                    }
                }
            }
        }
    }

    /// Drains the queued discovery packets to the platform.
    pub(crate) fn flush(&mut self, platform: &mut dyn Platform) {
        let mut buf = [0u8; DEST_HEADER + DISCOVERY_MAX_LEN];
        while let Ok(len) = self.queue.pop_priority(&mut buf) {
            let addr = [buf[0], buf[1], buf[2], buf[3]];
            let port = ((buf[4] as u16) << 8) | buf[5] as u16;
            let pkt = &buf[DEST_HEADER..len];
            let sent = if (addr, port) == BROADCAST {
                platform.udp_broadcast(pkt)
            } else {
                platform.udp_send_to(addr, port, pkt)
            };
            if let Err(e) = sent {
                warn!(error = %e, "discovery send failed");
            }
        }
    }
}
