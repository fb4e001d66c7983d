//! The PeerTalk context and its cooperative poll loop.
//!
//! One context owns the registry, the per-peer queues and pipelines,
//! the discovery engine and the platform. Everything advances inside
//! [`PeerTalk::poll`], which never blocks: every platform call is
//! non-blocking and every completion is observed by polling. The
//! application calls `poll` often enough to keep the queues drained
//! (20–50 ms is typical) and receives its callbacks synchronously from
//! inside it.

use crate::config::Config;
use crate::connection::extract_frames;
use crate::discovery::DiscoveryEngine;
use crate::error::{PeerTalkError, Result};
use crate::events::{DisconnectReason, Event, PeerTalkHandler};
use crate::peer::{FrameBuf, PeerId, PeerState, IBUF_SIZE, MAX_PEERS, OBUF_SIZE, TRANSPORT_TCP};
use crate::pipeline::SendPipeline;
use crate::platform::{ConnId, ConnectStatus, Platform};
use crate::queue::{Backpressure, MessageQueue, Priority};
use crate::registry::PeerRegistry;
use crate::tick::Ticks;
use peertalk_proto::{
    encode_frame, udp_decode, udp_encode, DiscoveryPacket, MessageKind, DISCOVERY_MAGIC,
    MSG_FLAG_UNRELIABLE, UDP_MAGIC,
};
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Snapshot of a peer's hot record for reporting.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub id: PeerId,
    pub state: PeerState,
    pub addr: [u8; 4],
    pub port: u16,
    /// Index for [`PeerTalk::peer_name`] lookups.
    pub name_idx: u16,
    pub transports_available: u8,
    pub transport_connected: u8,
}

/// Per-peer working storage: the send queue, the pipeline (present only
/// while connected), the stream handle and the fixed framing buffers.
pub(crate) struct PeerBuffers {
    pub(crate) send_queue: MessageQueue,
    pipeline: Option<SendPipeline>,
    conn: Option<ConnId>,
    ibuf: FrameBuf<IBUF_SIZE>,
    obuf: FrameBuf<OBUF_SIZE>,
    /// Set (without logging) when a canary check fails, so even
    /// restricted callers can notice a prior corruption cheaply.
    canary_corrupt: bool,
    /// Tick of the outstanding keepalive PING; zero when none.
    ping_sent: Ticks,
    /// A PING arrived; answer with PONG on the next send pass.
    pending_pong: bool,
}

impl PeerBuffers {
    fn new(queue_capacity: usize) -> Result<Self> {
        Ok(PeerBuffers {
            send_queue: MessageQueue::new(queue_capacity)?,
            pipeline: None,
            conn: None,
            ibuf: FrameBuf::new(),
            obuf: FrameBuf::new(),
            canary_corrupt: false,
            ping_sent: Ticks(0),
            pending_pong: false,
        })
    }

    fn reset(&mut self) {
        self.send_queue.clear();
        self.pipeline = None;
        self.conn = None;
        self.ibuf.clear();
        self.obuf.clear();
        self.canary_corrupt = false;
        self.ping_sent = Ticks(0);
        self.pending_pong = false;
    }

    /// Verifies the canary words bracketing both framing buffers.
    fn check_canaries(&mut self) -> bool {
        if !self.ibuf.canaries_ok() || !self.obuf.canaries_ok() {
            self.canary_corrupt = true;
        }
        !self.canary_corrupt
    }
}

pub struct PeerTalk<P: Platform> {
    config: Config,
    platform: P,
    registry: PeerRegistry,
    /// Indexed by `PeerId - 1`, parallel to the registry slots.
    bufs: Vec<PeerBuffers>,
    discovery: DiscoveryEngine,
    events: VecDeque<Event>,
}

impl<P: Platform> PeerTalk<P> {
    /// Builds a context: binds the platform's ports and pre-allocates
    /// every queue and table. No allocation happens per message after
    /// this point.
    pub fn new(config: Config, mut platform: P) -> Result<Self> {
        if config.name.is_empty() {
            return Err(PeerTalkError::InvalidParam);
        }
        if config.max_peers == 0 || config.max_peers > MAX_PEERS {
            return Err(PeerTalkError::InvalidParam);
        }
        platform.bind(config.udp_port, config.tcp_port)?;
        let registry = PeerRegistry::new(config.max_peers)?;
        let bufs = (0..config.max_peers)
            .map(|_| PeerBuffers::new(config.queue_capacity))
            .collect::<Result<Vec<_>>>()?;
        let discovery = DiscoveryEngine::new(&config)?;
        Ok(PeerTalk {
            config,
            platform,
            registry,
            bufs,
            discovery,
            events: VecDeque::new(),
        })
    }

    #[inline]
    fn buf_index(id: PeerId) -> usize {
        id.0 as usize - 1
    }

    pub fn local_name(&self) -> &[u8] {
        &self.config.name
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.enabled()
    }

    pub fn start_discovery(&mut self) {
        let now = self.platform.ticks();
        self.discovery.start(&self.config, now);
    }

    pub fn stop_discovery(&mut self) {
        self.discovery.stop();
    }

    /// Live peer ids copied into `out`; returns how many were written.
    pub fn peers(&self, out: &mut [PeerId]) -> usize {
        let mut n = 0;
        for id in self.registry.live_ids() {
            if n == out.len() {
                break;
            }
            out[n] = id;
            n += 1;
        }
        n
    }

    pub fn peer_by_id(&self, id: PeerId) -> Option<PeerInfo> {
        self.registry.find_by_id(id).map(|h| PeerInfo {
            id: h.id,
            state: h.state,
            addr: h.addr,
            port: h.port,
            name_idx: h.name_idx,
            transports_available: h.transports_available,
            transport_connected: h.transport_connected,
        })
    }

    /// Indexed name lookup (hot records carry only the index).
    pub fn peer_name(&self, name_idx: u16) -> Option<&[u8]> {
        self.registry.name(name_idx)
    }

    /// Changes whenever a peer is added, removed or renamed.
    pub fn peers_version(&self) -> u32 {
        self.registry.version()
    }

    /// Average round-trip time to a connected peer, if measured yet.
    pub fn peer_rtt_ms(&self, id: PeerId) -> Option<u32> {
        self.registry.cold(id).and_then(|c| c.rtt.average())
    }

    /// Current fill level of a peer's send queue.
    pub fn backpressure(&self, id: PeerId) -> Result<Backpressure> {
        self.registry
            .find_by_id(id)
            .ok_or(PeerTalkError::PeerNotFound)?;
        Ok(self.bufs[Self::buf_index(id)].send_queue.backpressure())
    }

    /// Initiates an outbound connection to a discovered (or failed)
    /// peer. Completion is observed by `poll`; success fires
    /// `on_peer_connected`, expiry of the connect timeout fails the
    /// peer.
    pub fn connect(&mut self, id: PeerId) -> Result<()> {
        let hot = self
            .registry
            .find_by_id(id)
            .ok_or(PeerTalkError::PeerNotFound)?;
        let (addr, port, state) = (hot.addr, hot.port, hot.state);
        match state {
            PeerState::Discovered => {}
            PeerState::Failed => {
                // Recovery path: FAILED -> DISCOVERED -> CONNECTING.
                self.registry.set_state(id, PeerState::Discovered)?;
            }
            _ => return Err(PeerTalkError::InvalidParam),
        }
        let now = self.platform.ticks();
        let conn = self.platform.connect(addr, port)?;
        self.registry.set_state(id, PeerState::Connecting)?;
        if let Some(hot) = self.registry.hot_mut(id) {
            hot.connect_start = now;
        }
        self.bufs[Self::buf_index(id)].conn = Some(conn);
        Ok(())
    }

    /// Orderly disconnect: tells the peer, then closes. The slot is
    /// reclaimed once the platform reports close completion.
    pub fn disconnect(&mut self, id: PeerId) -> Result<()> {
        let hot = self
            .registry
            .find_by_id(id)
            .ok_or(PeerTalkError::PeerNotFound)?;
        if hot.state != PeerState::Connected {
            return Err(PeerTalkError::NotConnected);
        }
        let idx = Self::buf_index(id);
        let seq = self.next_seq(id);
        if let Some(conn) = self.bufs[idx].conn {
            let storage = self.bufs[idx].obuf.storage_mut();
            if let Ok(len) = encode_frame(MessageKind::Disconnect, 0, seq, &[], &mut storage[..]) {
                let _ = self.platform.stream_send(conn, &storage[..len]);
            }
        }
        self.registry.set_state(id, PeerState::Disconnecting)?;
        self.events
            .push_back(Event::PeerDisconnected(id, DisconnectReason::Requested));
        if let Some(conn) = self.bufs[idx].conn {
            self.platform.close(conn);
        }
        Ok(())
    }

    /// Queues `data` for a connected peer at NORMAL priority.
    pub fn send(&mut self, id: PeerId, data: &[u8]) -> Result<()> {
        self.send_ex(id, data, 0, Priority::Normal, 0)
    }

    /// Queues `data` with explicit wire flags, priority and coalesce
    /// key. A non-zero key lets a newer payload replace a queued one;
    /// the recommended key pattern is message type in the low byte and
    /// peer id in the high byte.
    pub fn send_ex(
        &mut self,
        id: PeerId,
        data: &[u8],
        flags: u8,
        priority: Priority,
        coalesce_key: u16,
    ) -> Result<()> {
        if data.len() > self.config.max_payload {
            return Err(PeerTalkError::InvalidParam);
        }
        let hot = self
            .registry
            .find_by_id(id)
            .ok_or(PeerTalkError::PeerNotFound)?;
        if hot.state != PeerState::Connected {
            return Err(PeerTalkError::NotConnected);
        }
        let now = self.platform.ticks();
        let queue = &mut self.bufs[Self::buf_index(id)].send_queue;
        if coalesce_key != 0 {
            queue
                .push_coalesce(data, priority, flags, coalesce_key, now)
                .map(|_| ())
        } else {
            queue.push(data, priority, flags, now)
        }
    }

    /// The only send entry point valid from interrupt or deferred-task
    /// context. Performs plain copies into pre-allocated storage, never
    /// reads the clock and never logs; anything noteworthy is recorded
    /// in the queue's flags and logged by the next `poll`.
    pub fn send_isr(
        &mut self,
        id: PeerId,
        data: &[u8],
        priority: Priority,
        flags: u8,
        coalesce_key: u16,
    ) -> Result<()> {
        let hot = self
            .registry
            .find_by_id(id)
            .ok_or(PeerTalkError::PeerNotFound)?;
        if hot.state != PeerState::Connected {
            return Err(PeerTalkError::NotConnected);
        }
        self.bufs[Self::buf_index(id)]
            .send_queue
            .push_coalesce_isr(data, priority, flags, coalesce_key)
            .map(|_| ())
    }

    fn next_seq(&mut self, id: PeerId) -> u8 {
        match self.registry.hot_mut(id) {
            Some(hot) => {
                let seq = hot.send_seq;
                hot.send_seq = hot.send_seq.wrapping_add(1);
                seq
            }
            None => 0,
        }
    }

    /// One pass of the cooperative loop. Never blocks. Application
    /// callbacks fire synchronously near the end of the call, from the
    /// main loop, and may call back into any public API.
    pub fn poll<H: PeerTalkHandler>(&mut self, handler: &mut H) {
        let now = self.platform.ticks();
        self.drain_isr_flags();
        self.sweep_stale_resources();
        self.poll_close_completions();
        self.poll_accepts(now);
        self.poll_connects(now);
        self.poll_receives(now, handler);
        self.poll_pipelines();
        self.drain_send_queues();
        self.poll_udp(now, handler);
        self.keepalive(now);
        let PeerTalk {
            discovery,
            config,
            registry,
            events,
            platform,
            ..
        } = self;
        discovery.maintain(config, registry, events, now);
        discovery.flush(platform);
        self.dispatch_events(handler);
    }

    /// Step 1: observe and log conditions recorded by interrupt-context
    /// producers since the last pass.
    fn drain_isr_flags(&mut self) {
        self.discovery.queue.check_isr_flags();
        for buf in self.bufs.iter_mut() {
            buf.send_queue.check_isr_flags();
        }
    }

    /// Frees leftovers that no longer match a peer's state: stream
    /// handles of failed peers, and pipelines of peers that recovered
    /// to DISCOVERED via re-announcement.
    fn sweep_stale_resources(&mut self) {
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let Some(state) = self.registry.find_by_id(id).map(|h| h.state) else {
                continue;
            };
            let idx = Self::buf_index(id);
            match state {
                PeerState::Failed => {
                    // Drop the dead stream; the pipeline keeps its
                    // buffers until completions are observed.
                    let buf = &mut self.bufs[idx];
                    if let Some(conn) = buf.conn.take() {
                        if let Some(pipeline) = buf.pipeline.as_mut() {
                            pipeline.poll_completions(&mut self.platform, conn);
                        }
                        self.platform.close(conn);
                    }
                }
                PeerState::Discovered => {
                    let buf = &mut self.bufs[idx];
                    if buf.pipeline.is_some() || buf.conn.is_some() {
                        if let (Some(pipeline), Some(conn)) = (buf.pipeline.as_mut(), buf.conn) {
                            pipeline.cleanup(&mut self.platform, conn, 0);
                        }
                        buf.reset();
                    }
                }
                _ => {}
            }
        }
    }

    /// Step 2: reclaim DISCONNECTING peers whose close completed.
    fn poll_close_completions(&mut self) {
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let disconnecting = self
                .registry
                .find_by_id(id)
                .map(|h| h.state == PeerState::Disconnecting)
                .unwrap_or(false);
            if !disconnecting {
                continue;
            }
            let idx = Self::buf_index(id);
            let complete = match self.bufs[idx].conn {
                Some(conn) => self.platform.close_status(conn),
                None => true,
            };
            if !complete {
                continue;
            }
            let close_timeout = self.config.close_timeout_ms;
            let buf = &mut self.bufs[idx];
            if let (Some(pipeline), Some(conn)) = (buf.pipeline.as_mut(), buf.conn) {
                pipeline.cleanup(&mut self.platform, conn, close_timeout);
            }
            self.registry.destroy(id);
            self.bufs[idx].reset();
        }
    }

    /// Inbound connections. The listener is drained to empty before any
    /// payload work happens, keeping the accept gap small.
    fn poll_accepts(&mut self, now: Ticks) {
        let mut accepted: SmallVec<[(ConnId, [u8; 4], u16); 8]> = SmallVec::new();
        loop {
            match self.platform.accept() {
                Ok(Some(entry)) => accepted.push(entry),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        for (conn, addr, port) in accepted {
            self.admit_inbound(conn, addr, port, now);
        }
    }

    fn admit_inbound(&mut self, conn: ConnId, addr: [u8; 4], port: u16, now: Ticks) {
        let id = match self.registry.find_by_addr(addr, port) {
            Some(id) => id,
            None => match self.registry.create(b"", addr, port, now) {
                Some(id) => {
                    // Never announced; the name arrives with its first
                    // ANNOUNCE.
                    self.events.push_back(Event::PeerDiscovered(id));
                    id
                }
                None => {
                    warn!("peer table full, refusing inbound connection");
                    self.platform.close(conn);
                    return;
                }
            },
        };
        let state = self.registry.find_by_id(id).map(|h| h.state);
        match state {
            Some(PeerState::Discovered) => {}
            Some(PeerState::Failed) => {
                // A working inbound stream is as good as a fresh
                // announcement.
                let _ = self.registry.set_state(id, PeerState::Discovered);
            }
            Some(PeerState::Connecting) => {
                // Simultaneous connect: prefer the inbound stream.
                if let Some(old) = self.bufs[Self::buf_index(id)].conn.take() {
                    self.platform.close(old);
                }
            }
            _ => {
                // Already connected or tearing down: refuse the
                // duplicate.
                self.platform.close(conn);
                return;
            }
        }
        if self.registry.set_state(id, PeerState::Connected).is_err() {
            self.platform.close(conn);
            return;
        }
        self.enter_connected(id, conn, now);
    }

    /// Shared CONNECTED entry: pipeline allocation and bookkeeping.
    fn enter_connected(&mut self, id: PeerId, conn: ConnId, now: Ticks) {
        let idx = Self::buf_index(id);
        self.bufs[idx].conn = Some(conn);
        self.bufs[idx].pipeline = Some(SendPipeline::new(self.config.max_payload));
        self.bufs[idx].ping_sent = Ticks(0);
        if let Some(hot) = self.registry.hot_mut(id) {
            hot.transport_connected |= TRANSPORT_TCP;
            hot.last_seen = now;
        }
        self.events.push_back(Event::PeerConnected(id));
    }

    /// Outbound connection progress and the connect timeout.
    fn poll_connects(&mut self, now: Ticks) {
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let Some(hot) = self.registry.find_by_id(id) else {
                continue;
            };
            if hot.state != PeerState::Connecting {
                continue;
            }
            let connect_start = hot.connect_start;
            let idx = Self::buf_index(id);
            let Some(conn) = self.bufs[idx].conn else {
                continue;
            };
            match self.platform.connect_status(conn) {
                ConnectStatus::Ready => {
                    if self.registry.set_state(id, PeerState::Connected).is_ok() {
                        self.enter_connected(id, conn, now);
                    }
                }
                ConnectStatus::Failed => {
                    self.fail_peer(id, DisconnectReason::Error);
                }
                ConnectStatus::InProgress => {
                    if now.elapsed_since(connect_start) > self.config.connect_timeout_ms {
                        debug!(peer = %id, "connect timed out");
                        self.fail_peer(id, DisconnectReason::Timeout);
                    }
                }
            }
        }
    }

    /// Marks a peer FAILED, closes its stream and reports the
    /// disconnect. In-flight pipeline sends are abandoned in place;
    /// their buffers stay owned by the slots.
    fn fail_peer(&mut self, id: PeerId, reason: DisconnectReason) {
        let Some(state) = self.registry.find_by_id(id).map(|h| h.state) else {
            return;
        };
        if self.registry.set_state(id, PeerState::Failed).is_err() {
            return;
        }
        if let Some(conn) = self.bufs[Self::buf_index(id)].conn.take() {
            self.platform.close(conn);
        }
        if matches!(state, PeerState::Connecting | PeerState::Connected) {
            self.events.push_back(Event::PeerDisconnected(id, reason));
        }
    }

    /// Step 3: drain each connected peer's stream, assemble frames and
    /// dispatch them. Message payloads go to the handler right here.
    fn poll_receives<H: PeerTalkHandler>(&mut self, now: Ticks, handler: &mut H) {
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let connected = self
                .registry
                .find_by_id(id)
                .map(|h| h.state == PeerState::Connected)
                .unwrap_or(false);
            if !connected {
                continue;
            }
            let idx = Self::buf_index(id);
            let Some(conn) = self.bufs[idx].conn else {
                continue;
            };

            let mut remote_gone = false;
            loop {
                let want = self.bufs[idx].ibuf.remaining();
                if want == 0 {
                    // A valid partial frame always leaves room; a full
                    // buffer means the stream is garbage.
                    warn!(peer = %id, "input buffer full without a frame, resetting");
                    self.bufs[idx].ibuf.clear();
                    continue;
                }
                let mut tmp = [0u8; 256];
                let want = want.min(tmp.len());
                match self.platform.stream_recv(conn, &mut tmp[..want]) {
                    Ok(None) => break,
                    Ok(Some(0)) => {
                        remote_gone = true;
                        break;
                    }
                    Ok(Some(n)) => {
                        self.bufs[idx].ibuf.extend(&tmp[..n]);
                    }
                    Err(e) => {
                        debug!(peer = %id, error = %e, "stream receive failed");
                        remote_gone = true;
                        break;
                    }
                }
            }

            if !self.bufs[idx].check_canaries() {
                warn!(peer = %id, "framing buffer canary corrupted");
            }

            let desync = {
                let PeerTalk {
                    registry,
                    bufs,
                    events,
                    platform,
                    ..
                } = self;
                let PeerBuffers {
                    ibuf,
                    conn: conn_slot,
                    ping_sent,
                    pending_pong,
                    ..
                } = &mut bufs[idx];
                extract_frames(ibuf, |hdr, payload| {
                    if let Some(hot) = registry.hot_mut(id) {
                        hot.last_seen = now;
                        hot.recv_seq = hdr.seq;
                    }
                    match hdr.kind {
                        MessageKind::Data => {
                            if let Some(cold) = registry.cold_mut(id) {
                                cold.stats.msgs_received += 1;
                                cold.stats.bytes_received += payload.len() as u64;
                            }
                            handler.on_message_received(id, payload);
                        }
                        MessageKind::Ping => {
                            *pending_pong = true;
                        }
                        MessageKind::Pong => {
                            if *ping_sent != Ticks(0) {
                                let rtt = now.elapsed_since(*ping_sent);
                                if let Some(cold) = registry.cold_mut(id) {
                                    cold.rtt.record(rtt);
                                }
                                *ping_sent = Ticks(0);
                            }
                        }
                        MessageKind::Disconnect => {
                            if registry.set_state(id, PeerState::Disconnecting).is_ok() {
                                events.push_back(Event::PeerDisconnected(
                                    id,
                                    DisconnectReason::Remote,
                                ));
                                if let Some(c) = conn_slot.take() {
                                    platform.close(c);
                                }
                            }
                        }
                        MessageKind::Ack => {
                            debug!(peer = %id, seq = hdr.seq, "acknowledged");
                        }
                        MessageKind::Reject => {
                            if registry.set_state(id, PeerState::Failed).is_ok() {
                                events.push_back(Event::PeerDisconnected(
                                    id,
                                    DisconnectReason::Error,
                                ));
                                if let Some(c) = conn_slot.take() {
                                    platform.close(c);
                                }
                            }
                        }
                    }
                })
                .is_err()
            };
            if desync {
                warn!(peer = %id, "stream desynchronized, resetting input buffer");
                self.bufs[idx].ibuf.clear();
            }
            if remote_gone {
                // EOF without a DISCONNECT frame is an abrupt exit.
                self.fail_peer(id, DisconnectReason::Error);
            }
        }
    }

    /// Step 4: observe asynchronous send completions.
    fn poll_pipelines(&mut self) {
        let PeerTalk {
            registry,
            bufs,
            platform,
            ..
        } = self;
        for hot in registry.live_ids().filter_map(|id| registry.find_by_id(id)) {
            if hot.state != PeerState::Connected {
                continue;
            }
            let buf = &mut bufs[hot.id.0 as usize - 1];
            if let (Some(pipeline), Some(conn)) = (buf.pipeline.as_mut(), buf.conn) {
                pipeline.poll_completions(platform, conn);
            }
        }
    }

    /// Step 5: move queued outbound messages into the pipeline, falling
    /// back to the synchronous path when every slot is busy.
    fn drain_send_queues(&mut self) {
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let connected = self
                .registry
                .find_by_id(id)
                .map(|h| h.state == PeerState::Connected)
                .unwrap_or(false);
            if !connected {
                continue;
            }
            let idx = Self::buf_index(id);
            if self.bufs[idx].conn.is_none() {
                continue;
            }

            if self.bufs[idx].pending_pong {
                let seq = self.next_seq(id);
                let buf = &mut self.bufs[idx];
                let conn = buf.conn.expect("checked above");
                let sent = match buf.pipeline.as_mut() {
                    Some(p) if p.slots_available() > 0 => p
                        .send_async(&mut self.platform, conn, MessageKind::Pong, 0, seq, &[])
                        .is_ok(),
                    _ => {
                        let storage = buf.obuf.storage_mut();
                        match encode_frame(MessageKind::Pong, 0, seq, &[], &mut storage[..]) {
                            Ok(len) => self.platform.stream_send(conn, &storage[..len]).is_ok(),
                            Err(_) => false,
                        }
                    }
                };
                if sent {
                    buf.pending_pong = false;
                }
            }

            let peer_addr = self
                .registry
                .find_by_id(id)
                .map(|h| h.addr)
                .expect("peer checked connected");
            let mut sent_msgs = 0u32;
            let mut sent_bytes = 0u64;
            let mut transport_dead = false;
            while self.bufs[idx].send_queue.has_data() && !transport_dead {
                let PeerTalk {
                    bufs,
                    platform,
                    registry,
                    config,
                    ..
                } = self;
                let PeerBuffers {
                    send_queue,
                    pipeline,
                    obuf,
                    conn,
                    ..
                } = &mut bufs[idx];
                let conn = conn.expect("checked above");
                let use_pipeline = pipeline
                    .as_ref()
                    .map(|p| p.slots_available() > 0)
                    .unwrap_or(false);
                let result = {
                    let view = match send_queue.pop_priority_direct() {
                        Ok(view) => view,
                        Err(_) => break,
                    };
                    let payload_len = view.data.len();
                    let outcome = if view.wire_flags & MSG_FLAG_UNRELIABLE != 0 {
                        // Datagram path: PTUD header, no CRC trailer,
                        // no sequence consumed. The sender's stream
                        // port is its identity on the receiving side.
                        let storage = obuf.storage_mut();
                        match udp_encode(config.tcp_port, view.data, &mut storage[..]) {
                            Ok(len) => {
                                platform.udp_send_to(peer_addr, config.udp_port, &storage[..len])
                            }
                            Err(e) => Err(e.into()),
                        }
                    } else {
                        let seq = match registry.hot_mut(id) {
                            Some(hot) => {
                                let seq = hot.send_seq;
                                hot.send_seq = hot.send_seq.wrapping_add(1);
                                seq
                            }
                            None => 0,
                        };
                        if use_pipeline {
                            pipeline.as_mut().expect("checked above").send_async(
                                platform,
                                conn,
                                MessageKind::Data,
                                view.wire_flags,
                                seq,
                                view.data,
                            )
                        } else {
                            let storage = obuf.storage_mut();
                            match encode_frame(
                                MessageKind::Data,
                                view.wire_flags,
                                seq,
                                view.data,
                                &mut storage[..],
                            ) {
                                Ok(len) => platform.stream_send(conn, &storage[..len]),
                                Err(e) => Err(e.into()),
                            }
                        }
                    };
                    outcome.map(|()| payload_len)
                };
                match result {
                    Ok(payload_len) => {
                        let _ = self.bufs[idx].send_queue.pop_priority_commit();
                        sent_msgs += 1;
                        sent_bytes += payload_len as u64;
                    }
                    Err(PeerTalkError::WouldBlock) => {
                        self.bufs[idx].send_queue.pop_priority_abort();
                        break;
                    }
                    Err(e) => {
                        self.bufs[idx].send_queue.pop_priority_abort();
                        debug!(peer = %id, error = %e, "send failed");
                        if let Some(cold) = self.registry.cold_mut(id) {
                            cold.stats.send_errors += 1;
                        }
                        transport_dead = true;
                    }
                }
            }
            if sent_msgs > 0 {
                if let Some(cold) = self.registry.cold_mut(id) {
                    cold.stats.msgs_sent += sent_msgs;
                    cold.stats.bytes_sent += sent_bytes;
                }
            }
            if transport_dead {
                self.fail_peer(id, DisconnectReason::Error);
            }
        }
    }

    /// Step 6 (transport half): ingest datagrams — discovery packets
    /// and unreliable data frames.
    fn poll_udp<H: PeerTalkHandler>(&mut self, now: Ticks, handler: &mut H) {
        let mut buf = [0u8; 1500];
        loop {
            let (len, from_addr, from_port) = match self.platform.udp_recv(&mut buf) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "datagram receive failed");
                    break;
                }
            };
            let data = &buf[..len];
            if data.len() >= 4 && data[..4] == DISCOVERY_MAGIC {
                match DiscoveryPacket::decode(data) {
                    Ok(pkt) => {
                        let PeerTalk {
                            discovery,
                            config,
                            registry,
                            events,
                            ..
                        } = self;
                        discovery.handle_packet(
                            &pkt, from_addr, from_port, config, registry, events, now,
                        );
                    }
                    Err(e) => {
                        // Malformed packets are dropped; the sender is
                        // not penalized.
                        warn!(error = %e, "dropping malformed discovery packet");
                    }
                }
            } else if data.len() >= 4 && data[..4] == UDP_MAGIC {
                match udp_decode(data) {
                    Ok((sender_port, payload)) => {
                        let id = self.registry.find_by_addr(from_addr, sender_port);
                        match id.and_then(|id| self.registry.find_by_id(id)) {
                            Some(hot) if hot.state == PeerState::Connected => {
                                let id = hot.id;
                                if let Some(hot) = self.registry.hot_mut(id) {
                                    hot.last_seen = now;
                                }
                                if let Some(cold) = self.registry.cold_mut(id) {
                                    cold.stats.msgs_received += 1;
                                    cold.stats.bytes_received += payload.len() as u64;
                                }
                                handler.on_message_received(id, payload);
                            }
                            _ => debug!("datagram from unknown or unconnected peer"),
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed datagram frame"),
                }
            } else {
                warn!("dropping datagram with unknown magic");
            }
        }
    }

    /// Keepalive PINGs for quiet connections, and the PONG deadline.
    fn keepalive(&mut self, now: Ticks) {
        let interval = self.config.keepalive_interval_ms;
        if interval == 0 {
            return;
        }
        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let Some(hot) = self.registry.find_by_id(id) else {
                continue;
            };
            if hot.state != PeerState::Connected {
                continue;
            }
            let last_seen = hot.last_seen;
            let idx = Self::buf_index(id);
            let ping_sent = self.bufs[idx].ping_sent;
            if ping_sent != Ticks(0) {
                if now.elapsed_since(ping_sent) > interval * 2 {
                    debug!(peer = %id, "keepalive timed out");
                    self.fail_peer(id, DisconnectReason::Timeout);
                }
                continue;
            }
            if now.elapsed_since(last_seen) <= interval {
                continue;
            }
            let seq = self.next_seq(id);
            let buf = &mut self.bufs[idx];
            let Some(conn) = buf.conn else { continue };
            let ok = match buf.pipeline.as_mut() {
                Some(p) if p.slots_available() > 0 => p
                    .send_async(&mut self.platform, conn, MessageKind::Ping, 0, seq, &[])
                    .is_ok(),
                _ => false, // retry next poll when a slot frees up
            };
            if ok {
                buf.ping_sent = now;
            }
        }
    }

    /// Step 7: hand accumulated lifecycle events to the application.
    fn dispatch_events<H: PeerTalkHandler>(&mut self, handler: &mut H) {
        while let Some(event) = self.events.pop_front() {
            match event {
                Event::PeerDiscovered(id) => {
                    let name: SmallVec<[u8; 32]> = self
                        .registry
                        .cold(id)
                        .map(|c| SmallVec::from_slice(c.name()))
                        .unwrap_or_default();
                    handler.on_peer_discovered(id, &name);
                }
                Event::PeerLost(id) => handler.on_peer_lost(id),
                Event::PeerConnected(id) => handler.on_peer_connected(id),
                Event::PeerDisconnected(id, reason) => handler.on_peer_disconnected(id, reason),
            }
        }
    }

    /// Graceful teardown: GOODBYE to the LAN, DISCONNECT to every
    /// connected peer, bounded waits for in-flight sends, then slot
    /// reclamation.
    pub fn shutdown(&mut self) {
        let now = self.platform.ticks();
        self.discovery.schedule_goodbye(&self.config, now);
        self.discovery.flush(&mut self.platform);

        let ids: SmallVec<[PeerId; MAX_PEERS]> = self.registry.live_ids().collect();
        for id in ids {
            let idx = Self::buf_index(id);
            let state = self.registry.find_by_id(id).map(|h| h.state);
            if state == Some(PeerState::Connected) {
                let seq = self.next_seq(id);
                if let Some(conn) = self.bufs[idx].conn {
                    let storage = self.bufs[idx].obuf.storage_mut();
                    if let Ok(len) =
                        encode_frame(MessageKind::Disconnect, 0, seq, &[], &mut storage[..])
                    {
                        let _ = self.platform.stream_send(conn, &storage[..len]);
                    }
                }
            }
            let close_timeout = self.config.close_timeout_ms;
            let buf = &mut self.bufs[idx];
            if let (Some(pipeline), Some(conn)) = (buf.pipeline.as_mut(), buf.conn) {
                pipeline.cleanup(&mut self.platform, conn, close_timeout);
            }
            if let Some(conn) = buf.conn.take() {
                self.platform.close(conn);
            }
            self.registry.destroy(id);
            self.bufs[idx].reset();
        }
        self.discovery.stop();
        self.events.clear();
        debug!("context shut down");
    }
}
