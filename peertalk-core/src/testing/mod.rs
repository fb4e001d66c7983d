//! In-memory simulated LAN.
//!
//! [`SimulatedLan`] is a virtual broadcast domain plus duplex stream
//! pipes, driven by a shared [`ManualTickSource`] so whole multi-node
//! scenarios run deterministically with no real sockets and no real
//! time. Each node gets a [`LanEndpoint`], which implements
//! [`Platform`].
//!
//! Asynchronous sends complete immediately by default; a configurable
//! delivery latency keeps them in flight across ticks, which is how the
//! pipeline's completion polling gets exercised.

use crate::error::{PeerTalkError, Result};
use crate::platform::{ConnId, ConnectStatus, Platform, SendTicket};
use crate::tick::{ManualTickSource, TickSource, Ticks};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// One datagram in flight: payload, sender address, sender port.
type Datagram = (Vec<u8>, [u8; 4], u16);

struct Host {
    udp_port: u16,
    tcp_port: u16,
    udp_tx: Sender<Datagram>,
    accept_queue: VecDeque<(usize, [u8; 4], u16)>,
}

struct Pipe {
    /// Byte stream per direction, indexed by the receiving side.
    streams: [VecDeque<u8>; 2],
    closed: [bool; 2],
    refused: bool,
}

struct SendEntry {
    pipe: usize,
    side: usize,
    data: Vec<u8>,
    ready_at: Ticks,
    /// `None` while in flight; the final status word afterwards.
    status: Option<i32>,
}

struct LanState {
    hosts: HashMap<[u8; 4], Host>,
    pipes: Vec<Pipe>,
    sends: HashMap<u32, SendEntry>,
    next_ticket: u32,
    send_latency_ms: u32,
}

impl LanState {
    /// Delivers every in-flight send whose latency has elapsed.
    fn pump(&mut self, now: Ticks) {
        for entry in self.sends.values_mut() {
            if entry.status.is_some() || now.elapsed_since(entry.ready_at) > u32::MAX / 2 {
                continue;
            }
            // elapsed_since wraps; "due" means ready_at is not in the
            // future relative to now.
            let pipe = &mut self.pipes[entry.pipe];
            let other = 1 - entry.side;
            if pipe.closed[entry.side] || pipe.closed[other] {
                entry.status = Some(-1);
            } else {
                pipe.streams[other].extend(entry.data.iter().copied());
                entry.status = Some(0);
            }
        }
    }
}

/// A shared virtual LAN segment.
#[derive(Clone)]
pub struct SimulatedLan {
    state: Arc<Mutex<LanState>>,
    ticks: Arc<ManualTickSource>,
}

impl SimulatedLan {
    pub fn new() -> Self {
        SimulatedLan {
            state: Arc::new(Mutex::new(LanState {
                hosts: HashMap::new(),
                pipes: Vec::new(),
                sends: HashMap::new(),
                next_ticket: 1,
                send_latency_ms: 0,
            })),
            ticks: Arc::new(ManualTickSource::new(1)),
        }
    }

    /// The shared clock every endpoint reads.
    pub fn tick_source(&self) -> Arc<ManualTickSource> {
        Arc::clone(&self.ticks)
    }

    /// Advances the whole LAN's clock.
    pub fn advance(&self, ms: u32) {
        self.ticks.advance(ms);
    }

    /// Asynchronous sends stay in flight for this long before their
    /// status word reports completion.
    pub fn set_send_latency_ms(&self, ms: u32) {
        self.state.lock().unwrap().send_latency_ms = ms;
    }

    /// Creates a platform endpoint at `addr`. Ports attach at `bind`.
    pub fn endpoint(&self, addr: [u8; 4]) -> LanEndpoint {
        LanEndpoint {
            state: Arc::clone(&self.state),
            ticks: Arc::clone(&self.ticks),
            addr,
            udp_rx: None,
            conns: HashMap::new(),
            next_conn: 1,
        }
    }
}

impl Default for SimulatedLan {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of the simulated LAN.
pub struct LanEndpoint {
    state: Arc<Mutex<LanState>>,
    ticks: Arc<ManualTickSource>,
    addr: [u8; 4],
    udp_rx: Option<Receiver<Datagram>>,
    /// Local connection handles onto shared pipes.
    conns: HashMap<u32, (usize, usize)>,
    next_conn: u32,
}

impl LanEndpoint {
    pub fn addr(&self) -> [u8; 4] {
        self.addr
    }

    fn register_conn(&mut self, pipe: usize, side: usize) -> ConnId {
        let id = self.next_conn;
        self.next_conn += 1;
        self.conns.insert(id, (pipe, side));
        ConnId(id)
    }

    fn lookup(&self, conn: ConnId) -> Result<(usize, usize)> {
        self.conns
            .get(&conn.0)
            .copied()
            .ok_or(PeerTalkError::InvalidParam)
    }
}

impl Platform for LanEndpoint {
    fn ticks(&self) -> Ticks {
        self.ticks.now()
    }

    fn bind(&mut self, udp_port: u16, tcp_port: u16) -> Result<()> {
        let (tx, rx) = unbounded();
        self.udp_rx = Some(rx);
        let mut state = self.state.lock().unwrap();
        state.hosts.insert(
            self.addr,
            Host {
                udp_port,
                tcp_port,
                udp_tx: tx,
                accept_queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn udp_broadcast(&mut self, data: &[u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let from_port = state
            .hosts
            .get(&self.addr)
            .map(|h| h.udp_port)
            .ok_or(PeerTalkError::Resource)?;
        for (addr, host) in state.hosts.iter() {
            if *addr == self.addr {
                continue;
            }
            let _ = host.udp_tx.send((data.to_vec(), self.addr, from_port));
        }
        Ok(())
    }

    fn udp_send_to(&mut self, addr: [u8; 4], port: u16, data: &[u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let from_port = state
            .hosts
            .get(&self.addr)
            .map(|h| h.udp_port)
            .ok_or(PeerTalkError::Resource)?;
        if let Some(host) = state.hosts.get(&addr) {
            if host.udp_port == port {
                let _ = host.udp_tx.send((data.to_vec(), self.addr, from_port));
            }
        }
        Ok(())
    }

    fn udp_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, [u8; 4], u16)>> {
        let Some(rx) = self.udp_rx.as_ref() else {
            return Err(PeerTalkError::Resource);
        };
        match rx.try_recv() {
            Ok((data, from_addr, from_port)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, from_addr, from_port)))
            }
            Err(_) => Ok(None),
        }
    }

    fn connect(&mut self, addr: [u8; 4], port: u16) -> Result<ConnId> {
        let mut state = self.state.lock().unwrap();
        let my_tcp_port = state
            .hosts
            .get(&self.addr)
            .map(|h| h.tcp_port)
            .ok_or(PeerTalkError::Resource)?;
        let reachable = state
            .hosts
            .get(&addr)
            .map(|h| h.tcp_port == port)
            .unwrap_or(false);
        let pipe_idx = state.pipes.len();
        state.pipes.push(Pipe {
            streams: [VecDeque::new(), VecDeque::new()],
            closed: [false, false],
            refused: !reachable,
        });
        if reachable {
            // The accept side learns the connector's advertised stream
            // port, the same identity it sees in discovery.
            let my_addr = self.addr;
            state
                .hosts
                .get_mut(&addr)
                .expect("reachable host exists")
                .accept_queue
                .push_back((pipe_idx, my_addr, my_tcp_port));
        }
        drop(state);
        Ok(self.register_conn(pipe_idx, 0))
    }

    fn connect_status(&mut self, conn: ConnId) -> ConnectStatus {
        let Ok((pipe, _)) = self.lookup(conn) else {
            return ConnectStatus::Failed;
        };
        let state = self.state.lock().unwrap();
        if state.pipes[pipe].refused {
            ConnectStatus::Failed
        } else {
            ConnectStatus::Ready
        }
    }

    fn accept(&mut self) -> Result<Option<(ConnId, [u8; 4], u16)>> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let host = state
                .hosts
                .get_mut(&self.addr)
                .ok_or(PeerTalkError::Resource)?;
            host.accept_queue.pop_front()
        };
        match entry {
            Some((pipe, from_addr, from_port)) => {
                let conn = self.register_conn(pipe, 1);
                Ok(Some((conn, from_addr, from_port)))
            }
            None => Ok(None),
        }
    }

    fn stream_recv(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<Option<usize>> {
        let (pipe, side) = self.lookup(conn)?;
        let now = self.ticks.now();
        let mut state = self.state.lock().unwrap();
        state.pump(now);
        let pipe = &mut state.pipes[pipe];
        let stream = &mut pipe.streams[side];
        if stream.is_empty() {
            if pipe.closed[1 - side] || pipe.closed[side] {
                return Ok(Some(0));
            }
            return Ok(None);
        }
        let n = stream.len().min(buf.len());
        for byte in buf.iter_mut().take(n) {
            *byte = stream.pop_front().expect("checked non-empty");
        }
        Ok(Some(n))
    }

    fn stream_send_async(&mut self, conn: ConnId, data: &[u8]) -> Result<SendTicket> {
        let (pipe, side) = self.lookup(conn)?;
        let now = self.ticks.now();
        let mut state = self.state.lock().unwrap();
        let latency = state.send_latency_ms;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.sends.insert(
            ticket,
            SendEntry {
                pipe,
                side,
                data: data.to_vec(),
                ready_at: now.advanced(latency),
                status: None,
            },
        );
        state.pump(now);
        Ok(SendTicket(ticket))
    }

    fn send_status(&mut self, conn: ConnId, ticket: SendTicket) -> i32 {
        let _ = conn;
        let now = self.ticks.now();
        let mut state = self.state.lock().unwrap();
        state.pump(now);
        match state.sends.get(&ticket.0).and_then(|e| e.status) {
            Some(status) => {
                state.sends.remove(&ticket.0);
                status
            }
            None => {
                if state.sends.contains_key(&ticket.0) {
                    1
                } else {
                    0 // already reaped
                }
            }
        }
    }

    fn stream_send(&mut self, conn: ConnId, data: &[u8]) -> Result<()> {
        let (pipe, side) = self.lookup(conn)?;
        let now = self.ticks.now();
        let mut state = self.state.lock().unwrap();
        state.pump(now);
        let pipe = &mut state.pipes[pipe];
        let other = 1 - side;
        if pipe.closed[side] || pipe.closed[other] {
            return Err(PeerTalkError::NotConnected);
        }
        pipe.streams[other].extend(data.iter().copied());
        Ok(())
    }

    fn close(&mut self, conn: ConnId) {
        if let Ok((pipe, side)) = self.lookup(conn) {
            let mut state = self.state.lock().unwrap();
            state.pipes[pipe].closed[side] = true;
        }
    }

    fn close_status(&mut self, conn: ConnId) -> bool {
        // Closes complete immediately on the simulated LAN.
        let _ = conn;
        true
    }
}
