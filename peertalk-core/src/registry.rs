//! Fixed-capacity peer registry.
//!
//! Slots live in one contiguous array indexed by `id - 1`; names and
//! statistics live in a parallel cold table reached through `name_idx`.
//! Address lookups scan hot data only. A version counter changes on
//! every add, remove and rename so applications can detect peer-set
//! changes without copying the table.

use crate::error::{PeerTalkError, Result};
use crate::peer::{PeerCold, PeerHot, PeerId, PeerState, MAX_PEERS, PEER_MAGIC};
use crate::tick::Ticks;
use tracing::{debug, info, warn};

pub struct PeerRegistry {
    hot: Box<[PeerHot]>,
    cold: Box<[PeerCold]>,
    occupancy: usize,
    version: u32,
}

impl PeerRegistry {
    /// Pre-allocates the slot array and cold table. All slots start
    /// `UNUSED`. Capacity is bounded by [`MAX_PEERS`].
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_PEERS {
            return Err(PeerTalkError::InvalidParam);
        }
        let hot: Vec<PeerHot> = (0..capacity)
            .map(|i| PeerHot::empty(PeerId(i as u16 + 1)))
            .collect();
        let cold: Vec<PeerCold> = (0..capacity).map(|_| PeerCold::empty()).collect();
        Ok(PeerRegistry {
            hot: hot.into_boxed_slice(),
            cold: cold.into_boxed_slice(),
            occupancy: 0,
            version: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.hot.len()
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Monotonic counter bumped on add/remove/rename.
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    fn slot_index(&self, id: PeerId) -> Option<usize> {
        if !id.is_valid() || id.0 as usize > self.hot.len() {
            return None;
        }
        Some(id.0 as usize - 1)
    }

    /// O(1) lookup. Rejects the zero id, out-of-range ids, `UNUSED`
    /// slots and slots whose magic does not match.
    pub fn find_by_id(&self, id: PeerId) -> Option<&PeerHot> {
        let idx = self.slot_index(id)?;
        let hot = &self.hot[idx];
        if !hot.is_live() {
            return None;
        }
        Some(hot)
    }

    pub(crate) fn hot_mut(&mut self, id: PeerId) -> Option<&mut PeerHot> {
        let idx = self.slot_index(id)?;
        let hot = &mut self.hot[idx];
        if !hot.is_live() {
            return None;
        }
        Some(hot)
    }

    /// Hot-data-only linear scan; called once per inbound packet.
    pub fn find_by_addr(&self, addr: [u8; 4], port: u16) -> Option<PeerId> {
        self.hot
            .iter()
            .find(|h| h.is_live() && h.addr == addr && h.port == port)
            .map(|h| h.id)
    }

    /// Name lookup through the cold table; used for cross-transport
    /// deduplication, not for per-packet work.
    pub fn find_by_name(&self, name: &[u8]) -> Option<PeerId> {
        self.hot
            .iter()
            .filter(|h| h.is_live())
            .find(|h| self.cold[h.name_idx as usize].name() == name)
            .map(|h| h.id)
    }

    /// Ids of all live slots, in slot order.
    pub fn live_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.hot.iter().filter(|h| h.is_live()).map(|h| h.id)
    }

    /// Creates a peer, or refreshes the existing one with the same
    /// address and port. Returns `None` when the table is full.
    pub fn create(&mut self, name: &[u8], addr: [u8; 4], port: u16, now: Ticks) -> Option<PeerId> {
        if let Some(id) = self.find_by_addr(addr, port) {
            let idx = id.0 as usize - 1;
            self.hot[idx].last_seen = now;
            if self.cold[self.hot[idx].name_idx as usize].name() != name {
                self.cold[self.hot[idx].name_idx as usize].set_name(name);
                self.version = self.version.wrapping_add(1);
            }
            return Some(id);
        }

        let idx = self.hot.iter().position(|h| h.state == PeerState::Unused)?;
        let id = PeerId(idx as u16 + 1);
        let hot = &mut self.hot[idx];
        hot.state = PeerState::Discovered;
        hot.addr = addr;
        hot.port = port;
        hot.name_idx = idx as u16;
        hot.transports_available = 0;
        hot.transport_connected = 0;
        hot.last_seen = now;
        hot.connect_start = Ticks(0);
        hot.send_seq = 0;
        hot.recv_seq = 0;
        hot.magic = PEER_MAGIC;
        self.cold[idx].clear();
        self.cold[idx].set_name(name);
        self.occupancy += 1;
        self.version = self.version.wrapping_add(1);
        debug!(peer = %id, name = %String::from_utf8_lossy(name), "peer discovered");
        Some(id)
    }

    /// Validated state transition. Invalid transitions leave the state
    /// unchanged and return an error.
    pub fn set_state(&mut self, id: PeerId, new_state: PeerState) -> Result<()> {
        let hot = self.hot_mut(id).ok_or(PeerTalkError::PeerNotFound)?;
        let old = hot.state;
        if old == new_state {
            return Ok(());
        }
        if !old.can_transition(new_state) {
            warn!(peer = %id, from = %old, to = %new_state, "rejected state transition");
            return Err(PeerTalkError::InvalidParam);
        }
        if new_state == PeerState::Unused {
            // Entering UNUSED is slot reclamation.
            self.destroy(id);
            return Ok(());
        }
        hot.state = new_state;
        if new_state == PeerState::Connected {
            info!(peer = %id, from = %old, "peer connected");
        } else {
            debug!(peer = %id, from = %old, to = %new_state, "peer state change");
        }
        Ok(())
    }

    /// True when the peer has been heard from and the silence exceeds
    /// `timeout_ms`. Wrap-safe.
    pub fn is_timed_out(&self, id: PeerId, now: Ticks, timeout_ms: u32) -> bool {
        match self.find_by_id(id) {
            Some(hot) => hot.last_seen != Ticks(0) && now.elapsed_since(hot.last_seen) > timeout_ms,
            None => false,
        }
    }

    /// Reclaims a slot: clears magic, state, name and address,
    /// decrements occupancy and bumps the version.
    pub fn destroy(&mut self, id: PeerId) {
        let Some(idx) = self.slot_index(id) else {
            return;
        };
        if self.hot[idx].state == PeerState::Unused {
            return;
        }
        debug!(peer = %id, "peer destroyed");
        let cold_idx = self.hot[idx].name_idx as usize;
        self.cold[cold_idx].clear();
        self.hot[idx] = PeerHot::empty(id);
        self.occupancy -= 1;
        self.version = self.version.wrapping_add(1);
    }

    /// Cold record for a live peer.
    pub fn cold(&self, id: PeerId) -> Option<&PeerCold> {
        let hot = self.find_by_id(id)?;
        Some(&self.cold[hot.name_idx as usize])
    }

    pub(crate) fn cold_mut(&mut self, id: PeerId) -> Option<&mut PeerCold> {
        let idx = self.slot_index(id)?;
        if !self.hot[idx].is_live() {
            return None;
        }
        let cold_idx = self.hot[idx].name_idx as usize;
        Some(&mut self.cold[cold_idx])
    }

    /// Indexed name lookup, the callback-compatible access path.
    pub fn name(&self, name_idx: u16) -> Option<&[u8]> {
        let cold = self.cold.get(name_idx as usize)?;
        if cold.name().is_empty() {
            None
        } else {
            Some(cold.name())
        }
    }
}
