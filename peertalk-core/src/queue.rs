//! Pre-allocated message queues.
//!
//! A queue is a power-of-two ring of fixed 256-byte slots. Dequeue order
//! is priority-first (CRITICAL, HIGH, NORMAL, LOW; FIFO within a level),
//! maintained by per-priority lists linked through the slots themselves.
//! A direct-mapped hash lets producers coalesce messages by key: a newer
//! payload with the same non-zero key overwrites the queued one in place
//! instead of occupying a second slot.
//!
//! Producers come in two forms. Main-loop producers may log and read the
//! clock. Interrupt-context producers use [`MessageQueue::push_coalesce_isr`]
//! only: it performs nothing but slice copies into pre-allocated storage,
//! leaves the timestamp at zero, and records noteworthy conditions in
//! single-bit flags that [`MessageQueue::check_isr_flags`] drains and logs
//! from the main loop.

use crate::error::{PeerTalkError, Result};
use crate::tick::Ticks;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Payload capacity of one slot.
pub const SLOT_DATA_SIZE: usize = 256;
/// Hard upper bound on queue capacity; the auxiliary tables are sized
/// for this and larger rings are refused.
pub const MAX_QUEUE_SLOTS: usize = 32;
/// Buckets in the direct-mapped coalesce hash.
pub const COALESCE_BUCKETS: usize = 32;
/// End-of-list sentinel for intra-slot links.
const SLOT_NONE: u8 = u8::MAX;

const FLAG_USED: u8 = 1 << 0;
const FLAG_COALESCABLE: u8 = 1 << 1;
const FLAG_READY: u8 = 1 << 2;
/// The wire flags of a queued message ride in the high nibble.
const WIRE_SHIFT: u32 = 4;

/// Fill thresholds (percent) for the cascade warnings emitted by
/// main-loop pushes.
const CASCADE_THRESHOLDS: [usize; 3] = [80, 90, 95];

/// Message priorities, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// Number of priority levels.
pub const NUM_PRIORITIES: usize = 4;

impl Priority {
    fn index(self) -> usize {
        self as usize
    }
}

/// Queue fill levels reported to senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backpressure {
    None,
    Light,
    Heavy,
    Blocking,
}

/// Whether a coalescing push stored a new slot or overwrote a queued one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    Coalesced,
}

/// Metadata plus payload referenced by a zero-copy pop. Invalidated by
/// [`MessageQueue::pop_priority_commit`].
pub struct DirectView<'a> {
    pub data: &'a [u8],
    pub priority: Priority,
    pub wire_flags: u8,
    /// Zero when the message was enqueued from interrupt context.
    pub timestamp: Ticks,
    pub coalesce_key: u16,
}

// Metadata ahead of the payload: list traversal inspects flags and links
// without pulling the 256-byte payload through the cache.
#[repr(C)]
#[derive(Debug)]
struct Slot {
    timestamp: Ticks,
    length: u16,
    coalesce_key: u16,
    next_slot: u8,
    priority: u8,
    flags: u8,
    data: [u8; SLOT_DATA_SIZE],
}

impl Slot {
    fn empty() -> Self {
        Slot {
            timestamp: Ticks(0),
            length: 0,
            coalesce_key: 0,
            next_slot: SLOT_NONE,
            priority: 0,
            flags: 0,
            data: [0; SLOT_DATA_SIZE],
        }
    }

    #[inline]
    fn used(&self) -> bool {
        self.flags & FLAG_USED != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct PriorityList {
    head: u8,
    tail: u8,
    count: u8,
}

impl PriorityList {
    fn empty() -> Self {
        PriorityList {
            head: SLOT_NONE,
            tail: SLOT_NONE,
            count: 0,
        }
    }
}

/// Single-bit conditions recorded by interrupt-context producers and
/// logged later from the main loop. Single-byte relaxed stores; each bit
/// has exactly one writer per direction.
#[derive(Debug, Default)]
pub struct IsrFlags {
    queue_full: AtomicBool,
    coalesce_hit: AtomicBool,
    hash_collision: AtomicBool,
}

#[derive(Debug)]
pub struct MessageQueue {
    slots: Box<[Slot]>,
    mask: usize,
    /// Allocation scan cursor. The read side is owned by the priority
    /// lists, so there is no separate read cursor.
    write_idx: usize,
    count: usize,
    /// Cheap producer-to-main-loop signal.
    has_data: AtomicBool,
    lists: [PriorityList; NUM_PRIORITIES],
    hash: [u8; COALESCE_BUCKETS],
    isr: IsrFlags,
    /// Slot handed out by `pop_priority_direct`, not yet committed.
    pending_direct: Option<(u8, Priority)>,
}

impl MessageQueue {
    /// Builds a queue of `capacity` slots. The capacity must be a power
    /// of two (rejected with `NotPowerOfTwo` otherwise) and no larger
    /// than [`MAX_QUEUE_SLOTS`].
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(PeerTalkError::NotPowerOfTwo);
        }
        if capacity > MAX_QUEUE_SLOTS {
            return Err(PeerTalkError::InvalidParam);
        }
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::empty()).collect();
        Ok(MessageQueue {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            write_idx: 0,
            count: 0,
            has_data: AtomicBool::new(false),
            lists: [PriorityList::empty(); NUM_PRIORITIES],
            hash: [SLOT_NONE; COALESCE_BUCKETS],
            isr: IsrFlags::default(),
            pending_direct: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Producer signal; cleared when the queue drains.
    pub fn has_data(&self) -> bool {
        self.has_data.load(Ordering::Relaxed)
    }

    /// Messages queued at `priority`.
    pub fn priority_len(&self, priority: Priority) -> usize {
        self.lists[priority.index()].count as usize
    }

    fn fill_percent(&self, count: usize) -> usize {
        count * 100 / self.slots.len()
    }

    /// Current fill level against the 25/50/75 level boundaries.
    pub fn backpressure(&self) -> Backpressure {
        let pct = self.fill_percent(self.count);
        if pct >= 75 {
            Backpressure::Blocking
        } else if pct >= 50 {
            Backpressure::Heavy
        } else if pct >= 25 {
            Backpressure::Light
        } else {
            Backpressure::None
        }
    }

    #[inline]
    fn bucket(key: u16) -> usize {
        key as usize & (COALESCE_BUCKETS - 1)
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        for i in 0..self.slots.len() {
            let idx = (self.write_idx + i) & self.mask;
            if !self.slots[idx].used() {
                self.write_idx = (idx + 1) & self.mask;
                return Some(idx);
            }
        }
        None
    }

    fn link_tail(&mut self, priority: Priority, idx: usize) {
        let list = &mut self.lists[priority.index()];
        self.slots[idx].next_slot = SLOT_NONE;
        if list.tail == SLOT_NONE {
            list.head = idx as u8;
        } else {
            let tail = list.tail as usize;
            self.slots[tail].next_slot = idx as u8;
        }
        list.tail = idx as u8;
        list.count += 1;
    }

    fn unlink_head(&mut self, priority: Priority) -> Option<usize> {
        let list = &mut self.lists[priority.index()];
        if list.head == SLOT_NONE {
            return None;
        }
        let idx = list.head as usize;
        list.head = self.slots[idx].next_slot;
        if list.head == SLOT_NONE {
            list.tail = SLOT_NONE;
        }
        list.count -= 1;
        self.slots[idx].next_slot = SLOT_NONE;
        Some(idx)
    }

    fn highest_nonempty(&self) -> Option<Priority> {
        const ORDER: [Priority; NUM_PRIORITIES] = [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ];
        ORDER
            .into_iter()
            .find(|p| self.lists[p.index()].count > 0)
    }

    /// Copies `data` into a fresh slot and appends it to its priority
    /// list. `timestamp` is zero for interrupt-context producers.
    fn store_slot(
        &mut self,
        data: &[u8],
        priority: Priority,
        wire_flags: u8,
        key: u16,
        timestamp: Ticks,
    ) -> Result<usize> {
        if data.len() > SLOT_DATA_SIZE {
            return Err(PeerTalkError::BufferFull);
        }
        let idx = self.find_free_slot().ok_or(PeerTalkError::BufferFull)?;
        let slot = &mut self.slots[idx];
        slot.timestamp = timestamp;
        slot.length = data.len() as u16;
        slot.coalesce_key = key;
        slot.priority = priority as u8;
        slot.flags = FLAG_USED
            | FLAG_READY
            | if key != 0 { FLAG_COALESCABLE } else { 0 }
            | (wire_flags & 0x0f) << WIRE_SHIFT;
        slot.data[..data.len()].copy_from_slice(data);
        self.link_tail(priority, idx);
        self.count += 1;
        self.has_data.store(true, Ordering::Relaxed);
        Ok(idx)
    }

    /// Fires the 80/90/95% warnings once per crossing, detected by
    /// comparing the fill percentage before and after the push.
    fn warn_cascade(&self, prev_count: usize) {
        let prev = self.fill_percent(prev_count);
        let now = self.fill_percent(self.count);
        for threshold in CASCADE_THRESHOLDS {
            if prev < threshold && now >= threshold {
                warn!(
                    fill = now,
                    threshold, "send queue crossed fill threshold"
                );
            }
        }
    }

    /// Main-loop producer. Fails with `BufferFull` when every slot is in
    /// use.
    pub fn push(&mut self, data: &[u8], priority: Priority, wire_flags: u8, now: Ticks) -> Result<()> {
        let prev = self.count;
        self.store_slot(data, priority, wire_flags, 0, now)?;
        self.warn_cascade(prev);
        Ok(())
    }

    /// Main-loop coalescing producer.
    ///
    /// With a non-zero `key` whose hash bucket holds a live slot bearing
    /// the same key, the queued payload is overwritten in place: the
    /// count, the slot's priority and its position in line are all
    /// unchanged, only the payload and timestamp refresh. Any other case
    /// stores a new slot and points the bucket at it; a bucket occupied
    /// by a different key is simply evicted from the hash (the slot
    /// itself stays queued).
    pub fn push_coalesce(
        &mut self,
        data: &[u8],
        priority: Priority,
        wire_flags: u8,
        key: u16,
        now: Ticks,
    ) -> Result<PushOutcome> {
        self.coalesce_inner(data, priority, wire_flags, key, now, false)
    }

    /// Interrupt-context producer: the only queue operation valid at
    /// interrupt level. Performs plain slice copies only, never reads
    /// the clock (the timestamp stays zero so latency statistics can
    /// filter these entries) and never logs; noteworthy conditions are
    /// recorded in [`IsrFlags`] for the main loop.
    pub fn push_coalesce_isr(
        &mut self,
        data: &[u8],
        priority: Priority,
        wire_flags: u8,
        key: u16,
    ) -> Result<PushOutcome> {
        self.coalesce_inner(data, priority, wire_flags, key, Ticks(0), true)
    }

    fn coalesce_inner(
        &mut self,
        data: &[u8],
        priority: Priority,
        wire_flags: u8,
        key: u16,
        timestamp: Ticks,
        from_isr: bool,
    ) -> Result<PushOutcome> {
        if data.len() > SLOT_DATA_SIZE {
            return Err(PeerTalkError::BufferFull);
        }
        if key != 0 {
            let bucket = Self::bucket(key);
            let tracked = self.hash[bucket];
            if tracked != SLOT_NONE {
                let idx = tracked as usize;
                let pending = self
                    .pending_direct
                    .map(|(slot, _)| slot as usize == idx)
                    .unwrap_or(false);
                // Never overwrite a slot handed out by pop_priority_direct.
                if self.slots[idx].used() && self.slots[idx].coalesce_key == key && !pending {
                    let slot = &mut self.slots[idx];
                    slot.data[..data.len()].copy_from_slice(data);
                    slot.length = data.len() as u16;
                    slot.timestamp = timestamp;
                    if from_isr {
                        self.isr.coalesce_hit.store(true, Ordering::Relaxed);
                    } else {
                        debug!(key, "coalesced queued message");
                    }
                    return Ok(PushOutcome::Coalesced);
                }
                if self.slots[idx].used() && self.slots[idx].coalesce_key != key {
                    // Exact-key match only; a colliding key evicts the
                    // bucket pointer, not the queued slot.
                    if from_isr {
                        self.isr.hash_collision.store(true, Ordering::Relaxed);
                    } else {
                        debug!(key, bucket, "coalesce bucket collision");
                    }
                }
            }
        }

        let prev = self.count;
        match self.store_slot(data, priority, wire_flags, key, timestamp) {
            Ok(idx) => {
                if key != 0 {
                    self.hash[Self::bucket(key)] = idx as u8;
                }
                if !from_isr {
                    self.warn_cascade(prev);
                }
                Ok(PushOutcome::Stored)
            }
            Err(e) => {
                if from_isr {
                    self.isr.queue_full.store(true, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Policy-gated producer: under BLOCKING pressure only CRITICAL is
    /// accepted, under HEAVY only HIGH or better; under LIGHT everything
    /// is accepted but the returned level tells the caller to slow down.
    /// Dropped messages are logged at WARN and reported as
    /// `Backpressure`.
    pub fn try_push(
        &mut self,
        data: &[u8],
        priority: Priority,
        wire_flags: u8,
        key: u16,
        now: Ticks,
    ) -> Result<(PushOutcome, Backpressure)> {
        let pressure = self.backpressure();
        let admitted = match pressure {
            Backpressure::Blocking => priority == Priority::Critical,
            Backpressure::Heavy => priority <= Priority::High,
            Backpressure::Light | Backpressure::None => true,
        };
        if !admitted {
            warn!(
                ?priority,
                ?pressure,
                fill = self.fill_percent(self.count),
                "message dropped by backpressure policy"
            );
            return Err(PeerTalkError::Backpressure);
        }
        let outcome = if key != 0 {
            self.push_coalesce(data, priority, wire_flags, key, now)?
        } else {
            self.push(data, priority, wire_flags, now)?;
            PushOutcome::Stored
        };
        Ok((outcome, pressure))
    }

    fn release_slot(&mut self, idx: usize) {
        let key = self.slots[idx].coalesce_key;
        if key != 0 {
            let bucket = Self::bucket(key);
            if self.hash[bucket] == idx as u8 {
                self.hash[bucket] = SLOT_NONE;
            }
        }
        self.slots[idx].flags = 0;
        self.slots[idx].coalesce_key = 0;
        self.count -= 1;
        if self.count == 0 {
            self.has_data.store(false, Ordering::Relaxed);
        }
    }

    /// Dequeues the head of the highest non-empty priority list into
    /// `out`, returning the payload length.
    pub fn pop_priority(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.pending_direct.is_some() {
            return Err(PeerTalkError::InvalidParam);
        }
        let priority = self.highest_nonempty().ok_or(PeerTalkError::QueueEmpty)?;
        let head = self.lists[priority.index()].head as usize;
        let len = self.slots[head].length as usize;
        if out.len() < len {
            return Err(PeerTalkError::BufferFull);
        }
        let idx = self.unlink_head(priority).expect("non-empty list has a head");
        out[..len].copy_from_slice(&self.slots[idx].data[..len]);
        self.release_slot(idx);
        Ok(len)
    }

    /// Zero-copy dequeue: returns a view into the head slot of the
    /// highest non-empty priority and stashes it as pending. The caller
    /// processes the data and then calls [`Self::pop_priority_commit`],
    /// which performs the actual unlinking. Until the commit the queue
    /// count is unchanged.
    pub fn pop_priority_direct(&mut self) -> Result<DirectView<'_>> {
        if self.pending_direct.is_some() {
            return Err(PeerTalkError::InvalidParam);
        }
        let priority = self.highest_nonempty().ok_or(PeerTalkError::QueueEmpty)?;
        let idx = self.lists[priority.index()].head as usize;
        self.pending_direct = Some((idx as u8, priority));
        let slot = &self.slots[idx];
        Ok(DirectView {
            data: &slot.data[..slot.length as usize],
            priority,
            wire_flags: slot.flags >> WIRE_SHIFT,
            timestamp: slot.timestamp,
            coalesce_key: slot.coalesce_key,
        })
    }

    /// Completes a pending direct pop. The view returned by
    /// [`Self::pop_priority_direct`] is invalid from here on.
    pub fn pop_priority_commit(&mut self) -> Result<()> {
        let (idx, priority) = self.pending_direct.take().ok_or(PeerTalkError::InvalidParam)?;
        let unlinked = self.unlink_head(priority).expect("pending slot is the list head");
        debug_assert_eq!(unlinked, idx as usize);
        self.release_slot(idx as usize);
        Ok(())
    }

    /// Abandons a pending direct pop, leaving the message queued.
    pub fn pop_priority_abort(&mut self) {
        self.pending_direct = None;
    }

    /// Discards every queued message and resets the lists, the coalesce
    /// hash and the ISR flags. The slot storage itself stays allocated
    /// for the life of the queue.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.flags = 0;
            slot.coalesce_key = 0;
            slot.next_slot = SLOT_NONE;
        }
        self.lists = [PriorityList::empty(); NUM_PRIORITIES];
        self.hash = [SLOT_NONE; COALESCE_BUCKETS];
        self.count = 0;
        self.write_idx = 0;
        self.pending_direct = None;
        self.has_data.store(false, Ordering::Relaxed);
        self.isr.queue_full.store(false, Ordering::Relaxed);
        self.isr.coalesce_hit.store(false, Ordering::Relaxed);
        self.isr.hash_collision.store(false, Ordering::Relaxed);
    }

    /// Observes and clears the interrupt-context flags, emitting the
    /// deferred log events. Called periodically from the main loop.
    pub fn check_isr_flags(&mut self) {
        if self.isr.queue_full.swap(false, Ordering::Relaxed) {
            warn!("queue overflow in interrupt context");
        }
        if self.isr.coalesce_hit.swap(false, Ordering::Relaxed) {
            debug!("message coalesced in interrupt context");
        }
        if self.isr.hash_collision.swap(false, Ordering::Relaxed) {
            debug!("coalesce bucket collision in interrupt context");
        }
    }
}
