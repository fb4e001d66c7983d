//! Per-peer send pipeline.
//!
//! A small fixed set of in-flight asynchronous sends. Each slot owns one
//! frame buffer, allocated when the peer connects and never in the send
//! hot path. A buffer handed to the platform stays owned by its slot
//! until the platform's status word reports completion; the pipeline
//! never cancels an issued send because some target platforms have no
//! cancel primitive.

use crate::error::{PeerTalkError, Result};
use crate::platform::{ConnId, Platform, SendTicket};
use peertalk_proto::{encode_frame, MessageKind, FRAME_TRAILER_LEN, MESSAGE_HEADER_LEN};
use tracing::{debug, warn};

/// In-flight sends per peer.
#[cfg(not(feature = "compact"))]
pub const PIPELINE_DEPTH: usize = 4;
/// Memory-constrained builds halve the depth.
#[cfg(feature = "compact")]
pub const PIPELINE_DEPTH: usize = 2;

struct SendSlot {
    buf: Box<[u8]>,
    len: usize,
    ticket: SendTicket,
    /// Send issued, completion not yet observed.
    in_use: bool,
    /// Result observed; slot is free for reuse.
    completed: bool,
}

impl SendSlot {
    fn new(buf_len: usize) -> Self {
        SendSlot {
            buf: vec![0; buf_len].into_boxed_slice(),
            len: 0,
            ticket: SendTicket(0),
            in_use: false,
            completed: true,
        }
    }

    #[inline]
    fn busy(&self) -> bool {
        self.in_use && !self.completed
    }
}

pub struct SendPipeline {
    slots: Vec<SendSlot>,
    pending_count: usize,
    /// Round-robin hint for the next free-slot search.
    next_slot: usize,
}

impl SendPipeline {
    /// Allocates `PIPELINE_DEPTH` buffers sized for `max_payload` plus
    /// framing. Called on peer connect.
    pub fn new(max_payload: usize) -> Self {
        let buf_len = MESSAGE_HEADER_LEN + max_payload + FRAME_TRAILER_LEN;
        SendPipeline {
            slots: (0..PIPELINE_DEPTH).map(|_| SendSlot::new(buf_len)).collect(),
            pending_count: 0,
            next_slot: 0,
        }
    }

    /// Slots free to accept a new send.
    pub fn slots_available(&self) -> usize {
        PIPELINE_DEPTH - self.pending_count
    }

    pub fn pending(&self) -> usize {
        self.pending_count
    }

    /// Frames `payload` into a free slot's buffer and hands it to the
    /// platform's asynchronous send. Returns `WouldBlock` when every
    /// slot is busy.
    pub fn send_async(
        &mut self,
        platform: &mut dyn Platform,
        conn: ConnId,
        kind: MessageKind,
        flags: u8,
        seq: u8,
        payload: &[u8],
    ) -> Result<()> {
        let mut found = None;
        for i in 0..PIPELINE_DEPTH {
            let idx = (self.next_slot + i) % PIPELINE_DEPTH;
            if !self.slots[idx].busy() {
                found = Some(idx);
                break;
            }
        }
        let idx = found.ok_or(PeerTalkError::WouldBlock)?;
        self.next_slot = (idx + 1) % PIPELINE_DEPTH;

        let slot = &mut self.slots[idx];
        let len = encode_frame(kind, flags, seq, payload, &mut slot.buf)?;
        slot.len = len;
        slot.ticket = platform.stream_send_async(conn, &slot.buf[..len])?;
        slot.in_use = true;
        slot.completed = false;
        self.pending_count += 1;
        Ok(())
    }

    /// Polls every busy slot's status word. Non-positive means the
    /// platform is done: the slot is freed and a negative status is
    /// logged at WARN. Returns how many slots completed.
    pub fn poll_completions(&mut self, platform: &mut dyn Platform, conn: ConnId) -> usize {
        let mut completed = 0;
        for slot in self.slots.iter_mut() {
            if !slot.busy() {
                continue;
            }
            let status = platform.send_status(conn, slot.ticket);
            if status > 0 {
                continue;
            }
            slot.completed = true;
            slot.in_use = false;
            self.pending_count -= 1;
            completed += 1;
            if status != 0 {
                warn!(?conn, status, "asynchronous send completed with error");
            }
        }
        completed
    }

    /// Waits, by polling, for in-flight sends to finish before the
    /// buffers are released, giving up after `timeout_ms`. Called on
    /// peer teardown.
    pub fn cleanup(&mut self, platform: &mut dyn Platform, conn: ConnId, timeout_ms: u32) {
        let start = platform.ticks();
        loop {
            self.poll_completions(platform, conn);
            if self.pending_count == 0 {
                break;
            }
            if platform.ticks().elapsed_since(start) >= timeout_ms {
                debug!(
                    ?conn,
                    abandoned = self.pending_count,
                    "pipeline cleanup timed out with sends still in flight"
                );
                break;
            }
        }
    }
}
