//! Application callbacks.
//!
//! Lifecycle events accumulate while `poll` runs its steps and are
//! dispatched synchronously at the end of the same call — never from
//! interrupt context. Handlers may therefore call back into any core
//! API. Message payloads are dispatched inline as frames complete, so
//! no payload is ever copied into an event.

use crate::peer::PeerId;

/// Why a peer left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application asked for the disconnect.
    Requested,
    /// The remote side disconnected or said goodbye.
    Remote,
    /// An unrecoverable transport error.
    Error,
    /// Connect or keepalive deadline expired.
    Timeout,
}

/// Lifecycle events queued during a poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    PeerDiscovered(PeerId),
    PeerLost(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId, DisconnectReason),
}

/// Receiver for engine callbacks. All methods default to no-ops, so
/// implementations override only what they care about.
pub trait PeerTalkHandler {
    /// A new peer appeared in discovery (or recovered from FAILED).
    fn on_peer_discovered(&mut self, _peer: PeerId, _name: &[u8]) {}

    /// A discovered peer went silent past the peer timeout.
    fn on_peer_lost(&mut self, _peer: PeerId) {}

    fn on_peer_connected(&mut self, _peer: PeerId) {}

    fn on_peer_disconnected(&mut self, _peer: PeerId, _reason: DisconnectReason) {}

    /// A complete, checksum-valid frame arrived from a connected peer.
    fn on_message_received(&mut self, _peer: PeerId, _payload: &[u8]) {}
}

/// A handler that ignores everything; useful for polls driven purely
/// for their side effects.
pub struct NullHandler;

impl PeerTalkHandler for NullHandler {}
