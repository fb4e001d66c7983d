//! The platform ops contract.
//!
//! A transport implementation fills in this trait; the engine never
//! touches a socket itself. Every call must be non-blocking: readiness
//! and completion are observed by polling from the main loop, never by
//! callbacks. `testing::SimulatedLan` provides an in-memory
//! implementation for tests.

use crate::error::Result;
use crate::tick::Ticks;

/// Handle for one stream connection, assigned by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u32);

/// Handle for one in-flight asynchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTicket(pub u32);

/// Progress of an outbound connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    InProgress,
    Ready,
    Failed,
}

pub trait Platform {
    /// Monotonic millisecond tick, wrapping at `u32::MAX`.
    fn ticks(&self) -> Ticks;

    /// Binds the discovery datagram port and the stream listening port.
    /// Called once at context construction.
    fn bind(&mut self, udp_port: u16, tcp_port: u16) -> Result<()>;

    /// Sends a datagram to the LAN broadcast address.
    fn udp_broadcast(&mut self, data: &[u8]) -> Result<()>;

    /// Sends a datagram to one host.
    fn udp_send_to(&mut self, addr: [u8; 4], port: u16, data: &[u8]) -> Result<()>;

    /// Receives one pending datagram, or `None` when nothing is queued.
    /// Returns the payload length and the sender's address and port.
    fn udp_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, [u8; 4], u16)>>;

    /// Initiates an outbound stream connection; completion is observed
    /// through [`Platform::connect_status`].
    fn connect(&mut self, addr: [u8; 4], port: u16) -> Result<ConnId>;

    fn connect_status(&mut self, conn: ConnId) -> ConnectStatus;

    /// Polls the listener for one accepted connection. The engine drains
    /// this to `None` before touching any payload, which keeps the
    /// accept gap bounded.
    fn accept(&mut self) -> Result<Option<(ConnId, [u8; 4], u16)>>;

    /// Non-blocking stream read. `None` means nothing available;
    /// `Some(0)` means the remote closed the stream.
    fn stream_recv(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Hands a buffer to the platform's asynchronous send primitive.
    /// The buffer's contents must remain stable until
    /// [`Platform::send_status`] reports completion.
    fn stream_send_async(&mut self, conn: ConnId, data: &[u8]) -> Result<SendTicket>;

    /// Status word of an in-flight send: positive while in progress,
    /// zero on success, negative on error. Non-positive means the
    /// platform is done with the buffer.
    fn send_status(&mut self, conn: ConnId, ticket: SendTicket) -> i32;

    /// Synchronous (but still bounded) send fallback.
    fn stream_send(&mut self, conn: ConnId, data: &[u8]) -> Result<()>;

    /// Initiates an orderly close; completion is observed through
    /// [`Platform::close_status`].
    fn close(&mut self, conn: ConnId);

    /// True once the close has completed and the handle is dead.
    fn close_status(&mut self, conn: ConnId) -> bool;
}
