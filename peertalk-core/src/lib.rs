//! # PeerTalk core
//!
//! The platform-independent engine of PeerTalk, a peer-to-peer
//! networking library for small LAN deployments: UDP broadcast
//! discovery, reliable framed messaging over streams, a fixed-capacity
//! peer registry with a validated state machine, pre-allocated
//! priority/coalescing send queues, and a bounded asynchronous send
//! pipeline — all driven by a single-threaded cooperative poll loop.
//!
//! Transport drivers live behind the [`platform::Platform`] trait; the
//! engine itself never opens a socket. [`testing::SimulatedLan`]
//! provides an in-memory implementation with deterministic time for
//! tests and examples.
//!
//! ```no_run
//! use peertalk_core::{Config, NullHandler, PeerTalk};
//! use peertalk_core::testing::SimulatedLan;
//!
//! let lan = SimulatedLan::new();
//! let platform = lan.endpoint([192, 168, 1, 10]);
//! let mut node = PeerTalk::new(Config::new("Alice"), platform).unwrap();
//! node.start_discovery();
//! loop {
//!     node.poll(&mut NullHandler);
//!     // ... application work, then sleep 20-50 ms ...
//! }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod discovery;
pub mod error;
pub mod events;
pub mod peer;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod registry;
pub mod testing;
pub mod tick;

pub use config::Config;
pub use context::{PeerInfo, PeerTalk};
pub use error::{PeerTalkError, Result};
pub use events::{DisconnectReason, NullHandler, PeerTalkHandler};
pub use peer::{PeerId, PeerState};
pub use queue::{Backpressure, Priority};
pub use tick::{ManualTickSource, SystemTickSource, TickSource, Ticks};
