use peertalk_proto::ProtoError;
use thiserror::Error;

/// Errors returned uniformly from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerTalkError {
    #[error("invalid parameter")]
    InvalidParam,
    #[error("allocation refused")]
    NoMemory,
    #[error("fixed buffer cannot hold result")]
    BufferFull,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("peer not found")]
    PeerNotFound,
    #[error("peer is not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("non-blocking operation has no free slot")]
    WouldBlock,
    #[error("message dropped by backpressure policy")]
    Backpressure,
    #[error("platform resource exhausted")]
    Resource,
    #[error("queue capacity must be a power of two")]
    NotPowerOfTwo,
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, PeerTalkError>;
