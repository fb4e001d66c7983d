//! # PeerTalk wire formats
//!
//! The three on-the-wire encodings of the PeerTalk LAN protocol:
//!
//! - **Discovery packets** (`PTLK`): ANNOUNCE / QUERY / GOODBYE datagrams
//!   broadcast over UDP, trailed by a CRC-16.
//! - **Message frames** (`PTMG`): a fixed 10-byte header, a payload of up
//!   to 64 KiB, and a CRC-16 trailer, carried over a reliable stream.
//! - **UDP data frames** (`PTUD`): an 8-byte header and payload with no
//!   trailer; UDP's own checksum is relied upon.
//!
//! All multi-byte fields are big-endian and are read and written with
//! explicit shift-and-combine, never reinterpret casts. Magic bytes are
//! compared byte-by-byte so the code reads identically on either byte
//! order. Decoding is defensive: any structurally valid but semantically
//! unexpected field yields an error and no partial object.

pub mod crc;

pub use crc::{crc16, crc16_update};

use smallvec::SmallVec;
use thiserror::Error;

/// Magic prefix of discovery packets.
pub const DISCOVERY_MAGIC: [u8; 4] = [b'P', b'T', b'L', b'K'];
/// Magic prefix of stream message frames.
pub const MESSAGE_MAGIC: [u8; 4] = [b'P', b'T', b'M', b'G'];
/// Magic prefix of UDP data frames.
pub const UDP_MAGIC: [u8; 4] = [b'P', b'T', b'U', b'D'];

/// Protocol version emitted and accepted by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum peer name length on the wire.
pub const MAX_NAME_LEN: usize = 31;
/// Smallest valid discovery packet (empty name).
pub const DISCOVERY_MIN_LEN: usize = 14;
/// Largest valid discovery packet (31-byte name).
pub const DISCOVERY_MAX_LEN: usize = DISCOVERY_MIN_LEN + MAX_NAME_LEN;
/// Fixed message frame header size.
pub const MESSAGE_HEADER_LEN: usize = 10;
/// CRC-16 trailer size.
pub const FRAME_TRAILER_LEN: usize = 2;
/// Smallest valid message frame (empty payload).
pub const MESSAGE_MIN_LEN: usize = MESSAGE_HEADER_LEN + FRAME_TRAILER_LEN;
/// Largest payload a message frame can declare.
pub const MAX_PAYLOAD_LEN: usize = 65_535;
/// Fixed UDP data frame header size.
pub const UDP_HEADER_LEN: usize = 8;

/// Discovery flag: sender is hosting a session.
pub const DISC_FLAG_HOST: u16 = 1 << 0;
/// Discovery flag: sender accepts new connections.
pub const DISC_FLAG_ACCEPTING: u16 = 1 << 1;
/// Discovery flag: sender is a spectator.
pub const DISC_FLAG_SPECTATOR: u16 = 1 << 2;
/// Discovery flag: sender is ready.
pub const DISC_FLAG_READY: u16 = 1 << 3;

/// Message flag: delivery may be lossy.
pub const MSG_FLAG_UNRELIABLE: u8 = 1 << 0;
/// Message flag: newer messages with the same key may replace this one.
pub const MSG_FLAG_COALESCABLE: u8 = 1 << 1;
/// Message flag: bypass batching delays.
pub const MSG_FLAG_NO_DELAY: u8 = 1 << 2;
/// Message flag: part of a batch.
pub const MSG_FLAG_BATCH: u8 = 1 << 3;

/// Transport bit: TCP.
pub const TRANSPORT_TCP: u8 = 1 << 0;
/// Transport bit: UDP.
pub const TRANSPORT_UDP: u8 = 1 << 1;
/// Transport bit: AppleTalk (ADSP/NBP).
pub const TRANSPORT_APPLETALK: u8 = 1 << 2;

/// Decode and encode failures.
///
/// Decoders return exactly one of these; no partially filled packet ever
/// reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("buffer too short for a complete packet")]
    Truncated,
    #[error("bad magic bytes")]
    Magic,
    #[error("unsupported protocol version")]
    Version,
    #[error("invalid field value")]
    Invalid,
    #[error("checksum mismatch")]
    Crc,
    #[error("output buffer too small")]
    BufferFull,
}

#[inline]
fn read_u16_be(buf: &[u8], at: usize) -> u16 {
    ((buf[at] as u16) << 8) | buf[at + 1] as u16
}

#[inline]
fn write_u16_be(buf: &mut [u8], at: usize, val: u16) {
    buf[at] = (val >> 8) as u8;
    buf[at + 1] = (val & 0xff) as u8;
}

#[inline]
fn magic_matches(buf: &[u8], magic: &[u8; 4]) -> bool {
    buf.len() >= 4 && buf[0] == magic[0] && buf[1] == magic[1] && buf[2] == magic[2] && buf[3] == magic[3]
}

/// The three discovery packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryKind {
    Announce = 1,
    Query = 2,
    Goodbye = 3,
}

impl DiscoveryKind {
    /// Maps a wire byte back to a kind. Unknown values are rejected.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(DiscoveryKind::Announce),
            2 => Some(DiscoveryKind::Query),
            3 => Some(DiscoveryKind::Goodbye),
            _ => None,
        }
    }
}

/// A parsed discovery packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub kind: DiscoveryKind,
    pub flags: u16,
    /// The sender's stream listening port.
    pub sender_port: u16,
    /// Bitmask over [`TRANSPORT_TCP`], [`TRANSPORT_UDP`], [`TRANSPORT_APPLETALK`].
    pub transports: u8,
    /// Raw name bytes, at most [`MAX_NAME_LEN`]. No terminator on the wire.
    pub name: SmallVec<[u8; MAX_NAME_LEN]>,
}

impl DiscoveryPacket {
    pub fn new(kind: DiscoveryKind, sender_port: u16, transports: u8, name: &[u8]) -> Self {
        let mut bounded = SmallVec::new();
        bounded.extend_from_slice(&name[..name.len().min(MAX_NAME_LEN)]);
        DiscoveryPacket {
            kind,
            flags: 0,
            sender_port,
            transports,
            name: bounded,
        }
    }

    /// Total encoded size including the CRC trailer.
    pub fn encoded_len(&self) -> usize {
        DISCOVERY_MIN_LEN + self.name.len()
    }

    /// Writes the packet into `buf` and appends the CRC-16 in big-endian.
    ///
    /// Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProtoError::Invalid);
        }
        let total = self.encoded_len();
        if buf.len() < total {
            return Err(ProtoError::BufferFull);
        }
        buf[..4].copy_from_slice(&DISCOVERY_MAGIC);
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.kind as u8;
        write_u16_be(buf, 6, self.flags);
        write_u16_be(buf, 8, self.sender_port);
        buf[10] = self.transports;
        buf[11] = self.name.len() as u8;
        buf[12..12 + self.name.len()].copy_from_slice(&self.name);
        let crc = crc16(&buf[..total - FRAME_TRAILER_LEN]);
        write_u16_be(buf, total - FRAME_TRAILER_LEN, crc);
        Ok(total)
    }

    /// Parses and validates a discovery packet.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < DISCOVERY_MIN_LEN {
            return Err(ProtoError::Truncated);
        }
        if !magic_matches(buf, &DISCOVERY_MAGIC) {
            return Err(ProtoError::Magic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(ProtoError::Version);
        }
        let kind = DiscoveryKind::from_wire(buf[5]).ok_or(ProtoError::Invalid)?;
        let name_len = buf[11] as usize;
        if name_len > MAX_NAME_LEN {
            return Err(ProtoError::Invalid);
        }
        let total = DISCOVERY_MIN_LEN + name_len;
        if buf.len() < total {
            return Err(ProtoError::Truncated);
        }
        let declared = read_u16_be(buf, total - FRAME_TRAILER_LEN);
        let computed = crc16(&buf[..total - FRAME_TRAILER_LEN]);
        if declared != computed {
            return Err(ProtoError::Crc);
        }
        let mut name = SmallVec::new();
        name.extend_from_slice(&buf[12..12 + name_len]);
        Ok(DiscoveryPacket {
            kind,
            flags: read_u16_be(buf, 6),
            sender_port: read_u16_be(buf, 8),
            transports: buf[10],
            name,
        })
    }
}

/// The six stream message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Data = 1,
    Ping = 2,
    Pong = 3,
    Disconnect = 4,
    Ack = 5,
    Reject = 6,
}

impl MessageKind {
    /// Maps a wire byte back to a kind. Unknown values are rejected.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageKind::Data),
            2 => Some(MessageKind::Ping),
            3 => Some(MessageKind::Pong),
            4 => Some(MessageKind::Disconnect),
            5 => Some(MessageKind::Ack),
            6 => Some(MessageKind::Reject),
            _ => None,
        }
    }
}

/// The fixed 10-byte header of a stream message frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageKind,
    pub flags: u8,
    /// 8-bit wrap-around sequence number.
    pub seq: u8,
    pub payload_len: u16,
}

impl MessageHeader {
    /// Total frame size implied by this header, trailer included.
    pub fn frame_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload_len as usize + FRAME_TRAILER_LEN
    }

    /// Writes the fixed header into the front of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtoError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Err(ProtoError::BufferFull);
        }
        buf[..4].copy_from_slice(&MESSAGE_MAGIC);
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.kind as u8;
        buf[6] = self.flags;
        buf[7] = self.seq;
        write_u16_be(buf, 8, self.payload_len);
        Ok(MESSAGE_HEADER_LEN)
    }

    /// Parses and validates the fixed header. The payload and CRC are not
    /// inspected here; callers wait for `frame_len` bytes and then use
    /// [`verify_frame`].
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Err(ProtoError::Truncated);
        }
        if !magic_matches(buf, &MESSAGE_MAGIC) {
            return Err(ProtoError::Magic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(ProtoError::Version);
        }
        let kind = MessageKind::from_wire(buf[5]).ok_or(ProtoError::Invalid)?;
        Ok(MessageHeader {
            kind,
            flags: buf[6],
            seq: buf[7],
            payload_len: read_u16_be(buf, 8),
        })
    }
}

/// Frames `payload` into `buf`: header, payload, CRC-16 trailer.
///
/// Returns the number of bytes written.
pub fn encode_frame(
    kind: MessageKind,
    flags: u8,
    seq: u8,
    payload: &[u8],
    buf: &mut [u8],
) -> Result<usize, ProtoError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::Invalid);
    }
    let total = MESSAGE_HEADER_LEN + payload.len() + FRAME_TRAILER_LEN;
    if buf.len() < total {
        return Err(ProtoError::BufferFull);
    }
    let header = MessageHeader {
        kind,
        flags,
        seq,
        payload_len: payload.len() as u16,
    };
    header.encode(buf)?;
    buf[MESSAGE_HEADER_LEN..MESSAGE_HEADER_LEN + payload.len()].copy_from_slice(payload);
    let crc = crc16(&buf[..total - FRAME_TRAILER_LEN]);
    write_u16_be(buf, total - FRAME_TRAILER_LEN, crc);
    Ok(total)
}

/// Validates a complete frame and returns its header and payload.
///
/// `buf` must hold exactly one frame (as sized by the already-decoded
/// header's [`MessageHeader::frame_len`]).
pub fn verify_frame(buf: &[u8]) -> Result<(MessageHeader, &[u8]), ProtoError> {
    let header = MessageHeader::decode(buf)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Err(ProtoError::Truncated);
    }
    let declared = read_u16_be(buf, total - FRAME_TRAILER_LEN);
    let computed = crc16(&buf[..total - FRAME_TRAILER_LEN]);
    if declared != computed {
        return Err(ProtoError::Crc);
    }
    Ok((header, &buf[MESSAGE_HEADER_LEN..total - FRAME_TRAILER_LEN]))
}

/// Writes a UDP data frame: 8-byte `PTUD` header followed by the payload.
///
/// No CRC trailer; UDP's own checksum is relied upon.
pub fn udp_encode(sender_port: u16, payload: &[u8], buf: &mut [u8]) -> Result<usize, ProtoError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::Invalid);
    }
    let total = UDP_HEADER_LEN + payload.len();
    if buf.len() < total {
        return Err(ProtoError::BufferFull);
    }
    buf[..4].copy_from_slice(&UDP_MAGIC);
    write_u16_be(buf, 4, sender_port);
    write_u16_be(buf, 6, payload.len() as u16);
    buf[UDP_HEADER_LEN..total].copy_from_slice(payload);
    Ok(total)
}

/// Parses a UDP data frame, returning the sender port and payload.
pub fn udp_decode(buf: &[u8]) -> Result<(u16, &[u8]), ProtoError> {
    if buf.len() < UDP_HEADER_LEN {
        return Err(ProtoError::Truncated);
    }
    if !magic_matches(buf, &UDP_MAGIC) {
        return Err(ProtoError::Magic);
    }
    let sender_port = read_u16_be(buf, 4);
    let payload_len = read_u16_be(buf, 6) as usize;
    if buf.len() < UDP_HEADER_LEN + payload_len {
        return Err(ProtoError::Truncated);
    }
    Ok((sender_port, &buf[UDP_HEADER_LEN..UDP_HEADER_LEN + payload_len]))
}
