//! Stream frame assembly.
//!
//! Bytes arrive from the platform in arbitrary chunks and accumulate in
//! the peer's fixed input buffer. Complete frames are validated and
//! handed to the caller; a frame that fails its CRC is dropped (its
//! length is known, so the stream stays in sync) while a header that
//! fails to parse means the stream is desynchronized and the caller
//! resets the buffer.

use crate::peer::{FrameBuf, IBUF_SIZE};
use peertalk_proto::{verify_frame, MessageHeader, ProtoError, MESSAGE_HEADER_LEN};
use tracing::warn;

/// Extracts every complete frame currently in `ibuf`, invoking
/// `on_frame` for each valid one. Returns the number of valid frames
/// dispatched.
///
/// `Err` means the stream is beyond recovery (unparseable header, or a
/// declared frame that can never fit the buffer); the caller clears the
/// buffer and decides what to do with the peer.
pub(crate) fn extract_frames<F>(
    ibuf: &mut FrameBuf<IBUF_SIZE>,
    mut on_frame: F,
) -> Result<usize, ProtoError>
where
    F: FnMut(MessageHeader, &[u8]),
{
    let mut dispatched = 0;
    while ibuf.len() >= MESSAGE_HEADER_LEN {
        let header = MessageHeader::decode(ibuf.as_slice())?;
        let frame_len = header.frame_len();
        if frame_len > IBUF_SIZE {
            // Larger than the assembly buffer: can never complete.
            return Err(ProtoError::Invalid);
        }
        if ibuf.len() < frame_len {
            break;
        }
        match verify_frame(&ibuf.as_slice()[..frame_len]) {
            Ok((hdr, payload)) => {
                on_frame(hdr, payload);
                dispatched += 1;
            }
            Err(ProtoError::Crc) => {
                // The frame boundary is known; drop just this frame.
                warn!(len = frame_len, "dropping frame with bad checksum");
            }
            Err(e) => return Err(e),
        }
        ibuf.consume(frame_len);
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peertalk_proto::{encode_frame, MessageKind};

    fn frame(kind: MessageKind, seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() + 16];
        let len = encode_frame(kind, 0, seq, payload, &mut buf).unwrap();
        buf.truncate(len);
        buf
    }

    #[test]
    fn assembles_across_partial_arrivals() {
        let bytes = frame(MessageKind::Data, 1, b"hello");
        let mut ibuf: FrameBuf<IBUF_SIZE> = FrameBuf::new();
        let mut got = Vec::new();

        // First half: no frame yet.
        assert!(ibuf.extend(&bytes[..7]));
        let n = extract_frames(&mut ibuf, |_, p| got.push(p.to_vec())).unwrap();
        assert_eq!(n, 0);

        // Second half completes it.
        assert!(ibuf.extend(&bytes[7..]));
        let n = extract_frames(&mut ibuf, |_, p| got.push(p.to_vec())).unwrap();
        assert_eq!(n, 1);
        assert_eq!(got, vec![b"hello".to_vec()]);
        assert!(ibuf.is_empty());
    }

    #[test]
    fn two_frames_in_one_arrival() {
        let mut bytes = frame(MessageKind::Data, 1, b"one");
        bytes.extend(frame(MessageKind::Data, 2, b"two"));
        let mut ibuf: FrameBuf<IBUF_SIZE> = FrameBuf::new();
        assert!(ibuf.extend(&bytes));

        let mut seqs = Vec::new();
        let n = extract_frames(&mut ibuf, |h, _| seqs.push(h.seq)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn corrupt_frame_is_skipped_stream_continues() {
        let mut bad = frame(MessageKind::Data, 1, b"corrupt me");
        let last = bad.len() - 1;
        bad[last] ^= 0xff; // break the CRC, keep the header intact
        bad.extend(frame(MessageKind::Data, 2, b"good"));

        let mut ibuf: FrameBuf<IBUF_SIZE> = FrameBuf::new();
        assert!(ibuf.extend(&bad));
        let mut got = Vec::new();
        let n = extract_frames(&mut ibuf, |_, p| got.push(p.to_vec())).unwrap();
        assert_eq!(n, 1, "only the valid frame is dispatched");
        assert_eq!(got, vec![b"good".to_vec()]);
    }

    #[test]
    fn garbage_header_is_a_desync() {
        let mut ibuf: FrameBuf<IBUF_SIZE> = FrameBuf::new();
        assert!(ibuf.extend(b"not a frame header"));
        assert!(extract_frames(&mut ibuf, |_, _| {}).is_err());
    }
}
