use peertalk_proto::{
    crc16, encode_frame, udp_decode, udp_encode, verify_frame, DiscoveryKind, DiscoveryPacket,
    MessageHeader, MessageKind, ProtoError, DISCOVERY_MIN_LEN, DISC_FLAG_ACCEPTING, DISC_FLAG_HOST,
    MESSAGE_HEADER_LEN, MSG_FLAG_COALESCABLE, TRANSPORT_TCP, TRANSPORT_UDP,
};

#[test]
fn test_discovery_round_trip() {
    let mut pkt = DiscoveryPacket::new(
        DiscoveryKind::Announce,
        4242,
        TRANSPORT_TCP | TRANSPORT_UDP,
        b"Alice",
    );
    pkt.flags = DISC_FLAG_HOST | DISC_FLAG_ACCEPTING;

    let mut buf = [0u8; 64];
    let len = pkt.encode(&mut buf).unwrap();
    assert_eq!(len, DISCOVERY_MIN_LEN + 5);

    let decoded = DiscoveryPacket::decode(&buf[..len]).unwrap();
    assert_eq!(decoded, pkt);
}

#[test]
fn test_discovery_wire_layout() {
    let pkt = DiscoveryPacket::new(DiscoveryKind::Query, 0x1f90, TRANSPORT_TCP, b"");
    let mut buf = [0u8; 32];
    let len = pkt.encode(&mut buf).unwrap();
    assert_eq!(len, 14);
    assert_eq!(&buf[..4], b"PTLK");
    assert_eq!(buf[4], 1, "version");
    assert_eq!(buf[5], 2, "QUERY type byte");
    assert_eq!(&buf[8..10], &[0x1f, 0x90], "port is big-endian");
    assert_eq!(buf[11], 0, "empty name");
    let crc = crc16(&buf[..12]);
    assert_eq!(&buf[12..14], &[(crc >> 8) as u8, (crc & 0xff) as u8]);
}

#[test]
fn test_discovery_rejects_bad_input() {
    let pkt = DiscoveryPacket::new(DiscoveryKind::Announce, 9, TRANSPORT_UDP, b"Bob");
    let mut buf = [0u8; 64];
    let len = pkt.encode(&mut buf).unwrap();

    assert_eq!(
        DiscoveryPacket::decode(&buf[..10]),
        Err(ProtoError::Truncated)
    );

    let mut bad = buf;
    bad[0] = b'X';
    assert_eq!(DiscoveryPacket::decode(&bad[..len]), Err(ProtoError::Magic));

    let mut bad = buf;
    bad[4] = 2;
    assert_eq!(
        DiscoveryPacket::decode(&bad[..len]),
        Err(ProtoError::Version)
    );

    let mut bad = buf;
    bad[5] = 7; // unknown type
    assert_eq!(
        DiscoveryPacket::decode(&bad[..len]),
        Err(ProtoError::Invalid)
    );

    let mut bad = buf;
    bad[11] = 32; // name length over the wire limit
    assert_eq!(
        DiscoveryPacket::decode(&bad[..len]),
        Err(ProtoError::Invalid)
    );

    // Flipping a name byte must be caught by the CRC.
    let mut bad = buf;
    bad[12] ^= 0x01;
    assert_eq!(DiscoveryPacket::decode(&bad[..len]), Err(ProtoError::Crc));
}

#[test]
fn test_discovery_name_is_truncated_to_wire_limit() {
    let long = [b'x'; 64];
    let pkt = DiscoveryPacket::new(DiscoveryKind::Announce, 1, TRANSPORT_TCP, &long);
    assert_eq!(pkt.name.len(), 31);
    let mut buf = [0u8; 64];
    let len = pkt.encode(&mut buf).unwrap();
    assert_eq!(len, 45, "largest discovery packet is 45 bytes");
}

#[test]
fn test_message_header_round_trip() {
    let hdr = MessageHeader {
        kind: MessageKind::Data,
        flags: MSG_FLAG_COALESCABLE,
        seq: 250,
        payload_len: 1000,
    };
    let mut buf = [0u8; MESSAGE_HEADER_LEN];
    hdr.encode(&mut buf).unwrap();
    assert_eq!(&buf[..4], b"PTMG");
    assert_eq!(MessageHeader::decode(&buf).unwrap(), hdr);
}

#[test]
fn test_frame_round_trip_and_bit_flip() {
    let mut buf = [0u8; 128];
    let len = encode_frame(MessageKind::Data, 0, 7, b"hello", &mut buf).unwrap();
    assert_eq!(len, 10 + 5 + 2);

    let (hdr, payload) = verify_frame(&buf[..len]).unwrap();
    assert_eq!(hdr.kind, MessageKind::Data);
    assert_eq!(hdr.seq, 7);
    assert_eq!(payload, b"hello");

    // Any single-bit flip anywhere in the frame must fail validation.
    for byte in 0..len {
        for bit in 0..8 {
            let mut corrupt = buf;
            corrupt[byte] ^= 1 << bit;
            assert!(
                verify_frame(&corrupt[..len]).is_err(),
                "flip at byte {} bit {} went undetected",
                byte,
                bit
            );
        }
    }
}

#[test]
fn test_frame_empty_payload() {
    let mut buf = [0u8; 16];
    let len = encode_frame(MessageKind::Ping, 0, 0, b"", &mut buf).unwrap();
    assert_eq!(len, 12, "smallest frame is 12 bytes");
    let (hdr, payload) = verify_frame(&buf[..len]).unwrap();
    assert_eq!(hdr.kind, MessageKind::Ping);
    assert!(payload.is_empty());
}

#[test]
fn test_frame_output_buffer_too_small() {
    let mut buf = [0u8; 8];
    assert_eq!(
        encode_frame(MessageKind::Data, 0, 0, b"hi", &mut buf),
        Err(ProtoError::BufferFull)
    );
}

#[test]
fn test_udp_round_trip() {
    let mut buf = [0u8; 64];
    let len = udp_encode(4242, b"state update", &mut buf).unwrap();
    assert_eq!(&buf[..4], b"PTUD");
    let (port, payload) = udp_decode(&buf[..len]).unwrap();
    assert_eq!(port, 4242);
    assert_eq!(payload, b"state update");
}

#[test]
fn test_udp_truncated_payload() {
    let mut buf = [0u8; 64];
    let len = udp_encode(1, b"abcdef", &mut buf).unwrap();
    // Declared length exceeds what actually arrived.
    assert_eq!(udp_decode(&buf[..len - 2]), Err(ProtoError::Truncated));
}
