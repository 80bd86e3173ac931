//! Byte-exact wire vectors
//!
//! These pin the on-the-wire layout. Any change here is a protocol break.

use crate::peer::{PeerId, PEER_ID_SIZE};
use crate::wire::{FrameType, WireHeader, WirePacket, HEADER_SIZE};

fn id(fill: u8) -> PeerId {
    PeerId([fill; PEER_ID_SIZE])
}

/// Hand-assembled encoding of a DATA frame carrying `de ad be ef`
fn data_vector() -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_SIZE + 4);
    v.push(0x01); // version
    v.extend_from_slice(&[0x00, 0x00, 0x00, 0x04]); // size
    v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // count
    v.push(0x00); // DATA
    v.extend_from_slice(&[0x00, 0x00]); // reserved
    v.extend_from_slice(&[0xdd; PEER_ID_SIZE]);
    v.extend_from_slice(&[0x55; PEER_ID_SIZE]);
    v.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    v
}

#[test]
fn vector_data_frame_encoding() {
    let packet = WirePacket::data(vec![0xde, 0xad, 0xbe, 0xef], id(0xdd), id(0x55));
    assert_eq!(packet.encode().as_ref(), data_vector().as_slice());
}

#[test]
fn vector_data_frame_decoding() {
    let (packet, consumed) = WirePacket::decode(&data_vector()).unwrap();
    assert_eq!(consumed, HEADER_SIZE + 4);
    assert_eq!(packet.header.version, 1);
    assert_eq!(packet.header.frame_type, FrameType::Data);
    assert_eq!(packet.header.dst, id(0xdd));
    assert_eq!(packet.header.src, id(0x55));
    assert_eq!(packet.payload().as_ref(), &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn vector_field_offsets() {
    let mut packet = WirePacket::handshake(vec![0u8; 0x0102], id(0x11), id(0x22));
    packet.header.count = 0x0a0b0c0d;
    packet.header.reserved = [0xee, 0xff];
    let bytes = packet.encode();

    assert_eq!(bytes[0], 0x01);
    assert_eq!(&bytes[1..5], &[0x00, 0x00, 0x01, 0x02]);
    assert_eq!(&bytes[5..9], &[0x0a, 0x0b, 0x0c, 0x0d]);
    assert_eq!(bytes[9], 0x01);
    assert_eq!(&bytes[10..12], &[0xee, 0xff]);
    assert!(bytes[12..50].iter().all(|b| *b == 0x11));
    assert!(bytes[50..88].iter().all(|b| *b == 0x22));
    assert_eq!(bytes.len(), HEADER_SIZE + 0x0102);
}

#[test]
fn vector_header_size_constant() {
    let header = WireHeader::new(FrameType::Data, PeerId::ZERO, PeerId::ZERO);
    let mut buf = bytes::BytesMut::new();
    header.encode_into(&mut buf);
    assert_eq!(buf.len(), HEADER_SIZE);
    assert_eq!(HEADER_SIZE, 12 + 2 * PEER_ID_SIZE);
}
