//! Bilibili live binary packet framing.
//!
//! Every frame starts with a 16-byte big-endian header: total length (u32),
//! header length (u16), protocol version (u16), operation (u32), sequence
//! (u32). Version 2 and 3 bodies are zlib/brotli-compressed batches of
//! nested frames.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;

use crate::error::{Error, Result};

/// Frame header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Operation codes.
pub mod op {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const NOTIFICATION: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

/// Protocol versions.
pub mod ver {
    pub const RAW_JSON: u16 = 0;
    pub const POPULARITY: u16 = 1;
    pub const ZLIB: u16 = 2;
    pub const BROTLI: u16 = 3;
}

/// Heartbeat packet (operation = 2) with the literal body "[object Object]".
pub const HEARTBEAT: &[u8] = &[
    0x00, 0x00, 0x00, 0x1f, // packet length = 31
    0x00, 0x10, // header length = 16
    0x00, 0x01, // version = 1
    0x00, 0x00, 0x00, 0x02, // operation = 2 (heartbeat)
    0x00, 0x00, 0x00, 0x01, // sequence = 1
    // "[object Object]"
    0x5b, 0x6f, 0x62, 0x6a, 0x65, 0x63, 0x74, 0x20, 0x4f, 0x62, 0x6a, 0x65, 0x63, 0x74, 0x5d,
];

/// A decoded frame body with its operation code.
#[derive(Debug)]
pub struct DecodedPacket {
    pub operation: u32,
    pub body: Vec<u8>,
}

/// Build a packet with the given body and operation code.
pub fn build_packet(body: &[u8], operation: u32) -> Vec<u8> {
    let packet_len = HEADER_LEN + body.len();
    let mut packet = Vec::with_capacity(packet_len);

    packet.extend_from_slice(&(packet_len as u32).to_be_bytes());
    packet.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // version
    packet.extend_from_slice(&operation.to_be_bytes());
    packet.extend_from_slice(&1u32.to_be_bytes()); // sequence
    packet.extend_from_slice(body);

    packet
}

/// Decode a buffer of frames, recursing into compressed batches.
///
/// Truncated or unknown-version frames are skipped rather than failing the
/// whole buffer.
pub fn decode_packets(data: &[u8]) -> Vec<DecodedPacket> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset + HEADER_LEN <= data.len() {
        let packet_len = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        let version = BigEndian::read_u16(&data[offset + 6..offset + 8]);
        let operation = BigEndian::read_u32(&data[offset + 8..offset + 12]);

        if packet_len < HEADER_LEN || offset + packet_len > data.len() {
            break;
        }

        let body = &data[offset + HEADER_LEN..offset + packet_len];

        match version {
            ver::ZLIB => {
                if let Ok(decompressed) = decompress_zlib(body) {
                    packets.extend(decode_packets(&decompressed));
                }
            }
            ver::BROTLI => {
                if let Ok(decompressed) = decompress_brotli(body) {
                    packets.extend(decode_packets(&decompressed));
                }
            }
            ver::RAW_JSON | ver::POPULARITY => {
                packets.push(DecodedPacket {
                    operation,
                    body: body.to_vec(),
                });
            }
            _ => {
                tracing::debug!("Unknown protocol version: {}", version);
            }
        }

        offset += packet_len;
    }

    packets
}

fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::protocol(format!("zlib decompression failed: {e}")))?;
    Ok(decompressed)
}

fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut decompressed)
        .map_err(|e| Error::protocol(format!("brotli decompression failed: {e}")))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_packet_header() {
        let packet = build_packet(b"{}", op::AUTH);

        assert_eq!(packet.len(), HEADER_LEN + 2);
        assert_eq!(BigEndian::read_u32(&packet[0..4]), 18);
        assert_eq!(BigEndian::read_u16(&packet[4..6]), 16);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), op::AUTH);
        assert_eq!(&packet[HEADER_LEN..], b"{}");
    }

    #[test]
    fn test_decode_raw_packet() {
        let packet = build_packet(br#"{"cmd":"DANMU_MSG"}"#, op::NOTIFICATION);
        let decoded = decode_packets(&packet);

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].operation, op::NOTIFICATION);
        assert_eq!(decoded[0].body, br#"{"cmd":"DANMU_MSG"}"#);
    }

    #[test]
    fn test_decode_concatenated_packets() {
        let mut data = build_packet(b"first", op::NOTIFICATION);
        data.extend_from_slice(&build_packet(b"second", op::NOTIFICATION));

        let decoded = decode_packets(&data);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].body, b"first");
        assert_eq!(decoded[1].body, b"second");
    }

    #[test]
    fn test_decode_truncated_packet() {
        let packet = build_packet(b"body", op::NOTIFICATION);
        let decoded = decode_packets(&packet[..packet.len() - 1]);

        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_zlib_batch() {
        use flate2::Compression;
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let inner = build_packet(br#"{"cmd":"DANMU_MSG"}"#, op::NOTIFICATION);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&inner).unwrap();
        let compressed = encoder.finish().unwrap();

        // Wrap the compressed batch in a version-2 frame by hand.
        let mut outer = build_packet(&compressed, op::NOTIFICATION);
        outer[6..8].copy_from_slice(&ver::ZLIB.to_be_bytes());

        let decoded = decode_packets(&outer);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].body, br#"{"cmd":"DANMU_MSG"}"#);
    }

    #[test]
    fn test_heartbeat_constant_is_valid_frame() {
        assert_eq!(BigEndian::read_u32(&HEARTBEAT[0..4]) as usize, HEARTBEAT.len());
        assert_eq!(BigEndian::read_u32(&HEARTBEAT[8..12]), op::HEARTBEAT);
    }
}
