//! Wire format for update datagrams and the short status replies.
//!
//! ```text
//! offset 0:  4 bytes  marker           ASCII "UPD8"
//! offset 4:  4 bytes  sequence number  u32
//! offset 8:  4 bytes  packet type      u32 (0 = metadata, 1 = image data)
//! offset 12: 4 bytes  payload length   u32
//! offset 16: ...      payload
//! ```
//!
//! Header and payload integers are little-endian, the byte order of the device.
//! Parsing never trusts a declared length beyond the bytes actually received.

use heapless::Vec as FixedVec;
use thiserror::Error;

pub const MARKER: [u8; 4] = *b"UPD8";
pub const HEADER_LEN: usize = 16;
pub const METADATA_LEN: usize = 12;
pub const CHUNK_PREFIX_LEN: usize = 4;

pub const PACKET_TYPE_METADATA: u32 = 0;
pub const PACKET_TYPE_IMAGE_DATA: u32 = 1;

pub const ACK_LEN: usize = 6;
pub const ERROR_REPLY: &[u8] = b"ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub image_size_bytes: u32,
    pub num_packets: u32,
    pub image_checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBody<'a> {
    Metadata(Metadata),
    /// Chunk bytes, already bounded by the declared chunk size
    ImageData(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub sequence_number: u32,
    pub body: PacketBody<'a>,
}

/// Reasons a datagram is not handed to the session. None of them produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram does not start with the update marker")]
    NotAnUpdatePacket,
    #[error("datagram too short: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unrecognized packet type {0}")]
    UnknownPacketType(u32),
    #[error("declared length {declared} exceeds the {available} bytes received")]
    LengthOverrun { declared: u32, available: usize },
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, len: u32) -> Result<&'a [u8], ParseError> {
        let available = self.data.len() - self.pos;
        let len_usize = len as usize;
        if len_usize > available {
            return Err(ParseError::LengthOverrun { declared: len, available });
        }
        let slice = &self.data[self.pos..self.pos + len_usize];
        self.pos += len_usize;
        Ok(slice)
    }

    fn read_u32_le(&mut self) -> Result<u32, ParseError> {
        let bytes = self.remaining();
        if bytes.len() < 4 {
            return Err(ParseError::Truncated {
                expected: self.pos + 4,
                actual: self.data.len(),
            });
        }
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Parse one received datagram into a typed packet.
pub fn parse(datagram: &[u8]) -> Result<Packet<'_>, ParseError> {
    if datagram.len() < MARKER.len() || datagram[..MARKER.len()] != MARKER {
        return Err(ParseError::NotAnUpdatePacket);
    }
    if datagram.len() < HEADER_LEN {
        return Err(ParseError::Truncated {
            expected: HEADER_LEN,
            actual: datagram.len(),
        });
    }

    let mut header = ByteReader::new(&datagram[MARKER.len()..HEADER_LEN]);
    let sequence_number = header.read_u32_le()?;
    let packet_type = header.read_u32_le()?;
    let payload_length = header.read_u32_le()?;

    let mut rest = ByteReader::new(&datagram[HEADER_LEN..]);
    let mut payload = ByteReader::new(rest.take(payload_length)?);

    let body = match packet_type {
        PACKET_TYPE_METADATA => {
            if payload.remaining().len() < METADATA_LEN {
                return Err(ParseError::Truncated {
                    expected: HEADER_LEN + METADATA_LEN,
                    actual: HEADER_LEN + payload.remaining().len(),
                });
            }
            PacketBody::Metadata(Metadata {
                image_size_bytes: payload.read_u32_le()?,
                num_packets: payload.read_u32_le()?,
                image_checksum: payload.read_u32_le()?,
            })
        }
        PACKET_TYPE_IMAGE_DATA => {
            let chunk_size = payload.read_u32_le()?;
            PacketBody::ImageData(payload.take(chunk_size)?)
        }
        other => return Err(ParseError::UnknownPacketType(other)),
    };

    Ok(Packet {
        sequence_number,
        body,
    })
}

fn encode(sequence_number: u32, packet_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MARKER);
    out.extend_from_slice(&sequence_number.to_le_bytes());
    out.extend_from_slice(&packet_type.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build a metadata datagram. Receivers only accept sequence number 0.
pub fn encode_metadata(sequence_number: u32, metadata: &Metadata) -> Vec<u8> {
    let mut payload = [0u8; METADATA_LEN];
    payload[0..4].copy_from_slice(&metadata.image_size_bytes.to_le_bytes());
    payload[4..8].copy_from_slice(&metadata.num_packets.to_le_bytes());
    payload[8..12].copy_from_slice(&metadata.image_checksum.to_le_bytes());
    encode(sequence_number, PACKET_TYPE_METADATA, &payload)
}

/// Build an image-data datagram carrying `chunk`.
pub fn encode_image_data(sequence_number: u32, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CHUNK_PREFIX_LEN + chunk.len());
    payload.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    payload.extend_from_slice(chunk);
    encode(sequence_number, PACKET_TYPE_IMAGE_DATA, &payload)
}

/// `"OK"` followed by the native-endian sequence number being acknowledged.
pub fn build_ack(last_sequence_number: u32) -> [u8; ACK_LEN] {
    let mut out = [0u8; ACK_LEN];
    out[..2].copy_from_slice(b"OK");
    out[2..].copy_from_slice(&last_sequence_number.to_ne_bytes());
    out
}

pub fn build_error() -> [u8; 5] {
    *b"ERROR"
}

/// Status reply sent back to the flashing tool after each accepted datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(u32),
    Error,
}

impl Reply {
    pub fn encode(&self) -> FixedVec<u8, ACK_LEN> {
        match self {
            Reply::Ack(seq) => FixedVec::from_slice(&build_ack(*seq)),
            Reply::Error => FixedVec::from_slice(ERROR_REPLY),
        }
        .unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [b'O', b'K', a, b, c, d] => Some(Reply::Ack(u32::from_ne_bytes([*a, *b, *c, *d]))),
            b"ERROR" => Some(Reply::Error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        Metadata {
            image_size_bytes: 4096,
            num_packets: 4,
            image_checksum: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_parse_metadata() {
        let datagram = encode_metadata(0, &metadata());
        assert_eq!(datagram.len(), HEADER_LEN + METADATA_LEN);

        let packet = parse(&datagram).unwrap();
        assert_eq!(packet.sequence_number, 0);
        assert_eq!(packet.body, PacketBody::Metadata(metadata()));
    }

    #[test]
    fn test_parse_image_data_layout() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(b"UPD8");
        datagram.extend_from_slice(&7u32.to_le_bytes());
        datagram.extend_from_slice(&1u32.to_le_bytes());
        datagram.extend_from_slice(&7u32.to_le_bytes());
        datagram.extend_from_slice(&3u32.to_le_bytes());
        datagram.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let packet = parse(&datagram).unwrap();
        assert_eq!(packet.sequence_number, 7);
        assert_eq!(packet.body, PacketBody::ImageData(&[0xAA, 0xBB, 0xCC]));
        assert_eq!(datagram, encode_image_data(7, &[0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn test_foreign_marker_is_not_an_update_packet() {
        let mut datagram = encode_metadata(0, &metadata());
        datagram[3] = b'9';
        assert_eq!(parse(&datagram), Err(ParseError::NotAnUpdatePacket));
        assert_eq!(parse(b"UP"), Err(ParseError::NotAnUpdatePacket));
        assert_eq!(parse(b""), Err(ParseError::NotAnUpdatePacket));
    }

    #[test]
    fn test_short_header_is_truncated() {
        let datagram = encode_metadata(0, &metadata());
        assert_eq!(
            parse(&datagram[..10]),
            Err(ParseError::Truncated { expected: HEADER_LEN, actual: 10 })
        );
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut datagram = encode_image_data(1, &[1, 2, 3]);
        datagram[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(parse(&datagram), Err(ParseError::UnknownPacketType(9)));
    }

    #[test]
    fn test_payload_length_beyond_datagram_is_rejected() {
        let mut datagram = encode_image_data(1, &[1, 2, 3, 4]);
        datagram[12..16].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(
            parse(&datagram),
            Err(ParseError::LengthOverrun { declared: 1000, available: 8 })
        );
    }

    #[test]
    fn test_chunk_size_beyond_payload_is_rejected() {
        let mut datagram = encode_image_data(1, &[1, 2, 3, 4]);
        datagram[16..20].copy_from_slice(&64u32.to_le_bytes());
        assert_eq!(
            parse(&datagram),
            Err(ParseError::LengthOverrun { declared: 64, available: 4 })
        );
    }

    #[test]
    fn test_short_metadata_payload() {
        let mut datagram = encode_metadata(0, &metadata());
        datagram.truncate(HEADER_LEN + 8);
        datagram[12..16].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(parse(&datagram), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn test_trailing_bytes_after_payload_are_ignored() {
        let mut datagram = encode_image_data(2, &[5, 6]);
        datagram.extend_from_slice(&[0xFF; 8]);
        let packet = parse(&datagram).unwrap();
        assert_eq!(packet.body, PacketBody::ImageData(&[5, 6]));
    }

    #[test]
    fn test_reply_bytes() {
        let ack = build_ack(5);
        assert_eq!(&ack[..2], b"OK");
        assert_eq!(&ack[2..], &5u32.to_ne_bytes());
        assert_eq!(build_error(), *b"ERROR");

        assert_eq!(Reply::Ack(5).encode().as_slice(), &ack);
        assert_eq!(Reply::Error.encode().as_slice(), b"ERROR");
        assert_eq!(Reply::decode(&ack), Some(Reply::Ack(5)));
        assert_eq!(Reply::decode(b"ERROR"), Some(Reply::Error));
        assert_eq!(Reply::decode(b"OK"), None);
    }
}
