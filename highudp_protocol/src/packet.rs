// Datagram framing and integrity checking.
//
// Every HighUDP datagram has the same layout, all integers little-endian:
//
//   [hash: u32][sequence: u16][kind: u8][payload ...]
//
// `hash` covers everything after it (sequence, kind and payload) and is a
// 32-bit truncation of FNV-1 started from the 64-bit offset basis. It catches
// corruption, not tampering: there is no key and no secrecy.
//
// `decode` is the only place that validates a frame. Anything shorter than
// the header, carrying an unknown kind byte, or failing the hash comes back
// as `None` and is dropped by the caller without further inspection.
//
// Control packets (acknowledgments, heartbeats, handshake, disconnection)
// are built by the small helpers at the bottom of this file so that the
// transport never hand-assembles a payload.

use crate::types::SequenceId;

/// Bytes of framing in front of the payload: hash (4) + sequence (2) + kind (1).
pub const HEADER_SIZE: usize = 7;

/// Largest application payload a single packet may carry. There is no
/// fragmentation; larger messages are a caller bug.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Receive buffer size: a full packet plus slack, so oversized garbage is
/// truncated and then rejected by the hash rather than split.
pub const RECV_BUFFER_SIZE: usize = MAX_PAYLOAD_SIZE + 64;

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Packet type tag. The discriminants are the wire values and must match
/// across peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Unconnected announcement (see the transport's broadcast module).
    Broadcast = 1,
    /// Payload is the 2-byte sequence ID being acknowledged.
    Acknowledgment = 2,
    /// Application data.
    Message = 3,
    /// Empty keep-alive.
    Heartbeat = 4,
    /// Client asks a server for a connection. Empty payload.
    ConnectionRequest = 5,
    /// Server's answer. Payload is one byte: 1 accepted, 0 refused.
    ConnectionResponse = 6,
    /// Peer is closing the connection. Empty payload.
    Disconnection = 7,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PacketKind::Broadcast),
            2 => Some(PacketKind::Acknowledgment),
            3 => Some(PacketKind::Message),
            4 => Some(PacketKind::Heartbeat),
            5 => Some(PacketKind::ConnectionRequest),
            6 => Some(PacketKind::ConnectionResponse),
            7 => Some(PacketKind::Disconnection),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded, integrity-checked packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub sequence: SequenceId,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

/// 32-bit truncated FNV-1: multiply, then xor the byte, keeping the low 32
/// bits after every step.
pub fn fnv1_hash32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash = (hash.wrapping_mul(FNV_PRIME) ^ u64::from(byte)) & 0xFFFF_FFFF;
    }
    hash as u32
}

/// Frame a packet: `[hash][sequence][kind][payload]`.
pub fn encode(sequence: SequenceId, kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(&sequence.to_le_bytes());
    frame.push(kind.as_byte());
    frame.extend_from_slice(payload);

    let hash = fnv1_hash32(&frame[4..]);
    frame[..4].copy_from_slice(&hash.to_le_bytes());
    frame
}

/// Validate and unpack a frame. Returns `None` for short frames, unknown
/// kind bytes and hash mismatches.
pub fn decode(bytes: &[u8]) -> Option<Packet> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let kind = PacketKind::from_byte(bytes[6])?;

    let stored = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if stored != fnv1_hash32(&bytes[4..]) {
        return None;
    }

    Some(Packet {
        sequence: SequenceId::from_le_bytes([bytes[4], bytes[5]]),
        kind,
        payload: bytes[HEADER_SIZE..].to_vec(),
    })
}

/// Panic unless `payload` fits in one packet.
pub fn assert_payload_fits(payload: &[u8]) {
    assert!(
        payload.len() <= MAX_PAYLOAD_SIZE,
        "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte message limit",
        payload.len()
    );
}

// ---------------------------------------------------------------------------
// Control packets
// ---------------------------------------------------------------------------

pub fn acknowledgment_packet(acked: SequenceId) -> Vec<u8> {
    encode(
        SequenceId::UNRELIABLE,
        PacketKind::Acknowledgment,
        &acked.to_le_bytes(),
    )
}

pub fn heartbeat_packet() -> Vec<u8> {
    encode(SequenceId::UNRELIABLE, PacketKind::Heartbeat, &[])
}

pub fn connection_request_packet() -> Vec<u8> {
    encode(SequenceId::UNRELIABLE, PacketKind::ConnectionRequest, &[])
}

pub fn connection_response_packet(accepted: bool) -> Vec<u8> {
    encode(
        SequenceId::UNRELIABLE,
        PacketKind::ConnectionResponse,
        &[u8::from(accepted)],
    )
}

pub fn disconnection_packet() -> Vec<u8> {
    encode(SequenceId::UNRELIABLE, PacketKind::Disconnection, &[])
}

pub fn broadcast_packet(payload: &[u8]) -> Vec<u8> {
    encode(SequenceId::UNRELIABLE, PacketKind::Broadcast, payload)
}

/// The acknowledged ID, if the payload is exactly two bytes.
pub fn parse_acknowledgment(payload: &[u8]) -> Option<SequenceId> {
    let bytes: [u8; 2] = payload.try_into().ok()?;
    Some(SequenceId::from_le_bytes(bytes))
}

/// The accept flag of a connection response. Empty payloads are malformed.
pub fn parse_connection_response(payload: &[u8]) -> Option<bool> {
    payload.first().map(|&flag| flag != 0)
}
