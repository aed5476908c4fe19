// highudp_protocol — wire protocol for the HighUDP reliable-datagram transport.
//
// This crate defines the datagram frame, its integrity hash, the sequence ID
// types, and the rotating ID set used for duplicate and acknowledgment
// bookkeeping. It is shared by every endpoint in `highudp_transport`
// (servers, clients, broadcast senders and listeners) and has no socket code
// of its own.
//
// Module overview:
// - `types.rs`:        `SequenceId` and the wrapping `SequenceCounter`.
// - `packet.rs`:       `PacketKind`, `Packet`, `encode`/`decode`, the FNV-1
//                      integrity hash, and control-packet helpers.
// - `rotating_set.rs`: `RotatingIdSet`, a bounded FIFO-evicting set.
//
// Design decisions:
// - **Fixed binary header.** Seven bytes, little-endian, no varints. Every
//   packet kind shares the same frame so a single decode path validates all
//   input.
// - **Payloads as opaque bytes.** The transport never inspects application
//   payloads; the layer above owns their format.
// - **Integrity only.** The hash detects corruption in transit. It is not a
//   MAC and offers no protection against a deliberate forger.

pub mod packet;
pub mod rotating_set;
pub mod types;

pub use packet::{
    HEADER_SIZE, MAX_PAYLOAD_SIZE, Packet, PacketKind, RECV_BUFFER_SIZE, decode, encode,
    fnv1_hash32,
};
pub use rotating_set::RotatingIdSet;
pub use types::{SequenceCounter, SequenceId};
