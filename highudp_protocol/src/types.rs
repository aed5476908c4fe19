// Sequence ID types for the HighUDP wire protocol.
//
// Every packet on the wire carries a 16-bit sequence ID. Zero is reserved
// for the unreliable channel (fire-and-forget, never acknowledged); reliable
// packets draw their IDs from a per-connection `SequenceCounter` that counts
// `1, 2, ..., 65535` and then wraps back to 1, so a reliable packet can never
// be mistaken for an unreliable one.
//
// IDs are only unique within the live window of the receiver's rotating sets
// (see `rotating_set.rs`); after a wrap an old ID may legitimately reappear.

use serde::{Deserialize, Serialize};

/// Per-connection packet sequence ID. `SequenceId(0)` marks an unreliable
/// packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(pub u16);

impl SequenceId {
    /// The reserved ID carried by every unreliable packet.
    pub const UNRELIABLE: SequenceId = SequenceId(0);

    /// True for IDs allocated by a `SequenceCounter`.
    pub fn is_reliable(self) -> bool {
        self.0 != 0
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        SequenceId(u16::from_le_bytes(bytes))
    }
}

/// Allocator for reliable sequence IDs. Yields `1..=65535` and wraps back to
/// 1; never yields the reserved zero.
#[derive(Clone, Debug)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next reliable ID.
    pub fn next_id(&mut self) -> SequenceId {
        let id = SequenceId(self.next);
        self.next = self.next.checked_add(1).unwrap_or(1);
        id
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
