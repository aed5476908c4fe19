// Outbound transmit policies, including the lossy wire used in tests.
//
// A connection hands every datagram it wants to send to its
// `TransmitPolicy`, if it has one; without a policy it writes straight to the
// socket. `UnstablePolicy` sits in that slot to simulate a bad network: it
// can drop a datagram, send it twice, or reverse its bytes (which the
// receiver's integrity check then rejects). Each decision is an independent
// draw from a seeded `FaultRng`, so a failing lossy run can be replayed by
// reusing its seed.
//
// Fault rates are plain data in `FaultInjectionConfig` (see `config.rs`) and
// belong to one policy instance. There is no process-wide switch.

use std::io;
use std::net::SocketAddr;

use tracing::trace;

use crate::config::FaultInjectionConfig;
use crate::socket::DatagramSink;

/// Decides how one outbound datagram reaches the wire.
pub trait TransmitPolicy: Send {
    fn transmit(
        &mut self,
        sink: &mut dyn DatagramSink,
        datagram: &[u8],
        to: SocketAddr,
    ) -> io::Result<()>;
}

/// SplitMix64 generator. Small, seedable, and good enough for coin flips;
/// not for anything security-related.
#[derive(Clone, Debug)]
pub struct FaultRng {
    state: u64,
}

impl FaultRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)` from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// True with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

/// Drops, duplicates and corrupts datagrams at configured rates.
#[derive(Clone, Debug)]
pub struct UnstablePolicy {
    config: FaultInjectionConfig,
    rng: FaultRng,
}

impl UnstablePolicy {
    pub fn new(config: FaultInjectionConfig) -> Self {
        let rng = FaultRng::new(config.seed);
        Self { config, rng }
    }

    /// Like `new`, but mixes `stream` into the seed so several connections
    /// sharing one config do not draw identical fault sequences.
    pub fn with_stream(config: FaultInjectionConfig, stream: u64) -> Self {
        let rng = FaultRng::new(config.seed ^ stream.wrapping_mul(0xa076_1d64_78bd_642f));
        Self { config, rng }
    }
}

impl TransmitPolicy for UnstablePolicy {
    fn transmit(
        &mut self,
        sink: &mut dyn DatagramSink,
        datagram: &[u8],
        to: SocketAddr,
    ) -> io::Result<()> {
        let copies = if self.rng.chance(self.config.duplicate_rate) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            let corrupt = self.rng.chance(self.config.corruption_rate);
            if self.rng.chance(self.config.loss_rate) {
                trace!(peer = %to, len = datagram.len(), "fault injection: dropped datagram");
                continue;
            }
            if corrupt {
                trace!(peer = %to, len = datagram.len(), "fault injection: reversed datagram");
                let reversed: Vec<u8> = datagram.iter().rev().copied().collect();
                sink.send_datagram(&reversed, to)?;
            } else {
                sink.send_datagram(datagram, to)?;
            }
        }
        Ok(())
    }
}
