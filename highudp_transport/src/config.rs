// Tunable transport parameters.
//
// Every timing and budget constant the transport uses lives here instead of
// being hard-coded in the connection logic. `TransportConfig` is shared by
// all connections of one endpoint; `ConnectOptions` holds the client's
// handshake retry policy; `FaultInjectionConfig` describes the lossy wire
// used in tests (see `fault.rs`).
//
// All three derive serde and use `#[serde(default)]`, so a JSON document only
// has to name the fields it wants to change:
//
//   { "liveness_timeout": 5.0, "packets_per_second": 60 }
//
// Loading always validates; a config that parses but makes no sense (zero
// budgets, a heartbeat slower than the liveness timeout) is rejected with
// `NetError::InvalidConfig` rather than producing a connection that can
// never stay alive.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

/// Per-connection reliability, liveness and shaping parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Seconds of silence from the peer before a connection is declared dead.
    pub liveness_timeout: f64,
    /// Seconds between self-sent heartbeats. Must be shorter than
    /// `liveness_timeout` or an idle connection times out.
    pub heartbeat_interval: f64,
    /// Static byte budget per second of elapsed tick time.
    pub bytes_per_second: u32,
    /// Static packet budget per second of elapsed tick time.
    pub packets_per_second: u32,
    /// Bytes charged against the byte budget per datagram on top of its own
    /// length, approximating IP/UDP headers.
    pub packet_overhead: u32,
    /// Window size of the "already delivered" duplicate filter.
    pub received_set_capacity: usize,
    /// Window size of the "peer acknowledged" resend filter.
    pub acknowledged_set_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: 10.0,
            heartbeat_interval: 3.3,
            bytes_per_second: 250_000,
            packets_per_second: 200,
            packet_overhead: 32,
            received_set_capacity: 1000,
            acknowledged_set_capacity: 1000,
        }
    }
}

impl TransportConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json(json: &str) -> NetResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> NetResult<()> {
        if !(self.liveness_timeout.is_finite() && self.liveness_timeout > 0.0) {
            return invalid("liveness_timeout must be a positive number of seconds");
        }
        if !(self.heartbeat_interval.is_finite() && self.heartbeat_interval > 0.0) {
            return invalid("heartbeat_interval must be a positive number of seconds");
        }
        if self.heartbeat_interval >= self.liveness_timeout {
            return invalid("heartbeat_interval must be shorter than liveness_timeout");
        }
        if self.bytes_per_second == 0 || self.packets_per_second == 0 {
            return invalid("send budgets must be non-zero");
        }
        if self.received_set_capacity == 0 || self.acknowledged_set_capacity == 0 {
            return invalid("rotating set capacities must be non-zero");
        }
        Ok(())
    }

    /// Byte and packet allowance for a tick of `dt` seconds. Both scale with
    /// `dt` and clamp to the per-second figure once `dt >= 1`.
    pub fn send_budget(&self, dt: f64) -> (u64, u32) {
        let dt = dt.clamp(0.0, 1.0);
        let bytes = (f64::from(self.bytes_per_second) * dt).floor() as u64;
        let packets = (f64::from(self.packets_per_second) * dt).floor() as u32;
        (bytes, packets)
    }
}

// ---------------------------------------------------------------------------
// Client handshake
// ---------------------------------------------------------------------------

/// How persistently a client retries its connection request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Connection requests sent before giving up.
    pub attempts: u32,
    /// Seconds between requests.
    pub retry_delay: f64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            retry_delay: 0.5,
        }
    }
}

impl ConnectOptions {
    pub fn validate(&self) -> NetResult<()> {
        if self.attempts == 0 {
            return invalid("attempts must be at least 1");
        }
        if !(self.retry_delay.is_finite() && self.retry_delay >= 0.0) {
            return invalid("retry_delay must be a non-negative number of seconds");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Probabilities applied independently to every outgoing datagram by the
/// unstable transmit policy. All rates are in `[0, 1]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    /// Chance a datagram is silently dropped.
    pub loss_rate: f64,
    /// Chance a datagram is sent twice.
    pub duplicate_rate: f64,
    /// Chance a datagram has its bytes reversed before sending.
    pub corruption_rate: f64,
    /// Seed for the fault RNG, so a lossy run can be replayed exactly.
    pub seed: u64,
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> NetResult<()> {
        for (name, rate) in [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("corruption_rate", self.corruption_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(NetError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> NetResult<()> {
    Err(NetError::InvalidConfig(reason.into()))
}
