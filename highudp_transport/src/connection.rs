// Per-peer reliability, shaping and liveness state.
//
// A `Connection` is owned by a `Server` (one per admitted peer) or a `Client`
// (at most one). It never touches a socket directly: the owner drains the
// socket, hands each decoded packet to `process_packet`, and calls `tick`
// with the socket as the outbound `DatagramSink`.
//
// Reliability: reliable messages get a sequence ID from a wrapping counter
// (1..=65535, never 0) and stay in the outbound queue, resent once per tick,
// until the peer acknowledges them. The receiver acknowledges a reliable
// message the first time it sees it and drops later copies silently.
// Acknowledgments themselves are unreliable; a lost ack just means one more
// resend. Delivery is at-least-once on the wire and exactly-once to the
// caller, but not ordered: a resent packet goes to the back of the queue.
//
// Shaping: each tick may send at most `bytes_per_second * dt` bytes and
// `packets_per_second * dt` packets (both clamped at dt = 1). The first
// packet of a tick is always sent so a large message cannot stall the queue.
//
// Liveness: any inbound packet resets the liveness timer; an idle connection
// queues a heartbeat every `heartbeat_interval` so the peer's timer is
// refreshed. When the timer runs out, or a Disconnection arrives, the
// connection is dead for good and the owner removes it.

use std::collections::VecDeque;
use std::net::SocketAddr;

use highudp_protocol::packet::{
    Packet, PacketKind, acknowledgment_packet, assert_payload_fits, disconnection_packet, encode,
    heartbeat_packet, parse_acknowledgment,
};
use highudp_protocol::rotating_set::RotatingIdSet;
use highudp_protocol::types::{SequenceCounter, SequenceId};
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::fault::TransmitPolicy;
use crate::socket::DatagramSink;
use crate::timer::Timer;

/// An encoded datagram waiting in the outbound queue.
struct Outbound {
    sequence: SequenceId,
    datagram: Vec<u8>,
}

/// Reliable-UDP state for one remote peer.
pub struct Connection {
    peer: SocketAddr,
    role: &'static str,
    config: TransportConfig,
    sequence: SequenceCounter,
    received: RotatingIdSet<SequenceId>,
    acknowledged: RotatingIdSet<SequenceId>,
    outbound: VecDeque<Outbound>,
    liveness: Timer,
    heartbeat: Timer,
    policy: Option<Box<dyn TransmitPolicy>>,
}

impl Connection {
    /// A fresh, live connection to `peer`. `role` labels log output
    /// (`"server"` or `"client"`).
    pub fn new(peer: SocketAddr, config: &TransportConfig, role: &'static str) -> Self {
        Self {
            peer,
            role,
            config: config.clone(),
            sequence: SequenceCounter::new(),
            received: RotatingIdSet::new(config.received_set_capacity),
            acknowledged: RotatingIdSet::new(config.acknowledged_set_capacity),
            outbound: VecDeque::new(),
            liveness: Timer::new(config.liveness_timeout),
            heartbeat: Timer::new(config.heartbeat_interval),
            policy: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// True until the liveness timer runs out or the connection is closed.
    pub fn is_connected(&self) -> bool {
        !self.liveness.is_finished()
    }

    /// Route every future send through `policy`; `None` writes directly.
    pub fn set_transmit_policy(&mut self, policy: Option<Box<dyn TransmitPolicy>>) {
        self.policy = policy;
    }

    /// Datagrams waiting to be sent, including unacknowledged reliable ones.
    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    /// Queue application data. Reliable messages get a fresh sequence ID and
    /// are resent every tick until acknowledged; unreliable ones go out once
    /// with ID 0. Returns the ID used.
    ///
    /// Panics if `payload` is larger than `MAX_PAYLOAD_SIZE`.
    pub fn queue_message(&mut self, payload: &[u8], reliable: bool) -> SequenceId {
        assert_payload_fits(payload);
        let sequence = if reliable {
            self.sequence.next_id()
        } else {
            SequenceId::UNRELIABLE
        };
        let datagram = encode(sequence, PacketKind::Message, payload);
        self.enqueue(sequence, datagram);
        sequence
    }

    /// Advance timers by `dt` seconds and flush the outbound queue within
    /// this tick's budget. The tick on which liveness runs out still flushes;
    /// every later tick is a no-op.
    pub fn tick(&mut self, dt: f64, sink: &mut dyn DatagramSink) {
        if !self.is_connected() {
            return;
        }
        self.liveness.tick(dt);
        if !self.is_connected() {
            debug!(role = self.role, peer = %self.peer, "connection timed out");
        }

        self.heartbeat.tick(dt);
        if self.heartbeat.is_finished() {
            self.enqueue(SequenceId::UNRELIABLE, heartbeat_packet());
            self.heartbeat.reset();
        }

        self.flush(dt, sink);
    }

    /// Handle one inbound packet from this peer. Returns the payload of a
    /// newly delivered Message; duplicates and control packets return `None`.
    pub fn process_packet(&mut self, packet: Packet) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }
        self.liveness.reset();

        match packet.kind {
            PacketKind::Acknowledgment => {
                if let Some(acked) = parse_acknowledgment(&packet.payload) {
                    self.acknowledged.add(acked);
                }
                None
            }
            PacketKind::Message => {
                let sequence = packet.sequence;
                if sequence.is_reliable() {
                    if self.received.contains(&sequence) {
                        trace!(
                            role = self.role,
                            peer = %self.peer,
                            id = sequence.0,
                            "duplicate message absorbed"
                        );
                        return None;
                    }
                    self.received.add(sequence);
                    self.enqueue(SequenceId::UNRELIABLE, acknowledgment_packet(sequence));
                }
                Some(packet.payload)
            }
            PacketKind::Disconnection => {
                debug!(role = self.role, peer = %self.peer, "peer disconnected");
                self.liveness.expire();
                None
            }
            PacketKind::Heartbeat
            | PacketKind::ConnectionRequest
            | PacketKind::ConnectionResponse
            | PacketKind::Broadcast => None,
        }
    }

    /// Close the connection: one best-effort Disconnection to the peer, then
    /// dead immediately. No-op if already dead.
    pub fn disconnect(&mut self, sink: &mut dyn DatagramSink) {
        if !self.is_connected() {
            return;
        }
        debug!(role = self.role, peer = %self.peer, "disconnecting");
        self.transmit(sink, &disconnection_packet());
        self.liveness.expire();
    }

    fn enqueue(&mut self, sequence: SequenceId, datagram: Vec<u8>) {
        self.outbound.push_back(Outbound { sequence, datagram });
    }

    /// Send from the front of the queue until a budget runs out. Reliable
    /// packets are recycled to the back until acknowledged; acknowledged
    /// ones are dropped without sending.
    fn flush(&mut self, dt: f64, sink: &mut dyn DatagramSink) {
        let (mut bytes_left, mut packets_left) = self.config.send_budget(dt);
        let overhead = u64::from(self.config.packet_overhead);

        let mut pending = std::mem::take(&mut self.outbound);
        let mut first = true;
        while let Some(entry) = pending.pop_front() {
            if entry.sequence.is_reliable() && self.acknowledged.contains(&entry.sequence) {
                continue;
            }

            let len = entry.datagram.len() as u64;
            if !first && (packets_left == 0 || len > bytes_left) {
                pending.push_front(entry);
                break;
            }
            first = false;
            bytes_left = bytes_left.saturating_sub(overhead + len);
            packets_left = packets_left.saturating_sub(1);

            self.transmit(sink, &entry.datagram);
            if entry.sequence.is_reliable() {
                self.outbound.push_back(entry);
            }
        }

        // Withheld packets keep their place ahead of the recycled ones.
        pending.append(&mut self.outbound);
        self.outbound = pending;
    }

    fn transmit(&mut self, sink: &mut dyn DatagramSink, datagram: &[u8]) {
        let result = match self.policy.as_mut() {
            Some(policy) => policy.transmit(sink, datagram, self.peer),
            None => sink.send_datagram(datagram, self.peer),
        };
        if let Err(e) = result {
            trace!(role = self.role, peer = %self.peer, error = %e, "best-effort send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use highudp_protocol::packet::{MAX_PAYLOAD_SIZE, decode};

    use super::*;
    use crate::config::FaultInjectionConfig;
    use crate::fault::UnstablePolicy;

    type Wire = Vec<(SocketAddr, Vec<u8>)>;

    const DT: f64 = 1.0 / 60.0;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair() -> (Connection, Connection) {
        let config = TransportConfig::default();
        (
            Connection::new(addr(2), &config, "client"),
            Connection::new(addr(1), &config, "server"),
        )
    }

    /// Decode everything on `wire` into `to`, returning delivered payloads.
    fn deliver(wire: &mut Wire, to: &mut Connection) -> Vec<Vec<u8>> {
        wire.drain(..)
            .filter_map(|(_, datagram)| decode(&datagram))
            .filter_map(|packet| to.process_packet(packet))
            .collect()
    }

    fn kinds(wire: &Wire) -> Vec<PacketKind> {
        wire.iter()
            .map(|(_, d)| decode(d).unwrap().kind)
            .collect()
    }

    #[test]
    fn reliable_ids_count_up_and_wrap() {
        let (mut conn, _) = pair();
        for expected in 1..=u16::MAX {
            assert_eq!(conn.queue_message(b"", true), SequenceId(expected));
        }
        assert_eq!(conn.queue_message(b"", true), SequenceId(1));
    }

    #[test]
    fn unreliable_messages_use_zero() {
        let (mut conn, _) = pair();
        assert_eq!(conn.queue_message(b"x", false), SequenceId::UNRELIABLE);
        assert_eq!(conn.queue_message(b"y", true), SequenceId(1));
        assert_eq!(conn.queue_message(b"z", false), SequenceId::UNRELIABLE);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversized_message_panics() {
        let (mut conn, _) = pair();
        conn.queue_message(&[0u8; MAX_PAYLOAD_SIZE + 1], true);
    }

    #[test]
    fn duplicate_message_delivered_once_and_acked_once() {
        let (mut sender, mut receiver) = pair();
        sender.queue_message(b"hello", true);
        let mut wire = Wire::new();
        sender.tick(DT, &mut wire);
        let datagram = wire[0].1.clone();

        let first = receiver.process_packet(decode(&datagram).unwrap());
        let second = receiver.process_packet(decode(&datagram).unwrap());
        assert_eq!(first, Some(b"hello".to_vec()));
        assert_eq!(second, None);

        let mut acks = Wire::new();
        receiver.tick(DT, &mut acks);
        assert_eq!(kinds(&acks), vec![PacketKind::Acknowledgment]);
    }

    #[test]
    fn unreliable_duplicates_are_not_filtered() {
        let (mut sender, mut receiver) = pair();
        sender.queue_message(b"pos", false);
        let mut wire = Wire::new();
        sender.tick(DT, &mut wire);
        let datagram = wire[0].1.clone();

        assert!(receiver.process_packet(decode(&datagram).unwrap()).is_some());
        assert!(receiver.process_packet(decode(&datagram).unwrap()).is_some());
        // No acknowledgments for the unreliable channel.
        assert_eq!(receiver.queued_len(), 0);
    }

    #[test]
    fn reliable_resent_until_acknowledged() {
        let (mut sender, mut receiver) = pair();
        sender.queue_message(b"important", true);

        let mut wire = Wire::new();
        sender.tick(DT, &mut wire);
        sender.tick(DT, &mut wire);
        assert_eq!(wire.len(), 2, "resent while unacknowledged");
        assert_eq!(sender.queued_len(), 1);

        assert_eq!(deliver(&mut wire, &mut receiver), vec![b"important".to_vec()]);
        receiver.tick(DT, &mut wire);
        deliver(&mut wire, &mut sender);

        sender.tick(DT, &mut wire);
        assert!(wire.is_empty(), "acknowledged packet must not be resent");
        assert_eq!(sender.queued_len(), 0);
    }

    #[test]
    fn unreliable_sent_once() {
        let (mut sender, _) = pair();
        sender.queue_message(b"fire and forget", false);
        let mut wire = Wire::new();
        sender.tick(DT, &mut wire);
        sender.tick(DT, &mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(sender.queued_len(), 0);
    }

    #[test]
    fn every_reliable_message_delivered_exactly_once() {
        let (mut a, mut b) = pair();
        let sent: Vec<Vec<u8>> = (0u16..50).map(|i| i.to_be_bytes().to_vec()).collect();
        for payload in &sent {
            a.queue_message(payload, true);
        }

        let mut a_to_b = Wire::new();
        let mut b_to_a = Wire::new();
        let mut delivered = Vec::new();
        for _ in 0..200 {
            a.tick(DT, &mut a_to_b);
            delivered.extend(deliver(&mut a_to_b, &mut b));
            b.tick(DT, &mut b_to_a);
            deliver(&mut b_to_a, &mut a);
        }

        delivered.sort();
        assert_eq!(delivered, sent);
        assert_eq!(a.queued_len(), 0);
    }

    #[test]
    fn packet_budget_limits_each_tick() {
        let (mut conn, _) = pair();
        for i in 0u8..10 {
            conn.queue_message(&[i], false);
        }
        let mut wire = Wire::new();
        conn.tick(DT, &mut wire);
        // 200 pkt/s at 60 Hz is 3 packets per tick.
        assert_eq!(wire.len(), 3);
        assert_eq!(conn.queued_len(), 7);

        // Withheld packets go out next, in their original order.
        wire.clear();
        conn.tick(DT, &mut wire);
        let payloads: Vec<u8> = wire
            .iter()
            .map(|(_, d)| decode(d).unwrap().payload[0])
            .collect();
        assert_eq!(payloads, vec![3, 4, 5]);
    }

    #[test]
    fn three_full_messages_fit_one_tick() {
        let (mut conn, _) = pair();
        let long = b"long".repeat(256);
        for _ in 0..3 {
            conn.queue_message(&long, false);
        }
        let mut wire = Wire::new();
        conn.tick(DT, &mut wire);
        assert_eq!(wire.len(), 3);
    }

    #[test]
    fn first_packet_always_sent() {
        let (mut conn, _) = pair();
        conn.queue_message(&[7u8; MAX_PAYLOAD_SIZE], false);
        conn.queue_message(&[8u8; MAX_PAYLOAD_SIZE], false);
        let mut wire = Wire::new();
        // 1 ms: 250 bytes and zero packets of budget.
        conn.tick(0.001, &mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(conn.queued_len(), 1);
    }

    #[test]
    fn byte_budget_withholds_second_large_packet() {
        let config = TransportConfig {
            bytes_per_second: 60_000,
            ..TransportConfig::default()
        };
        let mut conn = Connection::new(addr(9), &config, "client");
        conn.queue_message(&[1u8; MAX_PAYLOAD_SIZE], false);
        conn.queue_message(&[2u8; MAX_PAYLOAD_SIZE], false);
        let mut wire = Wire::new();
        // 1000 bytes of budget: the first 1031-byte packet exhausts it.
        conn.tick(DT, &mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(conn.queued_len(), 1);
    }

    #[test]
    fn liveness_expires_after_timeout() {
        let (mut conn, _) = pair();
        let mut wire = Wire::new();
        for _ in 0..19 {
            conn.tick(0.5, &mut wire);
        }
        assert!(conn.is_connected(), "9.5 s of silence is still alive");
        conn.tick(0.5, &mut wire);
        assert!(!conn.is_connected(), "10 s of silence is dead");
    }

    #[test]
    fn expiring_tick_still_flushes() {
        let (mut conn, _) = pair();
        let mut wire = Wire::new();
        conn.tick(9.5, &mut wire);
        wire.clear();

        conn.queue_message(b"last words", true);
        conn.tick(0.5, &mut wire);
        assert!(!conn.is_connected());
        assert_eq!(kinds(&wire), vec![PacketKind::Message]);

        wire.clear();
        conn.tick(DT, &mut wire);
        assert!(wire.is_empty());
    }

    #[test]
    fn any_packet_refreshes_liveness() {
        let (mut conn, _) = pair();
        let mut wire = Wire::new();
        conn.tick(9.0, &mut wire);
        conn.process_packet(decode(&heartbeat_packet()).unwrap());
        conn.tick(9.0, &mut wire);
        assert!(conn.is_connected());
    }

    #[test]
    fn idle_connection_sends_heartbeat() {
        let (mut conn, _) = pair();
        let mut wire = Wire::new();
        conn.tick(3.0, &mut wire);
        assert!(wire.is_empty());
        conn.tick(0.5, &mut wire);
        assert_eq!(kinds(&wire), vec![PacketKind::Heartbeat]);
    }

    #[test]
    fn heartbeats_keep_a_pair_alive() {
        let (mut a, mut b) = pair();
        let mut wire = Wire::new();
        for _ in 0..5 {
            a.tick(5.0, &mut wire);
            deliver(&mut wire, &mut b);
            b.tick(5.0, &mut wire);
            deliver(&mut wire, &mut a);
        }
        assert!(a.is_connected());
        assert!(b.is_connected());
    }

    #[test]
    fn disconnection_packet_kills_immediately() {
        let (mut a, mut b) = pair();
        let mut wire = Wire::new();
        a.disconnect(&mut wire);
        assert!(!a.is_connected());
        assert_eq!(kinds(&wire), vec![PacketKind::Disconnection]);

        deliver(&mut wire, &mut b);
        assert!(!b.is_connected());
    }

    #[test]
    fn dead_connection_stays_dead() {
        let (mut a, _) = pair();
        let mut wire = Wire::new();
        a.disconnect(&mut wire);
        wire.clear();

        a.process_packet(decode(&heartbeat_packet()).unwrap());
        assert!(!a.is_connected());

        a.queue_message(b"late", true);
        a.tick(DT, &mut wire);
        assert!(wire.is_empty());

        // A second disconnect sends nothing.
        a.disconnect(&mut wire);
        assert!(wire.is_empty());
    }

    #[test]
    fn control_kinds_are_ignored() {
        let (mut conn, _) = pair();
        for packet in [
            highudp_protocol::packet::connection_request_packet(),
            highudp_protocol::packet::connection_response_packet(true),
            highudp_protocol::packet::broadcast_packet(b"hi"),
            heartbeat_packet(),
        ] {
            assert_eq!(conn.process_packet(decode(&packet).unwrap()), None);
        }
        assert!(conn.is_connected());
        assert_eq!(conn.queued_len(), 0);
    }

    #[test]
    fn transmit_policy_sees_every_send() {
        let (mut conn, _) = pair();
        conn.set_transmit_policy(Some(Box::new(UnstablePolicy::new(FaultInjectionConfig {
            loss_rate: 1.0,
            ..FaultInjectionConfig::default()
        }))));
        conn.queue_message(b"lost", false);
        let mut wire = Wire::new();
        conn.tick(DT, &mut wire);
        assert!(wire.is_empty());
        assert_eq!(conn.queued_len(), 0);
    }

    #[test]
    fn reliable_delivery_survives_heavy_corruption() {
        let (mut a, mut b) = pair();
        let corrupt = FaultInjectionConfig {
            corruption_rate: 0.75,
            seed: 5,
            ..FaultInjectionConfig::default()
        };
        a.set_transmit_policy(Some(Box::new(UnstablePolicy::with_stream(corrupt.clone(), 1))));
        b.set_transmit_policy(Some(Box::new(UnstablePolicy::with_stream(corrupt, 2))));

        a.queue_message(b"hello", true);
        let mut wire = Wire::new();
        let mut delivered = Vec::new();
        for _ in 0..64 {
            a.tick(DT, &mut wire);
            delivered.extend(deliver(&mut wire, &mut b));
            b.tick(DT, &mut wire);
            deliver(&mut wire, &mut a);
        }
        assert_eq!(delivered, vec![b"hello".to_vec()]);
    }
}
