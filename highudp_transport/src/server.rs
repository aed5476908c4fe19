// Multi-peer endpoint: one socket, many connections.
//
// `Server` owns a single non-blocking UDP socket and a map of live
// `Connection`s keyed by peer address. The caller drives it with `tick(dt)`
// from a fixed-timestep loop; nothing runs in the background.
//
// A tick has two phases:
//
// 1. **Receive.** Drain the socket until it would block. A datagram from a
//    known peer goes to that peer's connection; a delivered Message payload
//    is queued for `recv()`. From an unknown peer only a ConnectionRequest
//    matters: it is admitted if the server is accepting and below
//    `max_connections`, and answered with ConnectionResponse(true/false).
//    A known peer that asks again gets another positive response, so a
//    client whose first response was lost can still finish its handshake.
// 2. **Send.** Tick every connection (heartbeats, resends, shaping), then
//    sweep dead ones out of the map.
//
// Lifecycle changes are returned from `tick` as `ServerEvent`s rather than
// delivered through callbacks, so the caller handles them with full access
// to its own state.
//
// Connections live in a `BTreeMap` so iteration order (and therefore the
// order of sends and events) is deterministic for a given set of peers.

use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use highudp_protocol::packet::{
    Packet, PacketKind, RECV_BUFFER_SIZE, assert_payload_fits, connection_response_packet,
};
use tracing::{debug, trace};

use crate::broadcast::send_broadcast;
use crate::config::{FaultInjectionConfig, TransportConfig};
use crate::connection::Connection;
use crate::error::NetResult;
use crate::fault::{TransmitPolicy, UnstablePolicy};
use crate::socket::{bind_nonblocking, incoming};

const ROLE: &str = "server";

/// Lifecycle change reported by `Server::tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// A peer's connection request was accepted.
    Connected(SocketAddr),
    /// A peer timed out, sent a Disconnection, or was disconnected locally.
    Disconnected(SocketAddr),
}

/// A reliable-UDP server multiplexing many peers over one socket.
pub struct Server {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: TransportConfig,
    max_connections: usize,
    accepting: bool,
    connections: BTreeMap<SocketAddr, Connection>,
    recv_queue: VecDeque<(Vec<u8>, SocketAddr)>,
    recv_buf: Vec<u8>,
    fault: Option<FaultInjectionConfig>,
    fault_streams: u64,
}

impl Server {
    /// Bind with the default `TransportConfig`.
    pub fn bind(addr: impl ToSocketAddrs, max_connections: usize) -> NetResult<Self> {
        Self::with_config(addr, max_connections, TransportConfig::default())
    }

    pub fn with_config(
        addr: impl ToSocketAddrs,
        max_connections: usize,
        config: TransportConfig,
    ) -> NetResult<Self> {
        config.validate()?;
        let socket = bind_nonblocking(addr)?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        debug!(role = ROLE, addr = %local_addr, max_connections, "server bound");
        Ok(Self {
            socket,
            local_addr,
            config,
            max_connections,
            accepting: true,
            connections: BTreeMap::new(),
            recv_queue: VecDeque::new(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
            fault: None,
            fault_streams: 0,
        })
    }

    /// The address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive everything pending, then advance and flush every connection.
    pub fn tick(&mut self, dt: f64) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        let packets: Vec<(SocketAddr, Packet)> =
            incoming(&self.socket, &mut self.recv_buf, ROLE).collect();
        for (from, packet) in packets {
            self.process_packet(from, packet, &mut events);
        }

        for connection in self.connections.values_mut() {
            connection.tick(dt, &mut self.socket);
        }
        self.connections.retain(|addr, connection| {
            if connection.is_connected() {
                return true;
            }
            debug!(role = ROLE, peer = %addr, "connection removed");
            events.push(ServerEvent::Disconnected(*addr));
            false
        });

        events
    }

    fn process_packet(
        &mut self,
        from: SocketAddr,
        packet: Packet,
        events: &mut Vec<ServerEvent>,
    ) {
        // A dead entry is gone as far as the peer is concerned, even before
        // the end-of-tick sweep.
        if self.connections.get(&from).is_some_and(|c| !c.is_connected()) {
            self.connections.remove(&from);
            debug!(role = ROLE, peer = %from, "connection removed");
            events.push(ServerEvent::Disconnected(from));
        }

        if let Some(connection) = self.connections.get_mut(&from) {
            if packet.kind == PacketKind::ConnectionRequest {
                trace!(role = ROLE, peer = %from, "repeated connection request");
                respond(&self.socket, from, true);
            }
            if let Some(payload) = connection.process_packet(packet) {
                self.recv_queue.push_back((payload, from));
            }
            return;
        }

        if packet.kind != PacketKind::ConnectionRequest {
            trace!(
                role = ROLE,
                peer = %from,
                kind = ?packet.kind,
                "packet from unknown peer ignored"
            );
            return;
        }

        let accept = self.accepting && self.connections.len() < self.max_connections;
        if accept {
            debug!(role = ROLE, peer = %from, "connection accepted");
            let mut connection = Connection::new(from, &self.config, ROLE);
            connection.set_transmit_policy(fault_policy(
                self.fault.as_ref(),
                &mut self.fault_streams,
            ));
            self.connections.insert(from, connection);
            events.push(ServerEvent::Connected(from));
        } else {
            debug!(role = ROLE, peer = %from, "connection refused");
        }
        respond(&self.socket, from, accept);
    }

    /// Queue a message for `addr`. Does nothing if `addr` is not connected.
    ///
    /// Panics if `payload` is larger than `MAX_PAYLOAD_SIZE`.
    pub fn send_to(&mut self, addr: SocketAddr, payload: &[u8], reliable: bool) {
        assert_payload_fits(payload);
        match self.connections.get_mut(&addr) {
            Some(connection) => {
                connection.queue_message(payload, reliable);
            }
            None => trace!(role = ROLE, peer = %addr, "send to unconnected peer ignored"),
        }
    }

    /// Next delivered payload and its sender, oldest first.
    pub fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.recv_queue.pop_front()
    }

    pub fn has_packets(&self) -> bool {
        !self.recv_queue.is_empty()
    }

    /// Send an unconnected Broadcast packet to `255.255.255.255:port`.
    pub fn broadcast(&self, port: u16, payload: &[u8]) -> NetResult<()> {
        send_broadcast(&self.socket, SocketAddr::from((Ipv4Addr::BROADCAST, port)), payload)
    }

    /// Cap on live connections. Lowering it never drops existing peers; it
    /// only refuses new ones until enough have left.
    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = max_connections;
    }

    /// Open or close admission. Existing connections are unaffected.
    pub fn accept_incoming_connections(&mut self, accept: bool) {
        self.accepting = accept;
    }

    /// Send a Disconnection to `addr` and mark its connection dead. It is
    /// removed, with a `Disconnected` event, on the next tick.
    pub fn disconnect(&mut self, addr: SocketAddr) {
        if let Some(connection) = self.connections.get_mut(&addr) {
            connection.disconnect(&mut self.socket);
        }
    }

    /// Addresses with a connection entry, in address order.
    pub fn connection_addresses(&self) -> Vec<SocketAddr> {
        self.connections.keys().copied().collect()
    }

    pub fn has_connection(&self, addr: SocketAddr) -> bool {
        self.connections.contains_key(&addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Route every current and future connection's sends through an
    /// `UnstablePolicy`, or back to the plain socket with `None`.
    pub fn set_fault_injection(&mut self, fault: Option<FaultInjectionConfig>) -> NetResult<()> {
        if let Some(config) = &fault {
            config.validate()?;
        }
        for connection in self.connections.values_mut() {
            connection.set_transmit_policy(fault_policy(fault.as_ref(), &mut self.fault_streams));
        }
        self.fault = fault;
        Ok(())
    }

    /// Tell every live peer goodbye, then release the socket.
    pub fn close(mut self) {
        debug!(
            role = ROLE,
            addr = %self.local_addr,
            peers = self.connections.len(),
            "server closing"
        );
        for connection in self.connections.values_mut() {
            connection.disconnect(&mut self.socket);
        }
    }
}

/// A fresh unstable policy on the next RNG stream.
fn fault_policy(
    fault: Option<&FaultInjectionConfig>,
    streams: &mut u64,
) -> Option<Box<dyn TransmitPolicy>> {
    let config = fault?;
    *streams += 1;
    Some(Box::new(UnstablePolicy::with_stream(config.clone(), *streams)))
}

/// Answer a connection request. Best-effort like every control packet.
fn respond(socket: &UdpSocket, to: SocketAddr, accepted: bool) {
    if let Err(e) = socket.send_to(&connection_response_packet(accepted), to) {
        trace!(role = ROLE, peer = %to, error = %e, "connection response not sent");
    }
}
