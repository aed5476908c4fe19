// Single-peer endpoint with a retrying handshake.
//
// A `Client` is in one of three states:
//
// - **Idle**: neither connecting nor connected.
// - **Connecting**: a `Connector` is pending. Its retry timer starts elapsed,
//   so the first tick sends a ConnectionRequest straight away; each further
//   elapse sends another and uses up one attempt. ConnectionResponse(true)
//   from the target promotes it to a `Connection`; ConnectionResponse(false),
//   or a retry timer that elapses with no attempts left, gives up with
//   `ClientEvent::ConnectionFailed`.
// - **Connected**: ticking delegates to the `Connection`. When it dies (peer
//   silence, a Disconnection from the server, or a local `disconnect()`) it
//   is cleared on the next sweep and `ClientEvent::Disconnected` fires.
//
// Only datagrams from the connected server or the pending connect target are
// looked at; anything else arriving on the socket is dropped.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use highudp_protocol::packet::{
    Packet, PacketKind, RECV_BUFFER_SIZE, assert_payload_fits, connection_request_packet,
    parse_connection_response,
};
use tracing::{debug, trace};

use crate::config::{ConnectOptions, FaultInjectionConfig, TransportConfig};
use crate::connection::Connection;
use crate::error::NetResult;
use crate::fault::{TransmitPolicy, UnstablePolicy};
use crate::socket::{bind_nonblocking, incoming};
use crate::timer::Timer;

const ROLE: &str = "client";

/// Lifecycle change reported by `Client::tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    /// The server refused, or every attempt went unanswered.
    ConnectionFailed(SocketAddr),
}

/// A pending handshake.
struct Connector {
    target: SocketAddr,
    attempts_remaining: u32,
    retry: Timer,
}

/// A reliable-UDP client holding at most one server connection.
pub struct Client {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: TransportConfig,
    connection: Option<Connection>,
    connector: Option<Connector>,
    recv_queue: VecDeque<Vec<u8>>,
    recv_buf: Vec<u8>,
    fault: Option<FaultInjectionConfig>,
}

impl Client {
    /// Bind with the default `TransportConfig`. Use port 0 to let the OS
    /// choose.
    pub fn bind(addr: impl ToSocketAddrs) -> NetResult<Self> {
        Self::with_config(addr, TransportConfig::default())
    }

    pub fn with_config(addr: impl ToSocketAddrs, config: TransportConfig) -> NetResult<Self> {
        config.validate()?;
        let socket = bind_nonblocking(addr)?;
        let local_addr = socket.local_addr()?;
        debug!(role = ROLE, addr = %local_addr, "client bound");
        Ok(Self {
            socket,
            local_addr,
            config,
            connection: None,
            connector: None,
            recv_queue: VecDeque::new(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
            fault: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start connecting to `target`, sending up to `attempts` requests
    /// `retry_delay` seconds apart. A handshake already in progress is
    /// replaced.
    ///
    /// Panics if the client is already connected.
    pub fn connect(&mut self, target: SocketAddr, attempts: u32, retry_delay: f64) {
        assert!(
            !self.is_connected(),
            "connect() called while already connected to {:?}",
            self.server_addr()
        );
        debug!(role = ROLE, peer = %target, attempts, retry_delay, "connecting");
        self.connector = Some(Connector {
            target,
            attempts_remaining: attempts,
            retry: Timer::elapsed(retry_delay),
        });
    }

    pub fn connect_with(&mut self, target: SocketAddr, options: &ConnectOptions) {
        self.connect(target, options.attempts, options.retry_delay);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_connected)
    }

    pub fn is_trying_to_connect(&self) -> bool {
        self.connector.is_some()
    }

    /// The server this client is connected to, if any.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.connection
            .as_ref()
            .filter(|c| c.is_connected())
            .map(Connection::peer_addr)
    }

    /// Receive, advance the handshake or the connection, and report what
    /// changed.
    pub fn tick(&mut self, dt: f64) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        self.sweep(&mut events);

        let packets: Vec<(SocketAddr, Packet)> =
            incoming(&self.socket, &mut self.recv_buf, ROLE).collect();
        for (from, packet) in packets {
            self.process_packet(from, packet, &mut events);
        }

        if self.connector.is_some() {
            self.step_connector(dt, &mut events);
        } else if let Some(connection) = self.connection.as_mut() {
            connection.tick(dt, &mut self.socket);
        }

        self.sweep(&mut events);
        events
    }

    fn process_packet(&mut self, from: SocketAddr, packet: Packet, events: &mut Vec<ClientEvent>) {
        let from_target = self.connector.as_ref().is_some_and(|c| c.target == from);
        if from_target {
            if packet.kind == PacketKind::ConnectionResponse {
                let accepted = parse_connection_response(&packet.payload) == Some(true);
                self.finish_handshake(from, accepted, events);
            }
            return;
        }

        match self.connection.as_mut() {
            Some(connection) if connection.peer_addr() == from => {
                if let Some(payload) = connection.process_packet(packet) {
                    self.recv_queue.push_back(payload);
                }
            }
            _ => trace!(
                role = ROLE,
                peer = %from,
                kind = ?packet.kind,
                "packet from unexpected sender ignored"
            ),
        }
    }

    fn finish_handshake(
        &mut self,
        target: SocketAddr,
        accepted: bool,
        events: &mut Vec<ClientEvent>,
    ) {
        self.connector = None;
        if !accepted {
            debug!(role = ROLE, peer = %target, "connection refused");
            events.push(ClientEvent::ConnectionFailed(target));
            return;
        }

        debug!(role = ROLE, peer = %target, "connected");
        let mut connection = Connection::new(target, &self.config, ROLE);
        connection.set_transmit_policy(fault_policy(self.fault.as_ref()));
        self.connection = Some(connection);
        events.push(ClientEvent::Connected(target));
    }

    fn step_connector(&mut self, dt: f64, events: &mut Vec<ClientEvent>) {
        let Some(connector) = self.connector.as_mut() else {
            return;
        };
        connector.retry.tick(dt);
        if !connector.retry.is_finished() {
            return;
        }

        let target = connector.target;
        if connector.attempts_remaining == 0 {
            debug!(role = ROLE, peer = %target, "connection attempts exhausted");
            self.connector = None;
            events.push(ClientEvent::ConnectionFailed(target));
            return;
        }

        connector.attempts_remaining -= 1;
        connector.retry.reset();
        trace!(
            role = ROLE,
            peer = %target,
            remaining = connector.attempts_remaining,
            "connection request"
        );
        if let Err(e) = self.socket.send_to(&connection_request_packet(), target) {
            trace!(role = ROLE, peer = %target, error = %e, "connection request not sent");
        }
    }

    /// Drop a dead connection and report it.
    fn sweep(&mut self, events: &mut Vec<ClientEvent>) {
        if let Some(connection) = self.connection.take_if(|c| !c.is_connected()) {
            debug!(role = ROLE, peer = %connection.peer_addr(), "connection removed");
            events.push(ClientEvent::Disconnected(connection.peer_addr()));
        }
    }

    /// Queue a message for the server. Does nothing when not connected.
    ///
    /// Panics if `payload` is larger than `MAX_PAYLOAD_SIZE`.
    pub fn send(&mut self, payload: &[u8], reliable: bool) {
        assert_payload_fits(payload);
        match self.connection.as_mut() {
            Some(connection) if connection.is_connected() => {
                connection.queue_message(payload, reliable);
            }
            _ => trace!(role = ROLE, "send without a connection ignored"),
        }
    }

    /// Next delivered payload from the server, oldest first.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        self.recv_queue.pop_front()
    }

    pub fn has_packets(&self) -> bool {
        !self.recv_queue.is_empty()
    }

    /// Send a Disconnection to the server and drop any pending handshake.
    /// `Disconnected` is reported on the next tick.
    pub fn disconnect(&mut self) {
        self.connector = None;
        if let Some(connection) = self.connection.as_mut() {
            connection.disconnect(&mut self.socket);
        }
    }

    /// Route the connection's sends (current and future) through an
    /// `UnstablePolicy`, or back to the plain socket with `None`.
    pub fn set_fault_injection(&mut self, fault: Option<FaultInjectionConfig>) -> NetResult<()> {
        if let Some(config) = &fault {
            config.validate()?;
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.set_transmit_policy(fault_policy(fault.as_ref()));
        }
        self.fault = fault;
        Ok(())
    }

    /// Disconnect if connected, then release the socket.
    pub fn close(mut self) {
        debug!(role = ROLE, addr = %self.local_addr, "client closing");
        self.disconnect();
    }
}

fn fault_policy(fault: Option<&FaultInjectionConfig>) -> Option<Box<dyn TransmitPolicy>> {
    let config = fault?;
    Some(Box::new(UnstablePolicy::new(config.clone())))
}
