// Test-only harness for end-to-end HighUDP scenarios.
//
// Wraps real `Server`, `Client` and `BroadcastListener` endpoints bound to
// loopback and drives them through a shared fixed-timestep loop, recording
// every lifecycle event so tests can assert on the full history rather than
// on whichever tick happened to produce it.
//
// The only test-specific code here is the stepping and recording. Every
// packet goes through the same sockets and connection code a real program
// uses.
//
// See also: `tests/scenarios.rs` for the scenarios themselves.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use highudp_transport::{
    BroadcastListener, Client, ClientEvent, Server, ServerEvent, TransportConfig,
};

/// One frame at 60 Hz.
pub const DT: f64 = 1.0 / 60.0;

/// Pause between rounds so loopback datagrams land before the next receive.
const ROUND_PAUSE: Duration = Duration::from_millis(1);

/// Anything the harness can advance by one frame.
pub trait Actor {
    fn step(&mut self, dt: f64);
}

/// A loopback server that keeps every event it reports.
pub struct TestServer {
    pub server: Server,
    pub events: Vec<ServerEvent>,
}

impl TestServer {
    pub fn new(max_connections: usize) -> Self {
        Self::with_config(max_connections, TransportConfig::default())
    }

    pub fn with_config(max_connections: usize, config: TransportConfig) -> Self {
        Self {
            server: Server::with_config("127.0.0.1:0", max_connections, config)
                .expect("bind test server"),
            events: Vec::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Every payload delivered so far, in delivery order.
    pub fn drain(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::iter::from_fn(|| self.server.recv()).collect()
    }
}

impl Actor for TestServer {
    fn step(&mut self, dt: f64) {
        let events = self.server.tick(dt);
        self.events.extend(events);
    }
}

/// A loopback client that keeps every event it reports.
pub struct TestClient {
    pub client: Client,
    pub events: Vec<ClientEvent>,
}

impl TestClient {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            client: Client::with_config("127.0.0.1:0", config).expect("bind test client"),
            events: Vec::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.client.recv()).collect()
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor for TestClient {
    fn step(&mut self, dt: f64) {
        let events = self.client.tick(dt);
        self.events.extend(events);
    }
}

impl Actor for BroadcastListener {
    fn step(&mut self, _dt: f64) {
        self.fetch();
    }
}

/// Step every actor in order, `rounds` times, `dt` seconds per round.
pub fn tick_actors(actors: &mut [&mut dyn Actor], dt: f64, rounds: usize) {
    for _ in 0..rounds {
        for actor in actors.iter_mut() {
            actor.step(dt);
        }
        thread::sleep(ROUND_PAUSE);
    }
}

/// Connect `client` to `server` and run the handshake to completion.
/// Panics if it has not finished after a generous number of rounds.
pub fn establish(client: &mut TestClient, server: &mut TestServer) {
    client.client.connect(server.addr(), 10, 0.5);
    for _ in 0..100 {
        tick_actors(&mut [&mut *client as &mut dyn Actor, &mut *server], DT, 1);
        if client.client.is_connected() {
            return;
        }
    }
    panic!("handshake with {} did not complete", server.addr());
}
