// Integration smoke test for servers and clients on loopback.
//
// Binds a real server and real clients on 127.0.0.1 with OS-assigned ports
// and drives them through the full lifecycle: handshake, reliable exchange
// in both directions, admission control, and disconnect. Endpoints are
// ticked in lockstep (client, then server) the way a game loop would.

use std::net::SocketAddr;
use std::time::Duration;

use highudp_transport::{Client, ClientEvent, Server, ServerEvent};

const DT: f64 = 1.0 / 60.0;

/// One client tick followed by one server tick. Loopback delivery is
/// effectively immediate, but a short sleep keeps the test honest on a
/// loaded machine.
fn step(client: &mut Client, server: &mut Server) -> (Vec<ClientEvent>, Vec<ServerEvent>) {
    let client_events = client.tick(DT);
    std::thread::sleep(Duration::from_millis(1));
    let server_events = server.tick(DT);
    std::thread::sleep(Duration::from_millis(1));
    (client_events, server_events)
}

fn loopback_server(max_connections: usize) -> (Server, SocketAddr) {
    let server = Server::bind("127.0.0.1:0", max_connections).unwrap();
    let addr = server.local_addr();
    (server, addr)
}

#[test]
fn handshake_and_exchange() {
    // 1. Server with room for four, client with two quick attempts.
    let (mut server, server_addr) = loopback_server(4);
    let mut client = Client::bind("127.0.0.1:0").unwrap();
    let client_addr = client.local_addr();
    client.connect(server_addr, 2, DT);

    // 2. Request goes out, server admits the client.
    let (client_events, server_events) = step(&mut client, &mut server);
    assert!(client_events.is_empty());
    assert_eq!(server_events, vec![ServerEvent::Connected(client_addr)]);
    assert!(server.has_connection(client_addr));

    // 3. Client picks up the response.
    let (client_events, _) = step(&mut client, &mut server);
    assert_eq!(client_events, vec![ClientEvent::Connected(server_addr)]);
    assert!(client.is_connected());
    assert!(!client.is_trying_to_connect());

    // 4. Reliable message client -> server.
    client.send(b"hello", true);
    step(&mut client, &mut server);
    assert_eq!(server.recv(), Some((b"hello".to_vec(), client_addr)));
    assert!(!server.has_packets());

    // 5. Reliable message server -> client.
    server.send_to(client_addr, b"welcome", true);
    server.tick(DT);
    std::thread::sleep(Duration::from_millis(1));
    client.tick(DT);
    assert_eq!(client.recv(), Some(b"welcome".to_vec()));
    assert_eq!(client.recv(), None);

    // 6. Client hangs up; both sides report it.
    client.disconnect();
    let (client_events, server_events) = step(&mut client, &mut server);
    assert_eq!(client_events, vec![ClientEvent::Disconnected(server_addr)]);
    assert_eq!(server_events, vec![ServerEvent::Disconnected(client_addr)]);
    assert!(server.connection_addresses().is_empty());
}

#[test]
fn admission_control_with_one_slot() {
    let (mut server, server_addr) = loopback_server(1);
    let mut first = Client::bind("127.0.0.1:0").unwrap();
    let mut second = Client::bind("127.0.0.1:0").unwrap();

    first.connect(server_addr, 5, DT);
    step(&mut first, &mut server);
    step(&mut first, &mut server);
    assert!(first.is_connected());

    // Full: the second client is refused outright.
    second.connect(server_addr, 5, DT);
    let mut refused = Vec::new();
    for _ in 0..3 {
        refused.extend(step(&mut second, &mut server).0);
    }
    assert_eq!(refused, vec![ClientEvent::ConnectionFailed(server_addr)]);
    assert_eq!(server.connection_count(), 1);

    // Free the slot and try again.
    first.disconnect();
    step(&mut first, &mut server);
    assert_eq!(server.connection_count(), 0);

    second.connect(server_addr, 5, DT);
    step(&mut second, &mut server);
    step(&mut second, &mut server);
    assert!(second.is_connected());
    assert_eq!(server.connection_addresses(), vec![second.local_addr()]);
}

#[test]
fn closed_admission_refuses_until_reopened() {
    let (mut server, server_addr) = loopback_server(4);
    server.accept_incoming_connections(false);
    let mut client = Client::bind("127.0.0.1:0").unwrap();

    client.connect(server_addr, 5, DT);
    let mut events = Vec::new();
    for _ in 0..3 {
        events.extend(step(&mut client, &mut server).0);
    }
    assert_eq!(events, vec![ClientEvent::ConnectionFailed(server_addr)]);

    server.accept_incoming_connections(true);
    client.connect(server_addr, 5, DT);
    step(&mut client, &mut server);
    step(&mut client, &mut server);
    assert!(client.is_connected());
}

#[test]
fn unanswered_client_gives_up() {
    // Bind and immediately drop a server so nothing answers on that port.
    let (server, server_addr) = loopback_server(1);
    drop(server);

    let mut client = Client::bind("127.0.0.1:0").unwrap();
    client.connect(server_addr, 3, DT);
    let mut events = Vec::new();
    for _ in 0..10 {
        events.extend(client.tick(DT));
    }
    assert_eq!(events, vec![ClientEvent::ConnectionFailed(server_addr)]);
}
