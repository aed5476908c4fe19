// Connectionless discovery: broadcast senders and listeners.
//
// Broadcast packets carry sequence ID 0 and are never acknowledged, resent
// or shaped; they are fire-and-forget announcements such as "a server is
// running at this address". A `BroadcastSender` (or a `Server`, through
// `Server::broadcast`) pushes them to `255.255.255.255:port`. A
// `BroadcastListener` binds that port with address reuse so several
// listeners on one host can share it, drains its socket on `fetch()`, and
// keeps only packets whose kind is Broadcast.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use highudp_protocol::packet::{
    PacketKind, RECV_BUFFER_SIZE, assert_payload_fits, broadcast_packet,
};
use tracing::trace;

use crate::error::NetResult;
use crate::socket::{bind_nonblocking, bind_reusable, incoming};

/// Encode and send one Broadcast packet from `socket` to `to`.
///
/// Panics if `payload` is larger than `MAX_PAYLOAD_SIZE`.
pub(crate) fn send_broadcast(
    socket: &UdpSocket,
    to: SocketAddr,
    payload: &[u8],
) -> NetResult<()> {
    assert_payload_fits(payload);
    socket.send_to(&broadcast_packet(payload), to)?;
    trace!(peer = %to, len = payload.len(), "broadcast sent");
    Ok(())
}

/// A standalone socket for sending Broadcast packets.
pub struct BroadcastSender {
    socket: UdpSocket,
}

impl BroadcastSender {
    pub fn bind(addr: impl ToSocketAddrs) -> NetResult<Self> {
        let socket = bind_nonblocking(addr)?;
        socket.set_broadcast(true)?;
        Ok(Self { socket })
    }

    /// Send to every host on the local network listening on `port`.
    pub fn broadcast(&self, port: u16, payload: &[u8]) -> NetResult<()> {
        send_broadcast(&self.socket, SocketAddr::from((Ipv4Addr::BROADCAST, port)), payload)
    }

    /// Send a Broadcast packet to one known address instead of the whole
    /// network segment.
    pub fn announce_to(&self, addr: SocketAddr, payload: &[u8]) -> NetResult<()> {
        send_broadcast(&self.socket, addr, payload)
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Receives Broadcast packets on a shared port.
pub struct BroadcastListener {
    socket: UdpSocket,
    recv_queue: VecDeque<(Vec<u8>, SocketAddr)>,
    recv_buf: Vec<u8>,
}

impl BroadcastListener {
    /// Listen on `port` on every interface.
    pub fn bind(port: u16) -> NetResult<Self> {
        Self::bind_addr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    pub fn bind_addr(addr: SocketAddrV4) -> NetResult<Self> {
        Ok(Self {
            socket: bind_reusable(addr)?,
            recv_queue: VecDeque::new(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Drain the socket, queueing Broadcast payloads. Returns how many were
    /// queued.
    pub fn fetch(&mut self) -> usize {
        let before = self.recv_queue.len();
        for (from, packet) in incoming(&self.socket, &mut self.recv_buf, "listener") {
            if packet.kind == PacketKind::Broadcast {
                self.recv_queue.push_back((packet.payload, from));
            } else {
                trace!(peer = %from, kind = ?packet.kind, "non-broadcast packet ignored");
            }
        }
        self.recv_queue.len() - before
    }

    pub fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        self.recv_queue.pop_front()
    }

    pub fn has_packets(&self) -> bool {
        !self.recv_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use highudp_protocol::packet::{MAX_PAYLOAD_SIZE, heartbeat_packet};

    use super::*;
    use crate::server::Server;

    fn loopback_listener() -> BroadcastListener {
        BroadcastListener::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    fn fetch_until(listener: &mut BroadcastListener, want: usize) {
        let mut total = 0;
        for _ in 0..200 {
            total += listener.fetch();
            if total >= want {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn directed_announcement_is_received() {
        let mut listener = loopback_listener();
        let sender = BroadcastSender::bind("127.0.0.1:0").unwrap();
        sender
            .announce_to(listener.local_addr().unwrap(), b"server here")
            .unwrap();

        fetch_until(&mut listener, 1);
        let (payload, from) = listener.recv().unwrap();
        assert_eq!(payload, b"server here");
        assert_eq!(from, sender.local_addr().unwrap());
        assert!(!listener.has_packets());
    }

    #[test]
    fn network_broadcast_reaches_listener() {
        let mut listener = BroadcastListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let sender = BroadcastSender::bind("0.0.0.0:0").unwrap();
        sender.broadcast(port, b"from sender").unwrap();
        let server = Server::bind("0.0.0.0:0", 1).unwrap();
        server.broadcast(port, b"from server").unwrap();

        fetch_until(&mut listener, 2);
        let mut payloads: Vec<Vec<u8>> =
            std::iter::from_fn(|| listener.recv()).map(|(p, _)| p).collect();
        payloads.sort();
        assert_eq!(payloads, vec![b"from sender".to_vec(), b"from server".to_vec()]);
    }

    #[test]
    fn other_kinds_are_filtered() {
        let mut listener = loopback_listener();
        let target = listener.local_addr().unwrap();
        let raw = bind_nonblocking("127.0.0.1:0").unwrap();
        raw.send_to(&heartbeat_packet(), target).unwrap();
        raw.send_to(b"not even a packet", target).unwrap();
        raw.send_to(&broadcast_packet(b"real"), target).unwrap();

        fetch_until(&mut listener, 1);
        assert_eq!(listener.recv().map(|(p, _)| p), Some(b"real".to_vec()));
        assert_eq!(listener.recv(), None);
    }

    #[test]
    fn listeners_share_a_port() {
        let first = loopback_listener();
        let port = first.local_addr().unwrap().port();
        let second = BroadcastListener::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        if cfg!(unix) {
            assert_eq!(second.unwrap().local_addr().unwrap().port(), port);
        }
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversized_broadcast_panics() {
        let sender = BroadcastSender::bind("127.0.0.1:0").unwrap();
        let _ = sender.announce_to("127.0.0.1:9".parse().unwrap(), &[0u8; MAX_PAYLOAD_SIZE + 1]);
    }
}
