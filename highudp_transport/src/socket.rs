// Non-blocking UDP socket helpers shared by every endpoint.
//
// - `bind_nonblocking` / `bind_reusable` create the sockets. The reusable
//   variant sets `SO_REUSEADDR` and `SO_REUSEPORT` before binding (through
//   `libc` on unix) so several broadcast listeners on one host can share a
//   port.
// - `incoming` drains a socket as an iterator of decoded packets. It ends at
//   the first would-block, skips datagrams that fail to decode, and steps
//   over transient OS receive errors (e.g. ICMP port-unreachable surfacing
//   as `ConnectionRefused`) instead of aborting the tick.
// - `DatagramSink` is the outbound seam: connections write through it, so
//   the same connection code drives a real socket or an in-memory capture
//   in tests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use highudp_protocol::packet::{Packet, decode};
use tracing::trace;

use crate::error::NetResult;

/// Consecutive failed receives after which a drain gives up for this tick.
/// A healthy socket reports would-block long before this.
const MAX_CONSECUTIVE_RECV_ERRORS: usize = 64;

/// Destination for outbound datagrams.
pub trait DatagramSink {
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.send_to(datagram, to).map(|_| ())
    }
}

/// In-memory capture of everything "sent", in order.
impl DatagramSink for Vec<(SocketAddr, Vec<u8>)> {
    fn send_datagram(&mut self, datagram: &[u8], to: SocketAddr) -> io::Result<()> {
        self.push((to, datagram.to_vec()));
        Ok(())
    }
}

/// Bind a UDP socket and switch it to non-blocking mode.
pub fn bind_nonblocking(addr: impl ToSocketAddrs) -> NetResult<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a non-blocking UDP socket that other processes (or other sockets in
/// this process) may bind to as well.
#[cfg(unix)]
pub fn bind_reusable(addr: SocketAddrV4) -> NetResult<UdpSocket> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: `fd` is a freshly created, owned descriptor. Wrapping it first
    // means every early return below closes it.
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };

    let enable: libc::c_int = 1;
    for option in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        // SAFETY: `enable` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &enable as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    // SAFETY: all-zero is a valid `sockaddr_in`; the fields that matter are
    // filled in below.
    let mut sockaddr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
    sockaddr.sin_port = addr.port().to_be();
    sockaddr.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    // SAFETY: `sockaddr` is a valid `sockaddr_in` and the length matches.
    let rc = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Without unix socket options, fall back to an exclusive bind.
#[cfg(not(unix))]
pub fn bind_reusable(addr: SocketAddrV4) -> NetResult<UdpSocket> {
    bind_nonblocking(addr)
}

/// The host's outward-facing IPv4 address, or loopback if there is no route.
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Drain `socket` as decoded packets until it would block.
pub fn incoming<'a>(socket: &'a UdpSocket, buf: &'a mut [u8], role: &'static str) -> Incoming<'a> {
    Incoming { socket, buf, role }
}

/// Iterator returned by `incoming`.
pub struct Incoming<'a> {
    socket: &'a UdpSocket,
    buf: &'a mut [u8],
    role: &'static str,
}

impl Iterator for Incoming<'_> {
    type Item = (SocketAddr, Packet);

    fn next(&mut self) -> Option<Self::Item> {
        let mut errors = 0;
        loop {
            match self.socket.recv_from(self.buf) {
                Ok((len, from)) => match decode(&self.buf[..len]) {
                    Some(packet) => return Some((from, packet)),
                    None => {
                        trace!(role = self.role, peer = %from, len, "dropped corrupt datagram");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    trace!(role = self.role, error = %e, "skipped failed receive");
                    errors += 1;
                    if errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                        return None;
                    }
                }
            }
        }
    }
}
