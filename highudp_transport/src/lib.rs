// highudp_transport — reliable-UDP endpoints over non-blocking sockets.
//
// Builds servers, clients and broadcast discovery on top of the frame
// defined in `highudp_protocol`. Everything is single-threaded and
// tick-driven: the caller owns a fixed-timestep loop and calls `tick(dt)` on
// each endpoint; a tick drains the socket, then sends whatever the shaping
// budget allows. No background threads, no wall-clock reads.
//
// Module overview:
// - `config.rs`:     `TransportConfig`, `ConnectOptions`, `FaultInjectionConfig`
//                    (serde, JSON loading, validation).
// - `error.rs`:      `NetError` / `NetResult` for setup-time failures.
// - `timer.rs`:      Countdown timer advanced by tick deltas.
// - `socket.rs`:     Socket binding (including port-sharing via libc), the
//                    `incoming` drain iterator, and the `DatagramSink` seam.
// - `fault.rs`:      `TransmitPolicy` and the lossy `UnstablePolicy`.
// - `connection.rs`: Per-peer reliability, deduplication, shaping, liveness.
// - `server.rs`:     Many peers on one socket with admission control.
// - `client.rs`:     One server connection with a retrying handshake.
// - `broadcast.rs`:  Connectionless Broadcast senders and listeners.
//
// Design decisions:
// - **Events, not callbacks.** `Server::tick` and `Client::tick` return the
//   lifecycle changes they observed. The caller matches on them with full
//   mutable access to its own state.
// - **Network trouble is not an error.** Corrupt datagrams, transient
//   receive failures and lost packets are logged at trace level and
//   absorbed. Only binding, configuration and explicit broadcast sends
//   return `NetError`.
// - **Misuse panics.** An oversized payload or `connect()` on a connected
//   client is a caller bug and fails immediately.
//
// The `highudp` binary (`main.rs`) wraps these endpoints in a small
// diagnostic CLI.

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod server;
pub mod socket;
pub mod timer;

pub use broadcast::{BroadcastListener, BroadcastSender};
pub use client::{Client, ClientEvent};
pub use config::{ConnectOptions, FaultInjectionConfig, TransportConfig};
pub use connection::Connection;
pub use error::{NetError, NetResult};
pub use fault::{TransmitPolicy, UnstablePolicy};
pub use server::{Server, ServerEvent};
pub use socket::local_ip;
