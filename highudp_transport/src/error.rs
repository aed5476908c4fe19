// Caller-visible errors for the transport crate.
//
// Only setup and explicit sends can fail in a way the caller has to handle:
// binding or configuring a socket, loading a config file, or pushing a
// broadcast datagram out. Everything that happens on the wire after a
// connection exists (corrupt packets, transient receive errors, failed
// best-effort sends) is absorbed and logged, never returned.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse transport config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
}

pub type NetResult<T> = Result<T, NetError>;
