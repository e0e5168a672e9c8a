use std::net::SocketAddr;

use crate::conn::State;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("peer stopped acknowledging within the timeout")]
    PeerTimeout,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("operation is not valid in the {0:?} state")]
    InvalidState(State),

    #[error("host has been closed")]
    HostClosed,
}
