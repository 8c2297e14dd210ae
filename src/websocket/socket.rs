use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Socket addresses of the transport beneath a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketInfo {
    /// Local socket address
    pub local: Option<SocketAddr>,
    /// Remote socket address
    pub remote: Option<SocketAddr>,
}

impl SocketInfo {
    /// Create a new SocketInfo with both local and remote addresses
    pub fn new(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        Self { local, remote }
    }

    /// Read both addresses from a connected TCP stream
    pub fn from_tcp(stream: &TcpStream) -> Self {
        Self {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
        }
    }
}
