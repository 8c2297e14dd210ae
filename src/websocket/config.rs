//! Session configuration.

/// Which end of the connection a session represents.
///
/// Clients mask every outgoing frame and expect unmasked frames from the
/// server; servers do the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The end that initiated the handshake.
    Client,
    /// The end that accepted the handshake.
    Server,
}

/// Tunables for a [`WebSocket`](super::WebSocket) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bytes reserved for each read from the transport.
    pub read_buffer_size: usize,
    /// Largest payload sent in a single frame. Longer messages are split
    /// into continuation frames.
    pub max_frame_size: usize,
    /// Largest inbound message accepted, or `None` for no limit.
    pub max_message_size: Option<usize>,
}

impl Config {
    /// Default transport read size (8KB)
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
    /// Default outbound frame size (64KB)
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;
    /// Default inbound message limit (64MB)
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
            max_frame_size: Self::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: Some(Self::DEFAULT_MAX_MESSAGE_SIZE),
        }
    }

    /// Set the transport read size. Zero is raised to one byte.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the outbound frame size. Zero is raised to one byte.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(1);
        self
    }

    /// Set the inbound message limit.
    pub fn with_max_message_size(mut self, limit: Option<usize>) -> Self {
        self.max_message_size = limit;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
