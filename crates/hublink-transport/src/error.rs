/// Errors that can occur while moving datagrams across a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The datagram header contains an invalid magic number.
    #[error("invalid datagram magic (expected 0x484c \"HL\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred on the underlying stream.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete datagram was received.
    #[error("connection closed (incomplete datagram)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
