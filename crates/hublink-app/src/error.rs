use std::time::Duration;

use uuid::Uuid;

use crate::header::{ErrorCode, Handle};
use crate::tracker::TransactionId;

/// Errors surfaced synchronously by the App layer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The datagram is shorter than the App header.
    #[error("datagram too short for app header ({len} bytes)")]
    TruncatedHeader { len: usize },

    /// The header names a message type this layer does not know.
    #[error("unknown message type {message_type:#04x} on handle {handle:#04x}")]
    InvalidMessageType { handle: Handle, message_type: u8 },

    /// No endpoint is registered under the handle.
    #[error("no endpoint registered at handle {0:#04x}")]
    UnknownHandle(Handle),

    /// The handle is outside the range this registry manages.
    #[error("handle {0:#04x} is not assignable")]
    InvalidHandle(Handle),

    /// The handle already belongs to another endpoint.
    #[error("handle {0:#04x} is already registered")]
    HandleInUse(Handle),

    /// The capability UUID already has a live handle.
    #[error("capability {0} is already registered")]
    DuplicateUuid(Uuid),

    /// Every negotiable handle is in use.
    #[error("endpoint registry full (capacity {capacity})")]
    RegistryFull { capacity: usize },

    /// The command index has no request slot on this endpoint.
    #[error("command {command} out of range for handle {handle:#04x} ({command_count} slots)")]
    InvalidCommand {
        handle: Handle,
        command: u16,
        command_count: u16,
    },

    /// A request is already outstanding on this (endpoint, command) slot.
    #[error("request slot busy (handle {handle:#04x}, command {command}, transaction {transaction})")]
    Busy {
        handle: Handle,
        command: u16,
        transaction: TransactionId,
    },

    /// The transport refused the datagram.
    #[error("transport rejected datagram for handle {handle:#04x} command {command}")]
    TransportRejected { handle: Handle, command: u16 },

    /// The link reset while the caller was waiting for a response.
    #[error("link reset while waiting for response")]
    Reset,

    /// No response (real or synthesized) arrived while waiting.
    #[error("no response after {0:?}")]
    WaitTimedOut(Duration),

    /// The peer answered with an error code.
    #[error("peer responded with error {0:?}")]
    Remote(ErrorCode),

    /// The loopback echo differs from what was sent.
    #[error("loopback payload mismatch ({sent} bytes sent, {received} bytes echoed)")]
    LoopbackMismatch { sent: usize, received: usize },

    /// The worker thread could not be started.
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
