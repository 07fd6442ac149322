//! App-layer datagram header.
//!
//! Every App datagram starts with a fixed 6-byte header:
//!
//! ```text
//! ┌────────┬────────┬─────────────┬────────┬──────────────┬──────────┐
//! │ Handle │ Type   │ Transaction │ Error  │ Command      │ Payload  │
//! │ (1B)   │ (1B)   │ (1B)        │ (1B)   │ (2B LE)      │ ...      │
//! └────────┴────────┴─────────────┴────────┴──────────────┴──────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::endpoint::EndpointKind;
use crate::error::{AppError, Result};
use crate::tracker::TransactionId;

/// Registry key of an endpoint.
pub type Handle = u8;

/// Reserved: no endpoint.
pub const HANDLE_NONE: Handle = 0x00;

/// Predefined loopback endpoint.
pub const HANDLE_LOOPBACK: Handle = 0x01;

/// First handle assigned by [`crate::EndpointRegistry::register`].
pub const HANDLE_NEGOTIATED_RANGE_START: Handle = 0x10;

/// Size of the App header in bytes.
pub const APP_HEADER_LEN: usize = 6;

/// Direction and role of an App datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ClientRequest = 0,
    ServiceResponse = 1,
    ClientNotification = 2,
    ServiceNotification = 3,
    ServiceRequest = 4,
    ClientResponse = 5,
}

impl MessageType {
    /// The request type an endpoint of `kind` sends.
    pub fn request_from(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Client => MessageType::ClientRequest,
            EndpointKind::Service => MessageType::ServiceRequest,
        }
    }

    /// The notification type an endpoint of `kind` sends.
    pub fn notification_from(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Client => MessageType::ClientNotification,
            EndpointKind::Service => MessageType::ServiceNotification,
        }
    }

    /// The response type an endpoint of `kind` receives for its own requests.
    pub fn response_to(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Client => MessageType::ServiceResponse,
            EndpointKind::Service => MessageType::ClientResponse,
        }
    }

    /// The kind of local endpoint that handles an inbound message of this type.
    pub fn receiver_kind(self) -> EndpointKind {
        match self {
            MessageType::ClientRequest
            | MessageType::ClientNotification
            | MessageType::ClientResponse => EndpointKind::Service,
            MessageType::ServiceRequest
            | MessageType::ServiceNotification
            | MessageType::ServiceResponse => EndpointKind::Client,
        }
    }

    /// The matching response type, for request types.
    pub fn response_type(self) -> Option<Self> {
        match self {
            MessageType::ClientRequest => Some(MessageType::ServiceResponse),
            MessageType::ServiceRequest => Some(MessageType::ClientResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::ClientRequest | MessageType::ServiceRequest
        )
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::ServiceResponse | MessageType::ClientResponse
        )
    }

    pub fn is_notification(self) -> bool {
        matches!(
            self,
            MessageType::ClientNotification | MessageType::ServiceNotification
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(MessageType::ClientRequest),
            1 => Ok(MessageType::ServiceResponse),
            2 => Ok(MessageType::ClientNotification),
            3 => Ok(MessageType::ServiceNotification),
            4 => Ok(MessageType::ServiceRequest),
            5 => Ok(MessageType::ClientResponse),
            other => Err(other),
        }
    }
}

/// Error code carried in the App header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    InvalidCommand = 1,
    InvalidArg = 2,
    Busy = 3,
    OutOfMemory = 4,
    Unsupported = 5,
    Timeout = 6,
    Disabled = 7,
    RateLimited = 8,
    Blocked = 9,
    InvalidLength = 10,
    NotReady = 11,
    BeyondHub = 12,
    Unspecified = 255,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::None
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ErrorCode::None,
            1 => ErrorCode::InvalidCommand,
            2 => ErrorCode::InvalidArg,
            3 => ErrorCode::Busy,
            4 => ErrorCode::OutOfMemory,
            5 => ErrorCode::Unsupported,
            6 => ErrorCode::Timeout,
            7 => ErrorCode::Disabled,
            8 => ErrorCode::RateLimited,
            9 => ErrorCode::Blocked,
            10 => ErrorCode::InvalidLength,
            11 => ErrorCode::NotReady,
            12 => ErrorCode::BeyondHub,
            _ => ErrorCode::Unspecified,
        }
    }
}

/// Decoded App header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppHeader {
    pub handle: Handle,
    pub message_type: MessageType,
    pub transaction: TransactionId,
    pub error: ErrorCode,
    pub command: u16,
}

impl AppHeader {
    /// Header of the response answering this request header.
    ///
    /// Returns `None` when `self` is not a request.
    pub fn response(&self, error: ErrorCode) -> Option<AppHeader> {
        let message_type = self.message_type.response_type()?;
        Some(AppHeader {
            handle: self.handle,
            message_type,
            transaction: self.transaction,
            error,
            command: self.command,
        })
    }
}

/// One App datagram: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub header: AppHeader,
    pub payload: Bytes,
}

impl AppMessage {
    pub fn new(header: AppHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encode into a datagram ready for the transport.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(APP_HEADER_LEN + self.payload.len());
        dst.put_u8(self.header.handle);
        dst.put_u8(self.header.message_type as u8);
        dst.put_u8(self.header.transaction);
        dst.put_u8(self.header.error as u8);
        dst.put_u16_le(self.header.command);
        dst.put_slice(&self.payload);
        dst.freeze()
    }

    /// Decode a datagram received from the transport.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < APP_HEADER_LEN {
            return Err(AppError::TruncatedHeader { len: frame.len() });
        }

        let handle = frame[0];
        let message_type =
            MessageType::try_from(frame[1]).map_err(|message_type| AppError::InvalidMessageType {
                handle,
                message_type,
            })?;

        Ok(Self {
            header: AppHeader {
                handle,
                message_type,
                transaction: frame[2],
                error: ErrorCode::from(frame[3]),
                command: u16::from_le_bytes([frame[4], frame[5]]),
            },
            payload: Bytes::copy_from_slice(&frame[APP_HEADER_LEN..]),
        })
    }
}
