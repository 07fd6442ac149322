use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::Result;
use crate::header::{AppMessage, ErrorCode, Handle};
use crate::tracker::TransactionId;

/// Which side of a capability an endpoint implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Client,
    Service,
}

/// Semantic version of an endpoint's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Static description of one Client or Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub kind: EndpointKind,
    /// Capability UUID; unique among live registrations.
    pub uuid: Uuid,
    pub version: Version,
    /// Human-readable name. Services only.
    pub name: Option<String>,
    /// Shortest payload (after the App header) accepted by this endpoint.
    pub min_payload_len: usize,
    /// Number of command slots; commands are `0..command_count`.
    pub command_count: u16,
    /// Overrides the context's default request timeout when set.
    pub request_timeout: Option<Duration>,
}

impl EndpointDescriptor {
    /// Describe a client.
    pub fn client(uuid: Uuid, version: Version, command_count: u16) -> Self {
        Self {
            kind: EndpointKind::Client,
            uuid,
            version,
            name: None,
            min_payload_len: 0,
            command_count,
            request_timeout: None,
        }
    }

    /// Describe a service.
    pub fn service(uuid: Uuid, name: &str, version: Version, command_count: u16) -> Self {
        Self {
            kind: EndpointKind::Service,
            uuid,
            version,
            name: Some(name.to_string()),
            min_payload_len: 0,
            command_count,
            request_timeout: None,
        }
    }

    pub fn with_min_payload_len(mut self, min_payload_len: usize) -> Self {
        self.min_payload_len = min_payload_len;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Dispatch capabilities of a registered endpoint.
///
/// Every method has a default so an endpoint only implements the traffic it
/// expects; the defaults answer [`ErrorCode::Unsupported`].
///
/// Handlers run on the App worker thread and must not block on the link.
pub trait Endpoint: Send + Sync {
    /// Handle a request addressed to this endpoint.
    ///
    /// Answer with [`EndpointContext::send_response`], now or later. If the
    /// returned code is an error and no response was sent yet, the
    /// dispatcher answers with that code.
    fn dispatch_request(&self, ctx: &EndpointContext<'_>, request: &AppMessage) -> ErrorCode {
        let _ = (ctx, request);
        ErrorCode::Unsupported
    }

    /// Handle a response to one of this endpoint's requests.
    ///
    /// Responses arrive already correlated. A synthesized response with
    /// [`ErrorCode::Timeout`] is delivered here when the peer never answered.
    fn dispatch_response(&self, ctx: &EndpointContext<'_>, response: &AppMessage) -> ErrorCode {
        let _ = (ctx, response);
        ErrorCode::Unsupported
    }

    /// Handle a notification addressed to this endpoint.
    fn dispatch_notification(
        &self,
        ctx: &EndpointContext<'_>,
        notification: &AppMessage,
    ) -> ErrorCode {
        let _ = (ctx, notification);
        ErrorCode::Unsupported
    }

    /// The link reset; discard open state and pending work.
    fn notify_reset(&self) {}

    /// The link is (again) able to carry traffic.
    fn notify_link_established(&self) {}
}

/// What a handler can do while it is being dispatched.
pub struct EndpointContext<'a> {
    app: &'a AppContext,
    handle: Handle,
}

impl<'a> EndpointContext<'a> {
    pub(crate) fn new(app: &'a AppContext, handle: Handle) -> Self {
        Self { app, handle }
    }

    /// Handle of the endpoint being dispatched.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The owning context. Clone it to answer after the handler returns.
    pub fn app(&self) -> &AppContext {
        self.app
    }

    /// Answer `request` and close its incoming transaction.
    pub fn send_response(
        &self,
        request: &AppMessage,
        error: ErrorCode,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.app.send_response(&request.header, error, payload)
    }

    /// Send a request from this endpoint.
    pub fn send_request(&self, command: u16, payload: impl Into<Bytes>) -> Result<TransactionId> {
        self.app.send_request(self.handle, command, payload)
    }

    /// Send a notification from this endpoint.
    pub fn send_notification(&self, command: u16, payload: impl Into<Bytes>) -> Result<()> {
        self.app.send_notification(self.handle, command, payload)
    }
}
