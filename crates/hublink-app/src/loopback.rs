//! Predefined echo endpoints at [`HANDLE_LOOPBACK`].
//!
//! One side runs [`LoopbackService`], the other registers a
//! [`LoopbackClient`]; the client's requests come back verbatim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::context::AppContext;
use crate::endpoint::{Endpoint, EndpointContext, EndpointDescriptor, Version};
use crate::error::{AppError, Result};
use crate::header::{AppMessage, ErrorCode, HANDLE_LOOPBACK};

/// Capability UUID of the loopback endpoints.
pub const LOOPBACK_UUID: Uuid = Uuid::from_u128(0x6c6f_6f70_6261_636b_0000_0000_0000_0001);

/// Command index of the echo request.
pub const LOOPBACK_ECHO: u16 = 0;

const LOOPBACK_VERSION: Version = Version::new(1, 0, 0);

/// Echoes every request payload back in its response.
pub struct LoopbackService;

impl LoopbackService {
    pub fn descriptor() -> EndpointDescriptor {
        EndpointDescriptor::service(LOOPBACK_UUID, "loopback", LOOPBACK_VERSION, 1)
    }
}

impl Endpoint for LoopbackService {
    fn dispatch_request(&self, ctx: &EndpointContext<'_>, request: &AppMessage) -> ErrorCode {
        match ctx.send_response(request, ErrorCode::None, request.payload.clone()) {
            Ok(()) => ErrorCode::None,
            Err(err) => {
                debug!(%err, "loopback echo not sent");
                ErrorCode::Unspecified
            }
        }
    }
}

struct LoopbackClientEndpoint;

impl Endpoint for LoopbackClientEndpoint {
    fn dispatch_response(&self, _ctx: &EndpointContext<'_>, _response: &AppMessage) -> ErrorCode {
        // Consumed by the blocked caller in `LoopbackClient::test`.
        ErrorCode::None
    }
}

/// Measures round trips against the peer's loopback service.
pub struct LoopbackClient {
    app: AppContext,
}

impl LoopbackClient {
    /// Register the client at [`HANDLE_LOOPBACK`].
    ///
    /// Fails with [`AppError::HandleInUse`] if this side already runs the
    /// loopback service.
    pub fn register(app: &AppContext) -> Result<Self> {
        app.register_endpoint_at(
            HANDLE_LOOPBACK,
            EndpointDescriptor::client(LOOPBACK_UUID, LOOPBACK_VERSION, 1),
            Arc::new(LoopbackClientEndpoint),
        )?;
        Ok(Self { app: app.clone() })
    }

    /// Send `payload` and wait for the echo. Returns the round-trip time.
    pub fn test(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Duration> {
        let payload = payload.into();
        let started = Instant::now();
        let response =
            self.app
                .send_request_and_wait(HANDLE_LOOPBACK, LOOPBACK_ECHO, payload.clone(), timeout)?;
        let elapsed = started.elapsed();

        if !response.header.error.is_ok() {
            return Err(AppError::Remote(response.header.error));
        }
        if response.payload != payload {
            return Err(AppError::LoopbackMismatch {
                sent: payload.len(),
                received: response.payload.len(),
            });
        }
        debug!(len = payload.len(), ?elapsed, "loopback round trip");
        Ok(elapsed)
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        self.app.unregister_endpoint(HANDLE_LOOPBACK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::header::{AppHeader, MessageType};
    use crate::test_support::CapturingTransport;

    #[test]
    fn service_echoes_payload() {
        let transport = Arc::new(CapturingTransport::default());
        let config = AppConfig {
            enable_loopback: true,
            ..AppConfig::default()
        };
        let app = AppContext::new(config, transport.clone()).unwrap();

        let request = AppMessage::new(
            AppHeader {
                handle: HANDLE_LOOPBACK,
                message_type: MessageType::ClientRequest,
                transaction: 3,
                error: ErrorCode::None,
                command: LOOPBACK_ECHO,
            },
            Bytes::from_static(b"ping"),
        );
        app.dispatch_frame(&request.encode());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.message_type, MessageType::ServiceResponse);
        assert_eq!(sent[0].header.transaction, 3);
        assert_eq!(sent[0].payload.as_ref(), b"ping");
    }

    #[test]
    fn client_cannot_share_a_side_with_the_service() {
        let config = AppConfig {
            enable_loopback: true,
            ..AppConfig::default()
        };
        let app = AppContext::new(config, Arc::new(CapturingTransport::default())).unwrap();
        assert!(matches!(
            LoopbackClient::register(&app),
            Err(AppError::HandleInUse(HANDLE_LOOPBACK))
        ));
    }

    #[test]
    fn unanswered_echo_reports_timeout() {
        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let client = LoopbackClient::register(&app).unwrap();
        let err = client
            .test(&b"x"[..], Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, AppError::Remote(ErrorCode::Timeout)));

        drop(client);
        assert!(app.registry().lookup(HANDLE_LOOPBACK).is_none());
    }
}
