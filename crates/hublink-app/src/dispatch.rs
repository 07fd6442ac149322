//! Inbound datagram routing and timeout synthesis.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::context::AppContext;
use crate::endpoint::EndpointContext;
use crate::error::AppError;
use crate::header::{AppHeader, AppMessage, ErrorCode, MessageType};
use crate::registry::RegisteredEndpoint;
use crate::tracker::ResponseMatch;

/// What [`AppContext::dispatch_frame`] did with a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran and returned `error`.
    Delivered { error: ErrorCode },
    /// No handler ran. `response` is the error response sent back to the
    /// peer, present only when the datagram was a request.
    Rejected {
        error: ErrorCode,
        response: Option<AppMessage>,
    },
    /// A response that matched no pending request; dropped.
    Stale,
    /// Too short to carry an App header; dropped.
    Dropped,
}

impl AppContext {
    /// Route one inbound datagram to its endpoint.
    pub fn dispatch_frame(&self, frame: &[u8]) -> DispatchOutcome {
        let message = match AppMessage::decode(frame) {
            Ok(message) => message,
            Err(AppError::TruncatedHeader { len }) => {
                warn!(len, "dropping datagram shorter than app header");
                return DispatchOutcome::Dropped;
            }
            Err(err) => {
                // Never answered: the peer could not decode our reply either.
                warn!(%err, "rejecting datagram");
                return DispatchOutcome::Rejected {
                    error: ErrorCode::InvalidCommand,
                    response: None,
                };
            }
        };

        let header = message.header;
        let Some(entry) = self.registry().lookup(header.handle) else {
            warn!(handle = header.handle, "datagram for unregistered handle");
            return self.reject(&header, ErrorCode::InvalidArg);
        };
        if entry.descriptor.kind != header.message_type.receiver_kind() {
            warn!(
                handle = header.handle,
                message_type = ?header.message_type,
                kind = ?entry.descriptor.kind,
                "datagram type does not match endpoint kind"
            );
            return self.reject(&header, ErrorCode::InvalidArg);
        }
        // Error responses carry only a header and must still reach their request.
        let error_response = header.message_type.is_response() && !header.error.is_ok();
        if !error_response && message.payload.len() < entry.descriptor.min_payload_len {
            warn!(
                handle = header.handle,
                len = message.payload.len(),
                min = entry.descriptor.min_payload_len,
                "datagram shorter than endpoint minimum"
            );
            return self.reject(&header, ErrorCode::InvalidArg);
        }

        match header.message_type {
            MessageType::ClientRequest | MessageType::ServiceRequest => {
                self.dispatch_request(&entry, &message)
            }
            MessageType::ServiceResponse | MessageType::ClientResponse => {
                self.dispatch_response(&entry, &message)
            }
            MessageType::ClientNotification | MessageType::ServiceNotification => {
                let ctx = EndpointContext::new(self, header.handle);
                let error = entry.endpoint.dispatch_notification(&ctx, &message);
                if !error.is_ok() {
                    debug!(handle = header.handle, command = header.command, ?error, "notification not handled");
                }
                DispatchOutcome::Delivered { error }
            }
        }
    }

    /// Expire every pending request whose deadline passed and deliver a
    /// synthesized [`ErrorCode::Timeout`] response for each.
    ///
    /// Returns the number of requests expired.
    pub fn scan_for_timeouts(&self, now: Instant) -> usize {
        let expired = self.lock_tracker().take_expired(now);
        if expired.is_empty() {
            return 0;
        }
        self.inner.slot_freed.notify_all();

        for request in &expired {
            warn!(
                handle = request.handle,
                command = request.command,
                transaction = request.transaction,
                "request timed out"
            );
            let Some(entry) = self.registry().lookup(request.handle) else {
                error!(handle = request.handle, "timed out request has no endpoint");
                continue;
            };
            let response = AppMessage::new(
                AppHeader {
                    handle: request.handle,
                    message_type: MessageType::response_to(entry.descriptor.kind),
                    transaction: request.transaction,
                    error: ErrorCode::Timeout,
                    command: request.command,
                },
                Bytes::new(),
            );
            let ctx = EndpointContext::new(self, request.handle);
            entry.endpoint.dispatch_response(&ctx, &response);
            self.wake_waiter(&response);
        }
        expired.len()
    }

    fn dispatch_request(&self, entry: &RegisteredEndpoint, request: &AppMessage) -> DispatchOutcome {
        let header = request.header;
        if header.command >= entry.descriptor.command_count {
            warn!(handle = header.handle, command = header.command, "request for unknown command");
            return self.reject(&header, ErrorCode::InvalidCommand);
        }

        self.lock_tracker()
            .open_incoming(header.handle, header.command, header.transaction, Instant::now());

        let ctx = EndpointContext::new(self, header.handle);
        let error = entry.endpoint.dispatch_request(&ctx, request);
        if error.is_ok() {
            return DispatchOutcome::Delivered { error };
        }

        // Answer on the handler's behalf unless it already did.
        let still_open = self
            .lock_tracker()
            .close_incoming(header.handle, header.command, header.transaction, Instant::now())
            .is_some();
        if still_open {
            if let Err(err) = self.transmit_response(&header, error, Bytes::new()) {
                warn!(%err, handle = header.handle, "failed to send error response");
            }
        }
        DispatchOutcome::Delivered { error }
    }

    fn dispatch_response(&self, entry: &RegisteredEndpoint, response: &AppMessage) -> DispatchOutcome {
        let header = response.header;
        if header.command >= entry.descriptor.command_count {
            warn!(handle = header.handle, command = header.command, "response for unknown command");
            return DispatchOutcome::Stale;
        }

        let matched = self.lock_tracker().complete_request(
            header.handle,
            header.command,
            header.transaction,
            Instant::now(),
        );
        match matched {
            ResponseMatch::Matched { latency } => {
                self.inner.slot_freed.notify_all();
                debug!(
                    handle = header.handle,
                    command = header.command,
                    transaction = header.transaction,
                    ?latency,
                    "response received"
                );
            }
            ResponseMatch::Mismatch { expected } => {
                warn!(
                    handle = header.handle,
                    command = header.command,
                    transaction = header.transaction,
                    expected,
                    "dropping response with unexpected transaction"
                );
                return DispatchOutcome::Stale;
            }
            ResponseMatch::NotPending => {
                warn!(
                    handle = header.handle,
                    command = header.command,
                    transaction = header.transaction,
                    "dropping response with no pending request"
                );
                return DispatchOutcome::Stale;
            }
        }

        let ctx = EndpointContext::new(self, header.handle);
        let error = entry.endpoint.dispatch_response(&ctx, response);
        self.wake_waiter(response);
        DispatchOutcome::Delivered { error }
    }

    fn reject(&self, header: &AppHeader, error: ErrorCode) -> DispatchOutcome {
        let response = header
            .response(error)
            .map(|header| AppMessage::new(header, Bytes::new()));
        if let Some(response) = &response {
            if !self.inner.transport.send_frame(response.encode()) {
                warn!(handle = header.handle, "transport rejected error response");
            }
        }
        DispatchOutcome::Rejected { error, response }
    }
}
