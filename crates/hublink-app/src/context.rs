use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use hublink_transport::Transport;

use crate::config::AppConfig;
use crate::endpoint::{Endpoint, EndpointDescriptor};
use crate::error::{AppError, Result};
use crate::header::{AppHeader, AppMessage, ErrorCode, Handle, MessageType, HANDLE_LOOPBACK};
use crate::loopback::LoopbackService;
use crate::registry::EndpointRegistry;
use crate::tracker::{ExpiredRequest, TransactionId, TransactionTracker};

pub(crate) type WaitKey = (Handle, u16, TransactionId);

/// One App-layer instance bound to a single transport.
///
/// Cheap to clone; clones share the registry, tracker and transport. Inbound
/// traffic enters through [`AppContext::dispatch_frame`] (normally driven by
/// [`crate::AppWorker`]); outbound requests may be sent from any thread.
#[derive(Clone)]
pub struct AppContext {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: AppConfig,
    pub(crate) registry: EndpointRegistry,
    pub(crate) tracker: Mutex<TransactionTracker>,
    /// Signalled whenever an outgoing slot stops being pending.
    pub(crate) slot_freed: Condvar,
    /// Callers blocked in `send_request_and_wait`. Dropping a sender wakes its
    /// caller with [`AppError::Reset`].
    pub(crate) waiters: Mutex<HashMap<WaitKey, SyncSender<AppMessage>>>,
    pub(crate) transport: Arc<dyn Transport>,
}

struct SendOptions {
    timeout: Option<Duration>,
    max_wait: Option<Duration>,
    waiter: Option<SyncSender<AppMessage>>,
}

impl AppContext {
    /// Create a context that sends through `transport`.
    pub fn new(config: AppConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let enable_loopback = config.enable_loopback;
        let app = Self {
            inner: Arc::new(Inner {
                registry: EndpointRegistry::new(config.max_endpoints),
                config,
                tracker: Mutex::new(TransactionTracker::new()),
                slot_freed: Condvar::new(),
                waiters: Mutex::new(HashMap::new()),
                transport,
            }),
        };
        if enable_loopback {
            app.register_endpoint_at(
                HANDLE_LOOPBACK,
                LoopbackService::descriptor(),
                Arc::new(LoopbackService),
            )?;
        }
        Ok(app)
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    /// Register an endpoint at the lowest free negotiated handle.
    pub fn register_endpoint(
        &self,
        descriptor: EndpointDescriptor,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Handle> {
        self.inner.registry.register(descriptor, endpoint)
    }

    /// Register an endpoint at a predefined handle.
    pub fn register_endpoint_at(
        &self,
        handle: Handle,
        descriptor: EndpointDescriptor,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Handle> {
        self.inner.registry.register_at(handle, descriptor, endpoint)
    }

    /// Remove an endpoint and forget its request slots.
    ///
    /// Callers waiting on one of its requests are woken with
    /// [`AppError::Reset`].
    pub fn unregister_endpoint(&self, handle: Handle) -> bool {
        if self.inner.registry.unregister(handle).is_none() {
            return false;
        }
        self.lock_tracker().remove_endpoint(handle);
        self.inner.slot_freed.notify_all();
        self.lock_waiters().retain(|&(owner, _, _), _| owner != handle);
        true
    }

    /// Send a request using the descriptor's (or the default) timeout.
    pub fn send_request(
        &self,
        handle: Handle,
        command: u16,
        payload: impl Into<Bytes>,
    ) -> Result<TransactionId> {
        let timeout = self.request_timeout(handle)?;
        self.start_request(
            handle,
            command,
            payload.into(),
            SendOptions {
                timeout,
                max_wait: None,
                waiter: None,
            },
        )
    }

    /// Send a request with an explicit timeout. `None` never times out.
    pub fn send_request_with_timeout(
        &self,
        handle: Handle,
        command: u16,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<TransactionId> {
        self.start_request(
            handle,
            command,
            payload.into(),
            SendOptions {
                timeout,
                max_wait: None,
                waiter: None,
            },
        )
    }

    /// Send a request, waiting up to `max_wait` for a busy slot to free up.
    ///
    /// Still fails with [`AppError::Busy`] if the slot stays pending.
    pub fn send_request_or_fail(
        &self,
        handle: Handle,
        command: u16,
        payload: impl Into<Bytes>,
        max_wait: Duration,
    ) -> Result<TransactionId> {
        let timeout = self.request_timeout(handle)?;
        self.start_request(
            handle,
            command,
            payload.into(),
            SendOptions {
                timeout,
                max_wait: Some(max_wait),
                waiter: None,
            },
        )
    }

    /// Send a request and block until its response arrives.
    ///
    /// The request times out after `timeout`; the synthesized
    /// [`ErrorCode::Timeout`] response is returned like a real one. Inspect
    /// `header.error` on the returned message. A link reset while waiting
    /// yields [`AppError::Reset`].
    pub fn send_request_and_wait(
        &self,
        handle: Handle,
        command: u16,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<AppMessage> {
        let (tx, rx) = mpsc::sync_channel(1);
        let transaction = self.start_request(
            handle,
            command,
            payload.into(),
            SendOptions {
                timeout: Some(timeout),
                max_wait: None,
                waiter: Some(tx),
            },
        )?;

        match rx.recv_timeout(timeout) {
            Ok(response) => return Ok(response),
            Err(RecvTimeoutError::Disconnected) => return Err(AppError::Reset),
            Err(RecvTimeoutError::Timeout) => {}
        }

        // No worker got to the deadline first. Expire this request only;
        // endpoint handlers stay on the worker thread.
        let expired = {
            let mut tracker = self.lock_tracker();
            let expired = tracker.expire_request(handle, command, transaction);
            if expired.is_some() {
                self.lock_waiters().remove(&(handle, command, transaction));
            }
            expired
        };
        if let Some(request) = expired {
            self.inner.slot_freed.notify_all();
            warn!(handle, command, transaction, "request timed out");
            return self.timeout_response(&request);
        }

        // Completed elsewhere; its delivery is on the way.
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Disconnected) => Err(AppError::Reset),
            Err(RecvTimeoutError::Timeout) => {
                self.lock_waiters()
                    .remove(&(handle, command, transaction));
                Err(AppError::WaitTimedOut(timeout))
            }
        }
    }

    /// Answer a request received by a local endpoint.
    pub fn send_response(
        &self,
        request: &AppHeader,
        error: ErrorCode,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let latency = self.lock_tracker().close_incoming(
            request.handle,
            request.command,
            request.transaction,
            Instant::now(),
        );
        if latency.is_none() {
            debug!(
                handle = request.handle,
                command = request.command,
                transaction = request.transaction,
                "responding to a request that is no longer open"
            );
        }
        self.transmit_response(request, error, payload.into())
    }

    /// Send a notification from a local endpoint.
    pub fn send_notification(
        &self,
        handle: Handle,
        command: u16,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let entry = self
            .inner
            .registry
            .lookup(handle)
            .ok_or(AppError::UnknownHandle(handle))?;
        let message = AppMessage::new(
            AppHeader {
                handle,
                message_type: MessageType::notification_from(entry.descriptor.kind),
                transaction: 0,
                error: ErrorCode::None,
                command,
            },
            payload,
        );
        if !self.inner.transport.send_frame(message.encode()) {
            return Err(AppError::TransportRejected { handle, command });
        }
        Ok(())
    }

    /// Whether a request on `(handle, command)` awaits its response.
    pub fn is_request_pending(&self, handle: Handle, command: u16) -> bool {
        self.lock_tracker().is_pending(handle, command)
    }

    /// Earliest pending request deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.lock_tracker().next_deadline()
    }

    pub(crate) fn transmit_response(
        &self,
        request: &AppHeader,
        error: ErrorCode,
        payload: Bytes,
    ) -> Result<()> {
        let header = request
            .response(error)
            .ok_or(AppError::InvalidMessageType {
                handle: request.handle,
                message_type: request.message_type as u8,
            })?;
        let message = AppMessage::new(header, payload);
        if !self.inner.transport.send_frame(message.encode()) {
            return Err(AppError::TransportRejected {
                handle: request.handle,
                command: request.command,
            });
        }
        Ok(())
    }

    /// Hand a correlated (or synthesized) response to a blocked caller.
    pub(crate) fn wake_waiter(&self, response: &AppMessage) {
        let header = &response.header;
        let waiter = self
            .lock_waiters()
            .remove(&(header.handle, header.command, header.transaction));
        if let Some(waiter) = waiter {
            // The caller may have given up already.
            let _ = waiter.try_send(response.clone());
        }
    }

    /// The response delivered in place of one that never arrived.
    pub(crate) fn timeout_response(&self, request: &ExpiredRequest) -> Result<AppMessage> {
        let entry = self
            .inner
            .registry
            .lookup(request.handle)
            .ok_or(AppError::UnknownHandle(request.handle))?;
        Ok(AppMessage::new(
            AppHeader {
                handle: request.handle,
                message_type: MessageType::response_to(entry.descriptor.kind),
                transaction: request.transaction,
                error: ErrorCode::Timeout,
                command: request.command,
            },
            Bytes::new(),
        ))
    }

    pub(crate) fn lock_tracker(&self) -> MutexGuard<'_, TransactionTracker> {
        match self.inner.tracker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn lock_waiters(&self) -> MutexGuard<'_, HashMap<WaitKey, SyncSender<AppMessage>>> {
        match self.inner.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn request_timeout(&self, handle: Handle) -> Result<Option<Duration>> {
        let entry = self
            .inner
            .registry
            .lookup(handle)
            .ok_or(AppError::UnknownHandle(handle))?;
        Ok(entry
            .descriptor
            .request_timeout
            .or(self.inner.config.default_request_timeout))
    }

    fn start_request(
        &self,
        handle: Handle,
        command: u16,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<TransactionId> {
        let entry = self
            .inner
            .registry
            .lookup(handle)
            .ok_or(AppError::UnknownHandle(handle))?;
        let command_count = entry.descriptor.command_count;
        if command >= command_count {
            return Err(AppError::InvalidCommand {
                handle,
                command,
                command_count,
            });
        }

        let transaction = {
            let mut tracker = self.lock_tracker();
            if let Some(max_wait) = options.max_wait {
                let deadline = Instant::now() + max_wait;
                while tracker.is_pending(handle, command) {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tracker = match self.inner.slot_freed.wait_timeout(tracker, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }

            let transaction =
                tracker.begin_request(handle, command, options.timeout, Instant::now())?;
            // Registered under the tracker lock so a timeout scan cannot
            // complete the request before its waiter exists.
            if let Some(waiter) = options.waiter {
                self.lock_waiters()
                    .insert((handle, command, transaction), waiter);
            }
            transaction
        };

        let message = AppMessage::new(
            AppHeader {
                handle,
                message_type: MessageType::request_from(entry.descriptor.kind),
                transaction,
                error: ErrorCode::None,
                command,
            },
            payload,
        );
        debug!(handle, command, transaction, "sending request");

        if self.inner.transport.send_frame(message.encode()) {
            return Ok(transaction);
        }

        let rolled_back = self
            .lock_tracker()
            .abort_request(handle, command, transaction);
        if !rolled_back {
            // Already completed (timed out) before the rejection was seen.
            return Ok(transaction);
        }
        self.inner.slot_freed.notify_all();
        self.lock_waiters()
            .remove(&(handle, command, transaction));
        warn!(handle, command, transaction, "transport rejected request");
        Err(AppError::TransportRejected { handle, command })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use uuid::Uuid;

    use super::*;
    use crate::endpoint::{EndpointContext, Version};
    use crate::test_support::CapturingTransport;

    struct Inert;

    impl Endpoint for Inert {}

    fn context() -> (AppContext, Arc<CapturingTransport>, Handle) {
        let transport = Arc::new(CapturingTransport::default());
        let app = AppContext::new(AppConfig::default(), transport.clone()).unwrap();
        let handle = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(1), Version::new(1, 0, 0), 2),
                Arc::new(Inert),
            )
            .unwrap();
        (app, transport, handle)
    }

    #[test]
    fn request_goes_out_with_client_request_type() {
        let (app, transport, handle) = context();
        let transaction = app.send_request(handle, 1, &b"hi"[..]).unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.handle, handle);
        assert_eq!(sent[0].header.message_type, MessageType::ClientRequest);
        assert_eq!(sent[0].header.transaction, transaction);
        assert_eq!(sent[0].header.command, 1);
        assert_eq!(sent[0].payload.as_ref(), b"hi");
        assert!(app.is_request_pending(handle, 1));
        assert!(app.next_timeout().is_some());
    }

    #[test]
    fn second_request_on_pending_slot_is_busy_and_not_sent() {
        let (app, transport, handle) = context();
        app.send_request(handle, 0, Bytes::new()).unwrap();
        let err = app.send_request(handle, 0, Bytes::new()).unwrap_err();
        assert!(matches!(err, AppError::Busy { .. }));
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn command_outside_slot_table_is_rejected() {
        let (app, transport, handle) = context();
        let err = app.send_request(handle, 2, Bytes::new()).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidCommand {
                command: 2,
                command_count: 2,
                ..
            }
        ));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let (app, _, _) = context();
        assert!(matches!(
            app.send_request(0x30, 0, Bytes::new()),
            Err(AppError::UnknownHandle(0x30))
        ));
    }

    #[test]
    fn transport_rejection_rolls_back_the_slot() {
        let (app, transport, handle) = context();
        transport.refuse.store(true, Ordering::SeqCst);
        let err = app.send_request(handle, 0, Bytes::new()).unwrap_err();
        assert!(matches!(err, AppError::TransportRejected { command: 0, .. }));
        assert!(!app.is_request_pending(handle, 0));

        transport.refuse.store(false, Ordering::SeqCst);
        app.send_request(handle, 0, Bytes::new()).unwrap();
    }

    #[test]
    fn send_or_fail_waits_for_slot_to_free() {
        let (app, _, handle) = context();
        let first = app
            .send_request_with_timeout(handle, 0, Bytes::new(), None)
            .unwrap();

        let responder = app.clone();
        let answer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let response = AppMessage::new(
                AppHeader {
                    handle,
                    message_type: MessageType::ServiceResponse,
                    transaction: first,
                    error: ErrorCode::None,
                    command: 0,
                },
                Bytes::new(),
            );
            responder.dispatch_frame(&response.encode());
        });

        let second = app
            .send_request_or_fail(handle, 0, Bytes::new(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(second, first.wrapping_add(1));
        answer.join().unwrap();
    }

    #[test]
    fn send_or_fail_reports_busy_after_max_wait() {
        let (app, _, handle) = context();
        app.send_request_with_timeout(handle, 0, Bytes::new(), None)
            .unwrap();
        let started = Instant::now();
        let err = app
            .send_request_or_fail(handle, 0, Bytes::new(), Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, AppError::Busy { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn send_and_wait_returns_synthesized_timeout_without_worker() {
        let (app, _, handle) = context();
        let response = app
            .send_request_and_wait(handle, 1, Bytes::new(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(response.header.error, ErrorCode::Timeout);
        assert_eq!(response.header.message_type, MessageType::ServiceResponse);
        assert!(!app.is_request_pending(handle, 1));
    }

    #[derive(Default)]
    struct CountingResponses(AtomicU32);

    impl Endpoint for CountingResponses {
        fn dispatch_response(&self, _ctx: &EndpointContext<'_>, _response: &AppMessage) -> ErrorCode {
            self.0.fetch_add(1, Ordering::SeqCst);
            ErrorCode::None
        }
    }

    #[test]
    fn send_and_wait_expires_only_its_own_request() {
        let (app, _, _) = context();
        let waiting_ep = Arc::new(CountingResponses::default());
        let waiting = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(2), Version::new(1, 0, 0), 1),
                waiting_ep.clone(),
            )
            .unwrap();
        let other_ep = Arc::new(CountingResponses::default());
        let other = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(3), Version::new(1, 0, 0), 1),
                other_ep.clone(),
            )
            .unwrap();
        app.send_request_with_timeout(other, 0, Bytes::new(), Some(Duration::from_millis(1)))
            .unwrap();

        let response = app
            .send_request_and_wait(waiting, 0, Bytes::new(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(response.header.error, ErrorCode::Timeout);
        assert!(!app.is_request_pending(waiting, 0));
        assert_eq!(waiting_ep.0.load(Ordering::SeqCst), 0);

        // The overdue request is left for the worker's scan.
        assert!(app.is_request_pending(other, 0));
        assert_eq!(other_ep.0.load(Ordering::SeqCst), 0);
        assert_eq!(app.scan_for_timeouts(Instant::now()), 1);
        assert_eq!(other_ep.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_senders_on_one_slot_get_exactly_one_transaction() {
        const SENDERS: usize = 8;
        let (app, transport, handle) = context();
        let barrier = Arc::new(Barrier::new(SENDERS));

        let senders: Vec<_> = (0..SENDERS)
            .map(|_| {
                let app = app.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    app.send_request(handle, 0, Bytes::new())
                })
            })
            .collect();
        let results: Vec<_> = senders.into_iter().map(|t| t.join().unwrap()).collect();

        let sent: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(sent.len(), 1);
        for result in &results {
            if let Err(err) = result {
                assert!(
                    matches!(err, AppError::Busy { command: 0, transaction, .. } if transaction == sent[0]),
                    "unexpected {err:?}"
                );
            }
        }
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn unregister_clears_slots() {
        let (app, _, handle) = context();
        app.send_request(handle, 0, Bytes::new()).unwrap();
        assert!(app.unregister_endpoint(handle));
        assert!(!app.is_request_pending(handle, 0));
        assert!(!app.unregister_endpoint(handle));
    }

    #[test]
    fn notification_uses_endpoint_kind() {
        let (app, transport, handle) = context();
        app.send_notification(handle, 1, &b"n"[..]).unwrap();
        let sent = transport.sent();
        assert_eq!(sent[0].header.message_type, MessageType::ClientNotification);
        assert_eq!(sent[0].header.transaction, 0);
    }

    #[test]
    fn loopback_registered_when_enabled() {
        let config = AppConfig {
            enable_loopback: true,
            ..AppConfig::default()
        };
        let app = AppContext::new(config, Arc::new(CapturingTransport::default())).unwrap();
        assert!(app.registry().lookup(HANDLE_LOOPBACK).is_some());
    }
}
