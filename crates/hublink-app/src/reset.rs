use tracing::info;

use crate::context::AppContext;

impl AppContext {
    /// The transport reset: every exchange in flight is gone.
    ///
    /// Clears all request state without synthesizing responses, wakes
    /// blocked callers with [`crate::AppError::Reset`], then tells every
    /// endpoint.
    pub fn on_reset(&self) {
        let pending = {
            let mut tracker = self.lock_tracker();
            let pending = tracker.pending_count();
            tracker.clear();
            // Under the tracker guard: a request begun after the clear keeps its waiter.
            self.lock_waiters().clear();
            pending
        };
        self.inner.slot_freed.notify_all();

        let entries = self.registry().entries();
        info!(pending, endpoints = entries.len(), "link reset");
        for entry in entries {
            entry.endpoint.notify_reset();
        }
    }

    /// The transport is ready to carry traffic again.
    pub fn on_link_established(&self) {
        let entries = self.registry().entries();
        info!(endpoints = entries.len(), "link established");
        for entry in entries {
            entry.endpoint.notify_link_established();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;
    use uuid::Uuid;

    use crate::config::AppConfig;
    use crate::endpoint::{Endpoint, EndpointContext, EndpointDescriptor, Version};
    use crate::error::AppError;
    use crate::header::{AppMessage, ErrorCode};
    use crate::test_support::CapturingTransport;

    use super::*;

    #[derive(Default)]
    struct Counting {
        resets: AtomicU32,
        ups: AtomicU32,
        responses: AtomicU32,
    }

    impl Endpoint for Counting {
        fn dispatch_response(&self, _ctx: &EndpointContext<'_>, _response: &AppMessage) -> ErrorCode {
            self.responses.fetch_add(1, Ordering::SeqCst);
            ErrorCode::None
        }

        fn notify_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_link_established(&self) {
            self.ups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reset_clears_pending_without_synthesizing_responses() {
        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let endpoint = Arc::new(Counting::default());
        let handle = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(5), Version::new(1, 0, 0), 1),
                endpoint.clone(),
            )
            .unwrap();
        app.send_request_with_timeout(handle, 0, Bytes::new(), Some(Duration::from_millis(1)))
            .unwrap();

        app.on_reset();
        assert!(!app.is_request_pending(handle, 0));
        assert_eq!(app.next_timeout(), None);
        assert_eq!(endpoint.resets.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(app.scan_for_timeouts(std::time::Instant::now()), 0);
        assert_eq!(endpoint.responses.load(Ordering::SeqCst), 0);

        // Slot is usable again.
        app.send_request(handle, 0, Bytes::new()).unwrap();

        app.on_link_established();
        assert_eq!(endpoint.ups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_wakes_blocked_waiter() {
        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let handle = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(6), Version::new(1, 0, 0), 1),
                Arc::new(Counting::default()),
            )
            .unwrap();

        let waiter = {
            let app = app.clone();
            thread::spawn(move || {
                app.send_request_and_wait(handle, 0, Bytes::new(), Duration::from_secs(10))
            })
        };
        while !app.is_request_pending(handle, 0) {
            thread::sleep(Duration::from_millis(1));
        }
        app.on_reset();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(AppError::Reset)));
    }

    #[test]
    fn request_begun_during_reset_keeps_its_waiter() {
        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let handle = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(7), Version::new(1, 0, 0), 1),
                Arc::new(Counting::default()),
            )
            .unwrap();

        // Stall the reset partway through so a caller can start behind it.
        let waiters = app.lock_waiters();
        let resetter = {
            let app = app.clone();
            thread::spawn(move || app.on_reset())
        };
        thread::sleep(Duration::from_millis(50));
        let caller = {
            let app = app.clone();
            thread::spawn(move || {
                app.send_request_and_wait(handle, 0, Bytes::new(), Duration::from_millis(100))
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(waiters);

        resetter.join().unwrap();
        let response = caller.join().unwrap().unwrap();
        assert_eq!(response.header.error, ErrorCode::Timeout);
        assert!(!app.is_request_pending(handle, 0));
    }
}
