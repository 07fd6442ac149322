use std::sync::mpsc::{self, RecvTimeoutError, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use hublink_transport::LinkHandler;

use crate::context::AppContext;
use crate::error::Result;

/// Unit of work for the dispatch thread.
#[derive(Debug)]
pub enum WorkItem {
    Frame(Bytes),
    Reset,
    LinkEstablished,
    Shutdown,
}

/// Link-facing side of the worker queue. Attach it to a transport.
pub struct WorkQueue {
    tx: Sender<WorkItem>,
}

impl WorkQueue {
    fn push(&self, item: WorkItem) {
        if self.tx.send(item).is_err() {
            debug!("app worker gone, dropping link event");
        }
    }
}

impl LinkHandler for WorkQueue {
    fn on_frame_received(&self, frame: Bytes) {
        self.push(WorkItem::Frame(frame));
    }

    fn on_reset_detected(&self) {
        self.push(WorkItem::Reset);
    }

    fn on_link_established(&self) {
        self.push(WorkItem::LinkEstablished);
    }
}

/// Thread that dispatches inbound traffic for one [`AppContext`] and expires
/// overdue requests.
///
/// Shuts down on drop.
pub struct AppWorker {
    queue: Arc<WorkQueue>,
    handle: Option<JoinHandle<()>>,
}

impl AppWorker {
    pub fn spawn(app: AppContext) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(app.config().worker_thread_name.clone())
            .spawn(move || run(app, rx))?;
        Ok(Self {
            queue: Arc::new(WorkQueue { tx }),
            handle: Some(handle),
        })
    }

    /// Handler to attach to the transport's inbound side.
    pub fn link_handler(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Stop the thread after it drains queued items.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.queue.push(WorkItem::Shutdown);
        if handle.join().is_err() {
            warn!("app worker panicked");
        }
    }
}

impl Drop for AppWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(app: AppContext, rx: Receiver<WorkItem>) {
    let interval = app.config().timeout_scan_interval;
    debug!("app worker started");
    loop {
        let wait = match app.next_timeout() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(interval),
            None => interval,
        };
        match rx.recv_timeout(wait) {
            Ok(WorkItem::Frame(frame)) => {
                app.dispatch_frame(&frame);
            }
            Ok(WorkItem::Reset) => app.on_reset(),
            Ok(WorkItem::LinkEstablished) => app.on_link_established(),
            Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        app.scan_for_timeouts(Instant::now());
    }
    debug!("app worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::config::AppConfig;
    use crate::endpoint::{Endpoint, EndpointContext, EndpointDescriptor, Version};
    use crate::header::{AppMessage, ErrorCode};
    use crate::test_support::CapturingTransport;

    #[derive(Default)]
    struct Timeouts(AtomicU32);

    impl Endpoint for Timeouts {
        fn dispatch_response(&self, _ctx: &EndpointContext<'_>, response: &AppMessage) -> ErrorCode {
            if response.header.error == ErrorCode::Timeout {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            ErrorCode::None
        }
    }

    #[test]
    fn worker_expires_requests_on_its_own() {
        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let endpoint = Arc::new(Timeouts::default());
        let handle = app
            .register_endpoint(
                EndpointDescriptor::client(Uuid::from_u128(1), Version::new(1, 0, 0), 1),
                endpoint.clone(),
            )
            .unwrap();
        let worker = AppWorker::spawn(app.clone()).unwrap();

        app.send_request_with_timeout(handle, 0, Bytes::new(), Some(Duration::from_millis(10)))
            .unwrap();

        let give_up = Instant::now() + Duration::from_secs(5);
        while endpoint.0.load(Ordering::SeqCst) == 0 && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);
        assert!(!app.is_request_pending(handle, 0));
        worker.shutdown();
    }

    #[test]
    fn link_events_reach_the_context() {
        #[derive(Default)]
        struct Resets(AtomicU32);

        impl Endpoint for Resets {
            fn notify_reset(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let app = AppContext::new(AppConfig::default(), Arc::new(CapturingTransport::default()))
            .unwrap();
        let endpoint = Arc::new(Resets::default());
        app.register_endpoint(
            EndpointDescriptor::service(Uuid::from_u128(2), "r", Version::new(1, 0, 0), 1),
            endpoint.clone(),
        )
        .unwrap();

        let worker = AppWorker::spawn(app).unwrap();
        let queue = worker.link_handler();
        queue.on_reset_detected();
        // Shutdown drains everything queued before it.
        drop(worker);
        assert_eq!(endpoint.0.load(Ordering::SeqCst), 1);

        // Events after shutdown are dropped quietly.
        queue.on_frame_received(Bytes::from_static(b"late"));
    }
}
