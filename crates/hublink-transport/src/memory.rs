use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::traits::{LinkHandler, Transport};

type HandlerSlot = RwLock<Option<Arc<dyn LinkHandler>>>;

struct Shared {
    up: AtomicBool,
    ends: [HandlerSlot; 2],
}

/// One end of an in-process link.
///
/// Datagrams sent on one end are delivered synchronously to the handler
/// attached to the other end, on the sending thread. The handler is expected
/// to queue them (the App worker does).
#[derive(Clone)]
pub struct MemoryLink {
    shared: Arc<Shared>,
    side: usize,
}

impl MemoryLink {
    /// Create a connected pair. The link starts up.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let shared = Arc::new(Shared {
            up: AtomicBool::new(true),
            ends: [RwLock::new(None), RwLock::new(None)],
        });
        (
            MemoryLink {
                shared: Arc::clone(&shared),
                side: 0,
            },
            MemoryLink { shared, side: 1 },
        )
    }

    /// Attach the handler that receives this end's inbound events.
    pub fn attach(&self, handler: Arc<dyn LinkHandler>) {
        *write_slot(&self.shared.ends[self.side]) = Some(handler);
    }

    /// Detach this end's handler; datagrams sent towards it are refused.
    pub fn detach(&self) {
        *write_slot(&self.shared.ends[self.side]) = None;
    }

    /// Whether the link currently carries datagrams.
    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }

    /// Take the link down or bring it back up.
    ///
    /// Going down reports a reset to both ends; coming up reports
    /// link-established to both ends.
    pub fn set_up(&self, up: bool) {
        let was_up = self.shared.up.swap(up, Ordering::AcqRel);
        if was_up == up {
            return;
        }
        debug!(up, "memory link state changed");
        for handler in self.handlers() {
            if up {
                handler.on_link_established();
            } else {
                handler.on_reset_detected();
            }
        }
    }

    /// Simulate a transport reset that recovers immediately.
    pub fn reset(&self) {
        debug!("memory link reset");
        for handler in self.handlers() {
            handler.on_reset_detected();
        }
        for handler in self.handlers() {
            handler.on_link_established();
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn LinkHandler>> {
        self.shared
            .ends
            .iter()
            .filter_map(|slot| read_slot(slot).clone())
            .collect()
    }
}

impl Transport for MemoryLink {
    fn send_frame(&self, frame: Bytes) -> bool {
        if !self.is_up() {
            return false;
        }
        let remote = read_slot(&self.shared.ends[1 - self.side]).clone();
        match remote {
            Some(handler) => {
                handler.on_frame_received(frame);
                true
            }
            None => false,
        }
    }
}

fn read_slot(slot: &HandlerSlot) -> std::sync::RwLockReadGuard<'_, Option<Arc<dyn LinkHandler>>> {
    match slot.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_slot(
    slot: &HandlerSlot,
) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn LinkHandler>>> {
    match slot.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        resets: Mutex<u32>,
        ups: Mutex<u32>,
    }

    impl LinkHandler for Recorder {
        fn on_frame_received(&self, frame: Bytes) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }

        fn on_reset_detected(&self) {
            *self.resets.lock().unwrap() += 1;
        }

        fn on_link_established(&self) {
            *self.ups.lock().unwrap() += 1;
        }
    }

    #[test]
    fn frames_are_delivered_to_the_other_end() {
        let (a, b) = MemoryLink::pair();
        let at_a = Arc::new(Recorder::default());
        let at_b = Arc::new(Recorder::default());
        a.attach(at_a.clone());
        b.attach(at_b.clone());

        assert!(a.send_frame(Bytes::from_static(b"to-b")));
        assert!(b.send_frame(Bytes::from_static(b"to-a")));

        assert_eq!(*at_b.frames.lock().unwrap(), vec![b"to-b".to_vec()]);
        assert_eq!(*at_a.frames.lock().unwrap(), vec![b"to-a".to_vec()]);
    }

    #[test]
    fn send_without_remote_handler_is_refused() {
        let (a, _b) = MemoryLink::pair();
        assert!(!a.send_frame(Bytes::from_static(b"nobody")));
    }

    #[test]
    fn link_down_refuses_and_reports_reset() {
        let (a, b) = MemoryLink::pair();
        let at_a = Arc::new(Recorder::default());
        let at_b = Arc::new(Recorder::default());
        a.attach(at_a.clone());
        b.attach(at_b.clone());

        a.set_up(false);
        assert!(!b.send_frame(Bytes::from_static(b"dropped")));
        assert_eq!(*at_a.resets.lock().unwrap(), 1);
        assert_eq!(*at_b.resets.lock().unwrap(), 1);

        // Repeating the same state is not an edge.
        a.set_up(false);
        assert_eq!(*at_a.resets.lock().unwrap(), 1);

        b.set_up(true);
        assert_eq!(*at_a.ups.lock().unwrap(), 1);
        assert!(b.send_frame(Bytes::from_static(b"delivered")));
        assert_eq!(at_a.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_reports_reset_then_up() {
        let (a, b) = MemoryLink::pair();
        let at_b = Arc::new(Recorder::default());
        b.attach(at_b.clone());

        a.reset();
        assert_eq!(*at_b.resets.lock().unwrap(), 1);
        assert_eq!(*at_b.ups.lock().unwrap(), 1);
        assert!(a.is_up());
    }
}
